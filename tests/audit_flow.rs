//! End-to-end audit runs against a scripted page.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_adapter::{
    event_bus, AdapterError, AdapterErrorKind, ConsoleLevel as RawLevel, ConsoleSource, EventBus,
    EventStream, Navigation, PageId, RawEvent,
};
use parking_lot::Mutex;
use serde_json::Value;
use siteaudit_cli::audit::{
    run_audit, AuditPage, AuditPlan, AuditStatus, EventKind, RouteOutcome, RouteSpec, Severity,
    SeverityPolicy, WalkOptions,
};
use siteaudit_cli::errors::{AuditError, AuditResult};
use siteaudit_cli::sink::{persist, Collections, JsonlSink, Sink};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use url::Url;

enum Script {
    Emit(Vec<RawEvent>),
    Hang,
    Fail(&'static str),
}

struct FakePage {
    id: PageId,
    bus: EventBus,
    _keepalive: EventStream,
    scripts: HashMap<String, Script>,
    visited: Mutex<Vec<String>>,
    scrolls: AtomicUsize,
    scroll_error: Option<&'static str>,
    screenshot_error: Option<&'static str>,
}

impl FakePage {
    fn new() -> Self {
        let (bus, keepalive) = event_bus(256);
        Self {
            id: PageId::new(),
            bus,
            _keepalive: keepalive,
            scripts: HashMap::new(),
            visited: Mutex::new(Vec::new()),
            scrolls: AtomicUsize::new(0),
            scroll_error: None,
            screenshot_error: None,
        }
    }

    fn failing_scrolls(mut self) -> Self {
        self.scroll_error = Some("Execution context was destroyed");
        self
    }

    fn failing_screenshots(mut self) -> Self {
        self.screenshot_error = Some("Unable to capture screenshot");
        self
    }

    fn on(mut self, path: &str, script: Script) -> Self {
        self.scripts.insert(path.to_string(), script);
        self
    }

    fn console(&self, level: RawLevel, text: &str) -> RawEvent {
        RawEvent::ConsoleMessage {
            page: self.id,
            level,
            source: ConsoleSource::Api,
            text: text.to_string(),
            ts: now_ms(),
        }
    }

    fn response(&self, status: i64, url: &str) -> RawEvent {
        RawEvent::ResponseReceived {
            page: self.id,
            url: url.to_string(),
            status,
            method: "GET".into(),
            ts: now_ms(),
        }
    }

    fn visited(&self) -> Vec<String> {
        self.visited.lock().clone()
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[async_trait]
impl AuditPage for FakePage {
    async fn goto(&self, url: &Url, _timeout: Duration) -> Result<Navigation, AdapterError> {
        let path = url.path().to_string();
        self.visited.lock().push(path.clone());
        match self.scripts.get(&path) {
            Some(Script::Emit(events)) => {
                for event in events {
                    let _ = self.bus.send(event.clone());
                }
            }
            Some(Script::Hang) => tokio::time::sleep(Duration::from_secs(3600)).await,
            Some(Script::Fail(reason)) => {
                return Err(AdapterError::new(AdapterErrorKind::NavFailed).with_hint(*reason))
            }
            None => {}
        }
        Ok(Navigation {
            url: url.to_string(),
            loader_id: None,
            elapsed_ms: 1,
        })
    }

    fn events(&self) -> EventStream {
        self.bus.subscribe()
    }

    async fn evaluate(&self, _script: &str) -> Result<Value, AdapterError> {
        self.scrolls.fetch_add(1, Ordering::SeqCst);
        match self.scroll_error {
            Some(reason) => Err(AdapterError::new(AdapterErrorKind::Script).with_hint(reason)),
            None => Ok(Value::Null),
        }
    }

    async fn screenshot_full_page(&self) -> Result<Vec<u8>, AdapterError> {
        match self.screenshot_error {
            Some(reason) => Err(AdapterError::new(AdapterErrorKind::CdpIo).with_hint(reason)),
            None => Ok(b"\x89PNG\r\n\x1a\n".to_vec()),
        }
    }

    fn page_id(&self) -> Option<PageId> {
        Some(self.id)
    }
}

fn routes(n: usize) -> Vec<RouteSpec> {
    (1..=n)
        .map(|i| RouteSpec::new(format!("Route {i}"), format!("/r{i}")))
        .collect()
}

fn plan(routes: Vec<RouteSpec>) -> AuditPlan {
    AuditPlan {
        base_url: Url::parse("http://app.test").unwrap(),
        routes,
        walk: WalkOptions {
            navigation_timeout: Duration::from_millis(200),
            dwell: Duration::from_millis(30),
            scroll_pause: Duration::from_millis(5),
            screenshot_dir: None,
        },
        policy: SeverityPolicy::default(),
    }
}

#[tokio::test]
async fn all_clean_run_passes() {
    let page = FakePage::new();
    let record = run_audit(&page, &plan(routes(3)), &CancellationToken::new()).await;

    assert_eq!(record.status(), AuditStatus::Passed);
    assert!(record.summary.counts_by_severity.is_empty());
    assert_eq!(record.summary.total_routes, 3);
    assert_eq!(record.walk.count(RouteOutcome::Visited), 3);
    assert_eq!(page.visited(), vec!["/r1", "/r2", "/r3"]);
    assert_eq!(page.scrolls.load(Ordering::SeqCst), 6);
    assert!(!record.interrupted());
}

#[tokio::test]
async fn one_server_error_fails_the_audit() {
    let page = FakePage::new();
    let events = vec![
        page.response(200, "http://app.test/api/ok"),
        page.response(500, "http://app.test/api/boom"),
    ];
    let page = page.on("/r2", Script::Emit(events));
    let record = run_audit(&page, &plan(routes(3)), &CancellationToken::new()).await;

    assert_eq!(record.summary.count(Severity::Critical), 1);
    assert_eq!(record.status(), AuditStatus::Failed);
    assert_eq!(record.events.len(), 1);
    assert_eq!(record.events[0].route, "Route 2");
    assert_eq!(record.summary.routes_with_any_event, 1);
}

#[tokio::test]
async fn warnings_alone_pass() {
    let mut page = FakePage::new();
    for i in 1..=5 {
        let warning = page.console(RawLevel::Warning, &format!("deprecated call {i}"));
        page = page.on(&format!("/r{i}"), Script::Emit(vec![warning]));
    }
    let record = run_audit(&page, &plan(routes(5)), &CancellationToken::new()).await;

    assert_eq!(record.summary.count(Severity::Warning), 5);
    assert_eq!(record.status(), AuditStatus::Passed);
}

#[tokio::test]
async fn navigation_timeout_does_not_abort_the_walk() {
    let page = FakePage::new();
    let late_error = page.console(RawLevel::Error, "late error");
    let page = page
        .on("/r1", Script::Hang)
        .on("/r3", Script::Emit(vec![late_error]));
    let record = run_audit(&page, &plan(routes(4)), &CancellationToken::new()).await;

    assert_eq!(page.visited(), vec!["/r1", "/r2", "/r3", "/r4"]);
    let failures: Vec<_> = record
        .events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::NavigationFailure { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].route, "Route 1");
    match &failures[0].kind {
        EventKind::NavigationFailure {
            target_route,
            reason,
        } => {
            assert_eq!(target_route, "Route 1");
            assert!(reason.contains("timed out"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(record.walk.visits[0].outcome, RouteOutcome::NavigationFailed);
    assert!(record.walk.visits[1..]
        .iter()
        .all(|v| v.outcome == RouteOutcome::Visited));
    assert_eq!(record.summary.routes_with_any_event, 2);
    assert_eq!(record.status(), AuditStatus::Failed);
}

#[tokio::test]
async fn navigation_errors_keep_the_browser_reason() {
    let page = FakePage::new().on("/r2", Script::Fail("net::ERR_CONNECTION_REFUSED"));
    let record = run_audit(&page, &plan(routes(2)), &CancellationToken::new()).await;

    let visit = record.walk.visit("Route 2").unwrap();
    assert_eq!(visit.outcome, RouteOutcome::NavigationFailed);
    assert!(visit
        .error
        .as_deref()
        .unwrap()
        .contains("ERR_CONNECTION_REFUSED"));
    assert_eq!(record.events.len(), 1);
}

#[tokio::test]
async fn events_are_tagged_with_the_route_being_visited() {
    let mut page = FakePage::new();
    for i in 1..=4 {
        let label = format!("Route {i}");
        let events = vec![
            page.console(RawLevel::Error, &label),
            page.console(RawLevel::Log, "noise"),
            page.response(404, &format!("http://app.test/missing/{i}")),
        ];
        page = page.on(&format!("/r{i}"), Script::Emit(events));
    }
    let configured = routes(4);
    let record = run_audit(&page, &plan(configured.clone()), &CancellationToken::new()).await;

    assert_eq!(record.events.len(), 8);
    for event in &record.events {
        assert!(configured.iter().any(|r| r.label == event.route));
        if let EventKind::Console { message, .. } = &event.kind {
            assert_eq!(message, &event.route);
        }
    }
    assert_eq!(record.summary.count(Severity::High), 4);
    assert_eq!(record.summary.count(Severity::Error), 4);
    assert_eq!(record.status(), AuditStatus::Passed);
}

#[tokio::test]
async fn events_from_other_pages_are_ignored() {
    let page = FakePage::new();
    let foreign = RawEvent::ExceptionThrown {
        page: PageId::new(),
        message: "popup crashed".into(),
        stack: None,
        ts: now_ms(),
    };
    let page = page.on("/r1", Script::Emit(vec![foreign]));
    let record = run_audit(&page, &plan(routes(1)), &CancellationToken::new()).await;
    assert!(record.events.is_empty());
    assert_eq!(record.status(), AuditStatus::Passed);
}

#[tokio::test]
async fn cancellation_skips_remaining_routes() {
    let page = FakePage::new();
    let mut plan = plan(routes(3));
    plan.walk.dwell = Duration::from_secs(30);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let record = run_audit(&page, &plan, &cancel).await;
    assert!(record.interrupted());
    assert_eq!(record.walk.visits.len(), 3);
    assert_eq!(record.walk.visits[0].outcome, RouteOutcome::Visited);
    assert_eq!(record.walk.count(RouteOutcome::Skipped), 2);
    assert_eq!(page.visited(), vec!["/r1"]);
}

#[tokio::test]
async fn screenshots_are_named_after_route_slugs() {
    let dir = tempdir().unwrap();
    let page = FakePage::new();
    let mut plan = plan(vec![
        RouteSpec::new("Home", "/"),
        RouteSpec::new("Patient List", "/patients"),
    ]);
    plan.walk.screenshot_dir = Some(dir.path().to_path_buf());

    let record = run_audit(&page, &plan, &CancellationToken::new()).await;
    assert!(dir.path().join("home.png").exists());
    assert!(dir.path().join("patient-list.png").exists());
    assert_eq!(
        record.walk.visit("Patient List").unwrap().screenshot,
        Some(dir.path().join("patient-list.png"))
    );
}

#[tokio::test]
async fn missing_screenshot_directory_is_not_fatal() {
    let dir = tempdir().unwrap();
    let page = FakePage::new();
    let mut plan = plan(routes(2));
    plan.walk.screenshot_dir = Some(dir.path().join("does-not-exist"));

    let record = run_audit(&page, &plan, &CancellationToken::new()).await;
    assert_eq!(record.walk.count(RouteOutcome::Visited), 2);
    assert!(record.walk.visits.iter().all(|v| v.screenshot.is_none()));
}

#[tokio::test]
async fn scroll_and_screenshot_failures_do_not_stop_the_walk() {
    let dir = tempdir().unwrap();
    let page = FakePage::new().failing_scrolls().failing_screenshots();
    let mut plan = plan(routes(3));
    plan.walk.screenshot_dir = Some(dir.path().to_path_buf());

    let record = run_audit(&page, &plan, &CancellationToken::new()).await;
    assert_eq!(page.visited(), vec!["/r1", "/r2", "/r3"]);
    assert_eq!(page.scrolls.load(Ordering::SeqCst), 6);
    assert_eq!(record.walk.count(RouteOutcome::Visited), 3);
    assert!(record.walk.visits.iter().all(|v| v.screenshot.is_none()));
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    assert!(record.events.is_empty());
    assert_eq!(record.status(), AuditStatus::Passed);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    Open,
    Save,
    HangingSave,
}

#[derive(Default)]
struct SinkLog {
    opened: usize,
    saved: Vec<(String, Value)>,
    closed: usize,
}

struct RecordingSink {
    name: &'static str,
    fault: Fault,
    log: Arc<Mutex<SinkLog>>,
}

impl RecordingSink {
    fn new(name: &'static str, fault: Fault) -> (Box<dyn Sink>, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = Self {
            name,
            fault,
            log: Arc::clone(&log),
        };
        (Box::new(sink), log)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        self.name
    }

    async fn open(&mut self) -> AuditResult<()> {
        self.log.lock().opened += 1;
        if self.fault == Fault::Open {
            return Err(AuditError::persistence(self.name, "connection", "connection refused"));
        }
        Ok(())
    }

    async fn save(&mut self, collection: &str, document: &Value) -> AuditResult<()> {
        match self.fault {
            Fault::Save => Err(AuditError::persistence(self.name, collection, "disk full")),
            Fault::HangingSave => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Fault::None | Fault::Open => {
                self.log
                    .lock()
                    .saved
                    .push((collection.to_string(), document.clone()));
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> AuditResult<()> {
        self.log.lock().closed += 1;
        Ok(())
    }
}

#[tokio::test]
async fn failing_sink_does_not_block_the_others() {
    let page = FakePage::new();
    let crash = RawEvent::ExceptionThrown {
        page: page.id,
        message: "TypeError: undefined is not a function".into(),
        stack: Some("at render (app.js:10:5)".into()),
        ts: now_ms(),
    };
    let page = page.on("/r1", Script::Emit(vec![crash]));
    let record = run_audit(&page, &plan(routes(2)), &CancellationToken::new()).await;

    let dir = tempdir().unwrap();
    let (broken, _) = RecordingSink::new("broken", Fault::Save);
    let mut sinks: Vec<Box<dyn Sink>> = vec![broken, Box::new(JsonlSink::new(dir.path()))];
    let report = persist(
        &record,
        &mut sinks,
        &Collections::default(),
        &CancellationToken::new(),
    )
    .await;

    assert!(!report.all_ok());
    assert_eq!(report.outcomes[0].sink, "broken");
    assert_eq!(report.outcomes[0].errors.len(), 2);
    assert!(report.outcomes[1].is_ok());
    assert_eq!(report.outcomes[1].events_written, 1);
    assert!(report.outcomes[1].summary_written);

    let summary = std::fs::read_to_string(dir.path().join("audit_summaries.jsonl")).unwrap();
    let doc: Value = serde_json::from_str(summary.lines().next().unwrap()).unwrap();
    assert_eq!(doc["overallStatus"], "FAILED");
    assert_eq!(doc["sessionId"], record.session_id.to_string());
    assert_eq!(doc["targetUrl"], "http://app.test/");
}

#[tokio::test]
async fn persist_closes_every_sink_even_after_failures() {
    let page = FakePage::new();
    let failed = page.response(503, "http://app.test/api");
    let page = page.on("/r1", Script::Emit(vec![failed]));
    let record = run_audit(&page, &plan(routes(1)), &CancellationToken::new()).await;

    let (refusing, refusing_log) = RecordingSink::new("refusing", Fault::Open);
    let (broken, broken_log) = RecordingSink::new("broken", Fault::Save);
    let (memory, memory_log) = RecordingSink::new("memory", Fault::None);
    let mut sinks = vec![refusing, broken, memory];
    let collections = Collections::default();
    let report = persist(&record, &mut sinks, &collections, &CancellationToken::new()).await;

    assert_eq!(report.outcomes[0].errors.len(), 1);
    assert!(!report.outcomes[0].summary_written);
    assert_eq!(report.outcomes[1].errors.len(), 2);
    assert!(report.outcomes[2].is_ok());
    for log in [&refusing_log, &broken_log, &memory_log] {
        assert_eq!(log.lock().opened, 1);
        assert_eq!(log.lock().closed, 1);
    }

    let memory = memory_log.lock();
    assert_eq!(memory.saved.len(), 2);
    let (collection, event) = &memory.saved[0];
    assert_eq!(collection, &collections.events);
    assert_eq!(event["type"], "failedResponse");
    assert_eq!(event["httpStatus"], 503);
    assert_eq!(event["route"], "Route 1");
    assert_eq!(event["sessionId"], record.session_id.to_string());
    let (collection, summary) = &memory.saved[1];
    assert_eq!(collection, &collections.summary);
    assert_eq!(summary["countsBySeverity"]["CRITICAL"], 1);
}

#[tokio::test]
async fn interrupted_persistence_closes_the_stuck_sink_and_skips_the_rest() {
    let page = FakePage::new();
    let record = run_audit(&page, &plan(routes(1)), &CancellationToken::new()).await;

    let (stuck, stuck_log) = RecordingSink::new("stuck", Fault::HangingSave);
    let (later, later_log) = RecordingSink::new("later", Fault::None);
    let mut sinks = vec![stuck, later];
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        persist(&record, &mut sinks, &Collections::default(), &cancel),
    )
    .await
    .expect("persistence stops once interrupted");

    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes[0]
        .errors
        .iter()
        .any(|err| err.contains("interrupted")));
    assert_eq!(stuck_log.lock().closed, 1);
    assert!(!report.outcomes[1].is_ok());
    assert_eq!(later_log.lock().opened, 0);
    assert_eq!(later_log.lock().closed, 0);
}
