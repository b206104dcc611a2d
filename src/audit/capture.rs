//! Event capture layer.
//!
//! Subscribes to the adapter's event stream for a single page and records console errors and
//! warnings, uncaught exceptions and HTTP responses with status >= 400 into the session buffer,
//! tagged with the label of the route active when the event is handled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cdp_adapter::{ConsoleLevel as RawConsoleLevel, EventStream, PageId, RawEvent};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::EventBuffer;
use super::model::{CapturedEvent, ConsoleLevel, EventKind};
use super::route::CurrentRoute;
use crate::errors::AuditError;

const DEFAULT_SETTLE: Duration = Duration::from_millis(200);

/// Counters reported when the capture task stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub recorded: u64,
    /// Relevant events that arrived while no route was active.
    pub unrouted: u64,
    /// Events below the capture threshold or belonging to another page.
    pub ignored: u64,
    pub malformed: u64,
    /// Events lost because the subscriber fell behind the bus.
    pub lagged: u64,
}

enum Translation {
    Record(EventKind, u64),
    Ignore,
    Malformed(String),
}

pub struct CaptureLayer {
    buffer: EventBuffer,
    current_route: CurrentRoute,
    page: Option<PageId>,
    settle: Duration,
    attached: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<CaptureStats>>>,
}

impl CaptureLayer {
    pub fn new(buffer: EventBuffer, current_route: CurrentRoute) -> Self {
        Self {
            buffer,
            current_route,
            page: None,
            settle: DEFAULT_SETTLE,
            attached: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Restricts capture to one page; `None` accepts events from every page.
    pub fn for_page(mut self, page: Option<PageId>) -> Self {
        self.page = page;
        self
    }

    /// How long `detach` waits for in-flight events before stopping the task.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Starts the consumer task. Returns `false` if the layer was already attached.
    pub fn attach(&self, events: EventStream) -> bool {
        if self.attached.swap(true, Ordering::SeqCst) {
            warn!(target: "siteaudit::capture", "capture layer already attached; ignoring");
            return false;
        }

        let worker = CaptureWorker {
            buffer: self.buffer.clone(),
            current_route: self.current_route.clone(),
            page: self.page,
            stats: CaptureStats::default(),
        };
        let handle = tokio::spawn(worker.run(events, self.cancel.clone()));
        *self.task.lock() = Some(handle);
        debug!(target: "siteaudit::capture", page = ?self.page.map(|p| p.0), "capture attached");
        true
    }

    /// Stops the consumer task after a short settle and reports what it saw.
    ///
    /// A panicking task surfaces here as [`AuditError::Capture`]; it never reaches the walker.
    pub async fn detach(&self) -> Result<CaptureStats, AuditError> {
        let handle = self.task.lock().take();
        let Some(handle) = handle else {
            return Ok(CaptureStats::default());
        };

        tokio::time::sleep(self.settle).await;
        self.cancel.cancel();

        match handle.await {
            Ok(stats) => {
                info!(
                    target: "siteaudit::capture",
                    recorded = stats.recorded,
                    unrouted = stats.unrouted,
                    malformed = stats.malformed,
                    lagged = stats.lagged,
                    "capture detached"
                );
                Ok(stats)
            }
            Err(err) if err.is_panic() => {
                Err(AuditError::Capture("capture task panicked".to_string()))
            }
            Err(err) => Err(AuditError::Capture(err.to_string())),
        }
    }
}

struct CaptureWorker {
    buffer: EventBuffer,
    current_route: CurrentRoute,
    page: Option<PageId>,
    stats: CaptureStats,
}

impl CaptureWorker {
    async fn run(mut self, mut events: EventStream, cancel: CancellationToken) -> CaptureStats {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.drain(&mut events);
                    break;
                }
                received = events.recv() => match received {
                    Ok(event) => self.handle(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "siteaudit::capture", skipped, "capture fell behind; events lost");
                        self.stats.lagged += skipped;
                    }
                    Err(RecvError::Closed) => {
                        debug!(target: "siteaudit::capture", "event bus closed");
                        break;
                    }
                },
            }
        }
        self.stats
    }

    fn drain(&mut self, events: &mut EventStream) {
        loop {
            match events.try_recv() {
                Ok(event) => self.handle(event),
                Err(TryRecvError::Lagged(skipped)) => self.stats.lagged += skipped,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn handle(&mut self, event: RawEvent) {
        if let Some(page) = self.page {
            if event.page() != Some(page) {
                self.stats.ignored += 1;
                return;
            }
        }

        match translate(&event) {
            Translation::Ignore => self.stats.ignored += 1,
            Translation::Malformed(reason) => {
                warn!(target: "siteaudit::capture", %reason, "dropping malformed event");
                self.stats.malformed += 1;
            }
            Translation::Record(kind, ts) => {
                let Some(route) = self.current_route.get() else {
                    debug!(target: "siteaudit::capture", kind = kind.type_name(), "no active route; event dropped");
                    self.stats.unrouted += 1;
                    return;
                };
                self.buffer
                    .push(CapturedEvent::new(route, timestamp(ts), kind));
                self.stats.recorded += 1;
            }
        }
    }
}

fn translate(event: &RawEvent) -> Translation {
    match event {
        RawEvent::ConsoleMessage {
            level, text, ts, ..
        } => {
            let level = match level {
                RawConsoleLevel::Error => ConsoleLevel::Error,
                RawConsoleLevel::Warning => ConsoleLevel::Warning,
                _ => return Translation::Ignore,
            };
            Translation::Record(
                EventKind::Console {
                    level,
                    message: text.clone(),
                },
                *ts,
            )
        }
        RawEvent::ExceptionThrown {
            message, stack, ts, ..
        } => Translation::Record(
            EventKind::PageException {
                message: message.clone(),
                stack_trace: stack.clone(),
            },
            *ts,
        ),
        RawEvent::ResponseReceived {
            url,
            status,
            method,
            ts,
            ..
        } => {
            if !(100..=599).contains(status) {
                return Translation::Malformed(format!("impossible status {status} for {url}"));
            }
            if *status < 400 {
                return Translation::Ignore;
            }
            Translation::Record(
                EventKind::FailedResponse {
                    http_status: *status as u16,
                    url: url.clone(),
                    method: method.clone(),
                },
                *ts,
            )
        }
        RawEvent::Error { message, .. } => {
            debug!(target: "siteaudit::capture", %message, "adapter error event");
            Translation::Ignore
        }
        RawEvent::PageLifecycle { .. } | RawEvent::PageNavigated { .. } => Translation::Ignore,
    }
}

fn timestamp(ts_ms: u64) -> DateTime<Utc> {
    i64::try_from(ts_ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_adapter::{event_bus, ConsoleSource};

    fn console(page: PageId, level: RawConsoleLevel, text: &str) -> RawEvent {
        RawEvent::ConsoleMessage {
            page,
            level,
            source: ConsoleSource::Api,
            text: text.to_string(),
            ts: 1_700_000_000_000,
        }
    }

    fn response(page: PageId, status: i64) -> RawEvent {
        RawEvent::ResponseReceived {
            page,
            url: "http://localhost/api/items".into(),
            status,
            method: "POST".into(),
            ts: 1_700_000_000_500,
        }
    }

    fn layer(buffer: &EventBuffer, route: &CurrentRoute) -> CaptureLayer {
        CaptureLayer::new(buffer.clone(), route.clone()).with_settle(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn records_only_audit_relevant_events() {
        let (bus, rx) = event_bus(64);
        let buffer = EventBuffer::new();
        let route = CurrentRoute::new();
        route.set("Home");
        let page = PageId::new();
        let capture = layer(&buffer, &route).for_page(Some(page));
        assert!(capture.attach(rx));

        bus.send(console(page, RawConsoleLevel::Log, "hello")).unwrap();
        bus.send(console(page, RawConsoleLevel::Warning, "deprecated api")).unwrap();
        bus.send(console(page, RawConsoleLevel::Error, "boom")).unwrap();
        bus.send(response(page, 200)).unwrap();
        bus.send(response(page, 404)).unwrap();
        bus.send(RawEvent::ExceptionThrown {
            page,
            message: "TypeError: x is undefined".into(),
            stack: Some("at main (app.js:1:1)".into()),
            ts: 1_700_000_001_000,
        })
        .unwrap();

        let stats = capture.detach().await.unwrap();
        assert_eq!(stats.recorded, 4);
        assert_eq!(stats.ignored, 2);

        let events = buffer.snapshot();
        let kinds: Vec<_> = events.iter().map(|e| e.kind.type_name()).collect();
        assert_eq!(
            kinds,
            vec!["console", "console", "failedResponse", "pageException"]
        );
        assert!(events.iter().all(|e| e.route == "Home"));
        assert_eq!(events[0].timestamp.timestamp_millis(), 1_700_000_000_000);
        match &events[2].kind {
            EventKind::FailedResponse {
                http_status,
                method,
                ..
            } => {
                assert_eq!(*http_status, 404);
                assert_eq!(method, "POST");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn ignores_other_pages_and_unrouted_events() {
        let (bus, rx) = event_bus(64);
        let buffer = EventBuffer::new();
        let route = CurrentRoute::new();
        let page = PageId::new();
        let capture = layer(&buffer, &route).for_page(Some(page));
        capture.attach(rx);

        bus.send(console(page, RawConsoleLevel::Error, "before walk")).unwrap();
        bus.send(console(PageId::new(), RawConsoleLevel::Error, "other tab")).unwrap();

        let stats = capture.detach().await.unwrap();
        assert_eq!(stats.unrouted, 1);
        assert_eq!(stats.ignored, 1);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn impossible_status_is_dropped_as_malformed() {
        let (bus, rx) = event_bus(16);
        let buffer = EventBuffer::new();
        let route = CurrentRoute::new();
        route.set("Home");
        let page = PageId::new();
        let capture = layer(&buffer, &route);
        capture.attach(rx);

        bus.send(response(page, 999)).unwrap();
        bus.send(response(page, -1)).unwrap();
        bus.send(response(page, 503)).unwrap();

        let stats = capture.detach().await.unwrap();
        assert_eq!(stats.malformed, 2);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn second_attach_is_a_no_op() {
        let (_bus, rx) = event_bus(4);
        let capture = layer(&EventBuffer::new(), &CurrentRoute::new());
        assert!(capture.attach(rx));
        let (_bus2, rx2) = event_bus(4);
        assert!(!capture.attach(rx2));
        assert!(capture.is_attached());
        capture.detach().await.unwrap();
    }

    #[tokio::test]
    async fn detach_without_attach_reports_nothing() {
        let capture = layer(&EventBuffer::new(), &CurrentRoute::new());
        assert_eq!(capture.detach().await.unwrap(), CaptureStats::default());
    }

    #[tokio::test]
    async fn lagging_subscriber_keeps_running() {
        let (bus, rx) = event_bus(2);
        let buffer = EventBuffer::new();
        let route = CurrentRoute::new();
        route.set("Home");
        let page = PageId::new();
        for i in 0..6 {
            bus.send(console(page, RawConsoleLevel::Error, &format!("e{i}")))
                .unwrap();
        }
        let capture = layer(&buffer, &route);
        capture.attach(rx);
        bus.send(console(page, RawConsoleLevel::Error, "after")).unwrap();

        let stats = capture.detach().await.unwrap();
        assert!(stats.lagged > 0);
        assert!(buffer
            .snapshot()
            .iter()
            .any(|e| e.kind.describe() == "after"));
    }
}
