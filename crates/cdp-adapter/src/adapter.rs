//! Event translation and page commands on top of a [`CdpTransport`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dashmap::DashMap;
use network_tap_light::{
    config::TapConfig, MaintenanceHandle, NetworkTapLight, PageKey, TapError, TapEvent,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{NavigateOptions, Navigation, ScreenshotClip};
use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::events::{ConsoleLevel, ConsoleSource, RawEvent};
use crate::ids::PageId;
use crate::metrics::{AdapterMetrics, AdapterMetricsSnapshot};
use crate::registry::Registry;
use crate::transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};
use crate::util::timestamp_now;
use crate::EventStream;

pub type EventBus = broadcast::Sender<RawEvent>;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

/// Page-level browser operations the audit engine relies on.
#[async_trait]
pub trait Cdp: Send + Sync {
    /// Opens a blank tab and enables the domains whose events are republished.
    async fn open_page(&self) -> Result<PageId, AdapterError>;
    async fn navigate(
        &self,
        page: PageId,
        url: &str,
        opts: &NavigateOptions,
    ) -> Result<Navigation, AdapterError>;
    async fn evaluate_script(&self, page: PageId, expression: &str)
        -> Result<Value, AdapterError>;
    /// PNG of the whole document, not just the viewport.
    async fn screenshot_full_page(&self, page: PageId) -> Result<Vec<u8>, AdapterError>;
    async fn close_page(&self, page: PageId) -> Result<(), AdapterError>;
    fn subscribe(&self) -> EventStream;
}

#[derive(Clone, Debug)]
struct InflightRequest {
    page: PageId,
    method: String,
}

pub struct CdpAdapter {
    pub cfg: CdpConfig,
    bus: EventBus,
    registry: Arc<Registry>,
    metrics: Arc<AdapterMetrics>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    transport: Arc<dyn CdpTransport>,
    requests: DashMap<String, InflightRequest>,
    network_tap: Arc<NetworkTapLight>,
    tap_maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl CdpAdapter {
    /// Adapter over a real Chromium, launched from `cfg.executable` or attached via
    /// `cfg.websocket_url`.
    pub fn new(cfg: CdpConfig, bus: EventBus) -> Result<Self, AdapterError> {
        if cfg.websocket_url.is_none() && cfg.executable.as_os_str().is_empty() {
            return Err(AdapterError::new(AdapterErrorKind::Launch)
                .with_hint("no Chrome/Chromium executable found")
                .with_data(json!({
                    "remediation": "install Chromium, set SITEAUDIT_CHROME, or pass --chrome-path / --ws-url"
                })));
        }
        let transport: Arc<dyn CdpTransport> = Arc::new(ChromiumTransport::new(cfg.clone()));
        Self::with_transport(cfg, bus, transport)
    }

    pub fn with_transport(
        cfg: CdpConfig,
        bus: EventBus,
        transport: Arc<dyn CdpTransport>,
    ) -> Result<Self, AdapterError> {
        let metrics = AdapterMetrics::new().map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("metrics registry: {err}"))
        })?;
        let (network_tap, _) = NetworkTapLight::with_config(TapConfig::default(), 256);
        Ok(Self {
            cfg,
            bus,
            registry: Arc::new(Registry::new()),
            metrics: Arc::new(metrics),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            transport,
            requests: DashMap::new(),
            network_tap: Arc::new(network_tap),
            tap_maintenance: Mutex::new(None),
        })
    }

    /// Replaces the network tap tuning. Only meaningful before [`CdpAdapter::start`].
    pub fn with_tap_config(mut self, config: TapConfig) -> Self {
        let (network_tap, _) = NetworkTapLight::with_config(config, 256);
        self.network_tap = Arc::new(network_tap);
        self
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> AdapterMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn render_metrics(&self) -> Result<String, AdapterError> {
        self.metrics.render()
    }

    pub async fn start(self: Arc<Self>) -> Result<(), AdapterError> {
        if !self.tasks.lock().await.is_empty() {
            return Ok(());
        }

        self.transport.start().await?;

        {
            let mut maintenance = self.tap_maintenance.lock().await;
            if maintenance.is_none() {
                *maintenance = Some(self.network_tap.spawn_maintenance());
            }
        }

        let event_loop = tokio::spawn(Self::event_loop(Arc::clone(&self)));
        let idle_watch = self.spawn_idle_watch();
        let mut tasks = self.tasks.lock().await;
        tasks.push(event_loop);
        tasks.push(idle_watch);
        info!(target: "cdp-adapter", owns_browser = self.cfg.owns_browser(), "adapter started");
        Ok(())
    }

    /// Stops the background tasks and closes the browser if the adapter launched it.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        let was_started = !tasks.is_empty();
        self.shutdown.cancel();

        if was_started && self.cfg.owns_browser() {
            if let Err(err) = self.send_browser_command("Browser.close", json!({})).await {
                debug!(target: "cdp-adapter", ?err, "Browser.close failed");
            }
        }

        while let Some(handle) = tasks.pop() {
            let _ = handle.await;
        }
        if let Some(handle) = self.tap_maintenance.lock().await.take() {
            let _ = handle.shutdown().await;
        }
    }

    fn tap_key(page: PageId) -> PageKey {
        PageKey(page.0)
    }

    async fn tap_ingest(&self, page: PageId, event: TapEvent) {
        let key = Self::tap_key(page);
        if let Err(TapError::PageNotEnabled) = self.network_tap.ingest(key, event.clone()).await {
            self.network_tap.enable(key);
            if let Err(err) = self.network_tap.ingest(key, event).await {
                warn!(target: "cdp-adapter", ?err, "network tap ingest failed");
            }
        }
    }

    /// Counts pages entering network idle, for the metrics dump.
    fn spawn_idle_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = adapter.network_tap.bus.subscribe();
            let mut idle: HashMap<PageKey, bool> = HashMap::new();
            loop {
                tokio::select! {
                    _ = adapter.shutdown.cancelled() => break,
                    summary = rx.recv() => match summary {
                        Ok(summary) => {
                            let was_idle = idle.insert(summary.page, summary.snapshot.quiet);
                            if summary.snapshot.quiet && was_idle != Some(true) {
                                adapter.metrics.record_network_idle();
                                debug!(
                                    target: "cdp-adapter",
                                    page = %summary.page.0,
                                    requests = summary.snapshot.requests,
                                    "page network idle"
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    async fn event_loop(self: Arc<Self>) {
        debug!(target: "cdp-adapter", "event loop entered");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.transport.next_event() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        if !self.shutdown.is_cancelled() {
                            self.handle_transport_disconnect();
                        }
                        break;
                    }
                }
            }
        }
        debug!(target: "cdp-adapter", "event loop exiting");
    }

    fn handle_transport_disconnect(&self) {
        warn!(target: "cdp-adapter", "browser connection lost");
        for page in self.registry.clear() {
            let _ = self.network_tap.disable(Self::tap_key(page));
            self.emit(RawEvent::PageLifecycle {
                page,
                phase: "closed".into(),
                ts: timestamp_now(),
            });
        }
        self.requests.clear();
        self.emit(RawEvent::Error {
            page: None,
            message: "browser connection lost".into(),
        });
    }

    async fn handle_event(&self, event: TransportEvent) {
        let page = self.registry.page_for_session(event.session_id.as_deref());
        let method = event.method.clone();
        if let Err(err) = self.process_event(event).await {
            warn!(target: "cdp-adapter", %method, %err, "dropping malformed cdp event");
            self.emit(RawEvent::Error {
                page,
                message: format!("{method}: {err}"),
            });
        }
    }

    async fn process_event(&self, event: TransportEvent) -> Result<(), AdapterError> {
        match event.method.as_str() {
            "Target.targetCreated" => self.on_target_created(event.params),
            "Target.attachedToTarget" => self.on_target_attached(event.params),
            "Target.detachedFromTarget" => self.on_target_detached(event.params),
            "Target.targetDestroyed" => self.on_target_destroyed(event.params),
            "Page.lifecycleEvent" => self.on_page_lifecycle(event),
            "Page.frameNavigated" => self.on_frame_navigated(event),
            "Runtime.consoleAPICalled" => self.on_console_api(event),
            "Log.entryAdded" => self.on_log_entry(event),
            "Runtime.exceptionThrown" => self.on_exception_thrown(event),
            "Network.requestWillBeSent" => self.on_request(event).await,
            "Network.responseReceived" => self.on_response(event).await,
            "Network.loadingFinished" | "Network.loadingFailed" => {
                self.on_loading_done(event).await
            }
            _ => {
                debug!(target: "cdp-adapter", method = %event.method, "unhandled cdp event");
                Ok(())
            }
        }
    }

    fn on_target_created(&self, params: Value) -> Result<(), AdapterError> {
        let payload: TargetCreatedParams = decode(params)?;
        if payload.target_info.target_type != "page" {
            return Ok(());
        }
        let page = self
            .registry
            .insert_target(&payload.target_info.target_id, payload.target_info.url);
        self.network_tap.enable(Self::tap_key(page));
        self.emit(RawEvent::PageLifecycle {
            page,
            phase: "opened".into(),
            ts: timestamp_now(),
        });
        Ok(())
    }

    fn on_target_attached(&self, params: Value) -> Result<(), AdapterError> {
        let payload: AttachedToTargetParams = decode(params)?;
        if payload.target_info.target_type != "page" {
            return Ok(());
        }
        // Attach can race ahead of targetCreated.
        self.registry
            .insert_target(&payload.target_info.target_id, payload.target_info.url);
        if let Some(page) = self
            .registry
            .bind_session(&payload.target_info.target_id, &payload.session_id)
        {
            self.network_tap.enable(Self::tap_key(page));
            self.emit(RawEvent::PageLifecycle {
                page,
                phase: "attached".into(),
                ts: timestamp_now(),
            });
        }
        Ok(())
    }

    fn on_target_detached(&self, params: Value) -> Result<(), AdapterError> {
        let payload: DetachedFromTargetParams = decode(params)?;
        self.registry.unbind_session(&payload.session_id);
        Ok(())
    }

    fn on_target_destroyed(&self, params: Value) -> Result<(), AdapterError> {
        let payload: TargetDestroyedParams = decode(params)?;
        if let Some(page) = self.registry.remove_target(&payload.target_id) {
            self.requests.retain(|_, req| req.page != page);
            let _ = self.network_tap.disable(Self::tap_key(page));
            self.emit(RawEvent::PageLifecycle {
                page,
                phase: "closed".into(),
                ts: timestamp_now(),
            });
        }
        Ok(())
    }

    fn on_page_lifecycle(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: LifecycleParams = decode(event.params)?;
        if let Some(page) = self.registry.page_for_session(event.session_id.as_deref()) {
            self.emit(RawEvent::PageLifecycle {
                page,
                phase: payload.name.to_ascii_lowercase(),
                ts: timestamp_now(),
            });
        }
        Ok(())
    }

    fn on_frame_navigated(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: FrameNavigatedParams = decode(event.params)?;
        if payload.frame.parent_id.is_some() {
            return Ok(());
        }
        if let Some(page) = self.registry.page_for_session(event.session_id.as_deref()) {
            self.registry.set_recent_url(&page, payload.frame.url.clone());
            self.emit(RawEvent::PageNavigated {
                page,
                url: payload.frame.url,
                ts: timestamp_now(),
            });
        }
        Ok(())
    }

    fn on_console_api(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: ConsoleApiParams = decode(event.params)?;
        let Some(page) = self.registry.page_for_session(event.session_id.as_deref()) else {
            return Ok(());
        };
        let text = payload
            .args
            .iter()
            .map(RemoteObject::render)
            .collect::<Vec<_>>()
            .join(" ");
        self.emit(RawEvent::ConsoleMessage {
            page,
            level: ConsoleLevel::from_api_type(&payload.kind),
            source: ConsoleSource::Api,
            text,
            ts: timestamp_now(),
        });
        Ok(())
    }

    fn on_log_entry(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: LogEntryParams = decode(event.params)?;
        if payload.entry.source == "worker" {
            return Ok(());
        }
        let Some(page) = self.registry.page_for_session(event.session_id.as_deref()) else {
            return Ok(());
        };
        let text = match payload.entry.url.filter(|url| !url.is_empty()) {
            Some(url) if !payload.entry.text.contains(&url) => {
                format!("{} ({url})", payload.entry.text)
            }
            _ => payload.entry.text,
        };
        self.emit(RawEvent::ConsoleMessage {
            page,
            level: ConsoleLevel::from_log_level(&payload.entry.level),
            source: ConsoleSource::Browser,
            text,
            ts: timestamp_now(),
        });
        Ok(())
    }

    fn on_exception_thrown(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: ExceptionThrownParams = decode(event.params)?;
        let Some(page) = self.registry.page_for_session(event.session_id.as_deref()) else {
            return Ok(());
        };
        let details = payload.exception_details;
        let description = details
            .exception
            .as_ref()
            .and_then(|ex| ex.description.clone().or_else(|| ex.value.as_ref().map(|v| v.to_string())));

        let message = description
            .as_deref()
            .and_then(|desc| desc.lines().next())
            .map(str::to_string)
            .or(details.text.clone())
            .unwrap_or_else(|| "uncaught exception".to_string());

        let stack = details
            .stack_trace
            .as_ref()
            .filter(|trace| !trace.call_frames.is_empty())
            .map(StackTrace::render)
            .or_else(|| description.filter(|desc| desc.contains('\n')));

        self.emit(RawEvent::ExceptionThrown {
            page,
            message,
            stack,
            ts: timestamp_now(),
        });
        Ok(())
    }

    async fn on_request(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: RequestWillBeSentParams = decode(event.params)?;
        let Some(page) = self.registry.page_for_session(event.session_id.as_deref()) else {
            return Ok(());
        };
        self.requests.insert(
            payload.request_id.clone(),
            InflightRequest {
                page,
                method: payload.request.method,
            },
        );
        self.tap_ingest(
            page,
            TapEvent::RequestStarted {
                request_id: payload.request_id,
            },
        )
        .await;
        Ok(())
    }

    async fn on_response(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: ResponseReceivedParams = decode(event.params)?;
        let Some(page) = self.registry.page_for_session(event.session_id.as_deref()) else {
            return Ok(());
        };
        let method = self
            .requests
            .get(&payload.request_id)
            .map(|req| req.method.clone())
            .unwrap_or_else(|| "GET".to_string());

        self.tap_ingest(
            page,
            TapEvent::ResponseReceived {
                request_id: payload.request_id,
                status: payload.response.status,
            },
        )
        .await;
        self.emit(RawEvent::ResponseReceived {
            page,
            url: payload.response.url,
            status: payload.response.status,
            method,
            ts: timestamp_now(),
        });
        Ok(())
    }

    async fn on_loading_done(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let failed = event.method == "Network.loadingFailed";
        let payload: LoadingDoneParams = decode(event.params)?;
        let page = self
            .requests
            .remove(&payload.request_id)
            .map(|(_, req)| req.page)
            .or_else(|| self.registry.page_for_session(event.session_id.as_deref()));
        if let Some(page) = page {
            let request_id = payload.request_id;
            let tap_event = if failed {
                TapEvent::RequestFailed { request_id }
            } else {
                TapEvent::RequestFinished { request_id }
            };
            self.tap_ingest(page, tap_event).await;
        }
        Ok(())
    }

    fn emit(&self, event: RawEvent) {
        self.metrics.record_event(event_kind(&event));
        let _ = self.bus.send(event);
    }

    async fn wait_for_session(&self, target_id: &str) -> Result<PageId, AdapterError> {
        let deadline = Instant::now() + ATTACH_TIMEOUT;
        loop {
            if let Some(page) = self.registry.page_for_target(target_id) {
                if self.registry.cdp_session(&page).is_some() {
                    return Ok(page);
                }
            }
            if Instant::now() >= deadline {
                return Err(AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("timed out waiting for target {target_id} to attach")));
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    async fn wait_for_dom_ready(&self, page: PageId, deadline: Instant) -> Result<(), AdapterError> {
        loop {
            if Instant::now() >= deadline {
                return Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                    .with_hint("document did not become ready in time"));
            }

            let ready = match self
                .send_page_command(
                    page,
                    "Runtime.evaluate",
                    json!({
                        "expression": "document.readyState",
                        "returnByValue": true,
                    }),
                )
                .await
            {
                Ok(response) => response
                    .get("result")
                    .and_then(|v| v.get("value"))
                    .and_then(Value::as_str)
                    .map(|state| matches!(state, "interactive" | "complete"))
                    .unwrap_or(false),
                // The execution context is torn down while the new document commits.
                Err(err) if err.retriable => {
                    debug!(target: "cdp-adapter", %err, "readyState probe failed; retrying");
                    false
                }
                Err(err) => return Err(err),
            };

            if ready {
                return Ok(());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_network_idle(
        &self,
        page: PageId,
        deadline: Instant,
    ) -> Result<(), AdapterError> {
        let key = Self::tap_key(page);
        loop {
            match self.network_tap.snapshot(key).await {
                Some(snapshot) if snapshot.quiet => return Ok(()),
                Some(_) => {}
                None => self.network_tap.enable(key),
            }
            if Instant::now() >= deadline {
                return Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                    .with_hint("network did not become idle in time"));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn send_browser_command(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        self.send_command(CommandTarget::Browser, method, params)
            .await
    }

    async fn send_page_command(
        &self,
        page: PageId,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let session = self.registry.cdp_session(&page).ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::PageNotFound)
                .with_hint(format!("no cdp session for page {}", page.0))
        })?;
        self.send_command(CommandTarget::Session(session), method, params)
            .await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let start = Instant::now();
        self.metrics.record_command(method);
        match self.transport.send_command(target, method, params).await {
            Ok(value) => {
                self.metrics.record_command_success(method, start.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.metrics.record_command_failure(method);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Cdp for CdpAdapter {
    async fn open_page(&self) -> Result<PageId, AdapterError> {
        let response = self
            .send_browser_command("Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let target_id = response
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint("Target.createTarget returned no targetId")
            })?
            .to_string();

        let page = self.wait_for_session(&target_id).await?;
        for (method, params) in [
            ("Page.enable", json!({})),
            ("Page.setLifecycleEventsEnabled", json!({ "enabled": true })),
            ("Runtime.enable", json!({})),
            ("Log.enable", json!({})),
            ("Network.enable", json!({})),
        ] {
            self.send_page_command(page, method, params).await?;
        }
        info!(target: "cdp-adapter", page = %page.0, %target_id, "page opened");
        Ok(page)
    }

    async fn navigate(
        &self,
        page: PageId,
        url: &str,
        opts: &NavigateOptions,
    ) -> Result<Navigation, AdapterError> {
        let started = Instant::now();
        let deadline = started + opts.timeout;

        let response = self
            .send_page_command(page, "Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(error_text) = response
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            return Err(AdapterError::new(AdapterErrorKind::NavFailed)
                .with_hint(error_text.to_string())
                .with_data(json!({ "url": url, "errorText": error_text })));
        }
        self.registry.set_recent_url(&page, url.to_string());

        self.wait_for_dom_ready(page, deadline).await?;
        if opts.wait_network_idle {
            self.wait_for_network_idle(page, deadline).await?;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(target: "cdp-adapter", page = %page.0, %url, elapsed_ms, "navigation settled");
        Ok(Navigation {
            url: url.to_string(),
            loader_id: response
                .get("loaderId")
                .and_then(Value::as_str)
                .map(str::to_string),
            elapsed_ms,
        })
    }

    async fn evaluate_script(
        &self,
        page: PageId,
        expression: &str,
    ) -> Result<Value, AdapterError> {
        let response = self
            .send_page_command(
                page,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;

        if let Some(details) = response.get("exceptionDetails") {
            return Err(AdapterError::new(AdapterErrorKind::Script)
                .with_hint("script raised an exception")
                .with_data(details.clone()));
        }

        Ok(response
            .get("result")
            .and_then(|res| res.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn screenshot_full_page(&self, page: PageId) -> Result<Vec<u8>, AdapterError> {
        let layout = self
            .send_page_command(page, "Page.getLayoutMetrics", json!({}))
            .await?;

        let mut params = json!({ "format": "png", "captureBeyondViewport": true });
        if let Some(clip) = ScreenshotClip::full_page(&layout) {
            params["clip"] = serde_json::to_value(clip).map_err(|err| {
                AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string())
            })?;
        }

        let response = self
            .send_page_command(page, "Page.captureScreenshot", params)
            .await?;
        let data = response
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal).with_hint("missing screenshot data")
            })?;
        STANDARD
            .decode(data)
            .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))
    }

    async fn close_page(&self, page: PageId) -> Result<(), AdapterError> {
        let entry = self.registry.get(&page).ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::PageNotFound)
                .with_hint(format!("unknown page {}", page.0))
        })?;
        self.send_browser_command(
            "Target.closeTarget",
            json!({ "targetId": entry.target_id }),
        )
        .await
        .map(|_| ())
    }

    fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }
}

fn decode<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, AdapterError> {
    serde_json::from_value(params)
        .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))
}

fn event_kind(event: &RawEvent) -> &'static str {
    match event {
        RawEvent::PageLifecycle { .. } => "lifecycle",
        RawEvent::PageNavigated { .. } => "navigated",
        RawEvent::ConsoleMessage { .. } => "console",
        RawEvent::ExceptionThrown { .. } => "exception",
        RawEvent::ResponseReceived { .. } => "response",
        RawEvent::Error { .. } => "error",
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    target_id: String,
    #[serde(rename = "type")]
    target_type: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetCreatedParams {
    target_info: TargetInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachedToTargetParams {
    session_id: String,
    target_info: TargetInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetachedFromTargetParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetDestroyedParams {
    target_id: String,
}

#[derive(Debug, Deserialize)]
struct LifecycleParams {
    name: String,
}

#[derive(Debug, Deserialize)]
struct FrameNavigatedParams {
    frame: FramePayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FramePayload {
    url: String,
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConsoleApiParams {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    args: Vec<RemoteObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteObject {
    #[serde(rename = "type")]
    kind: String,
    value: Option<Value>,
    description: Option<String>,
    unserializable_value: Option<String>,
}

impl RemoteObject {
    fn render(&self) -> String {
        match (&self.value, &self.unserializable_value, &self.description) {
            (Some(Value::String(text)), _, _) => text.clone(),
            (Some(value), _, _) => value.to_string(),
            (None, Some(raw), _) => raw.clone(),
            (None, None, Some(description)) => description.clone(),
            (None, None, None) => self.kind.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogEntryParams {
    entry: LogEntry,
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    source: String,
    level: String,
    text: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionThrownParams {
    exception_details: ExceptionDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionDetails {
    text: Option<String>,
    exception: Option<ExceptionObject>,
    stack_trace: Option<StackTrace>,
}

#[derive(Debug, Deserialize)]
struct ExceptionObject {
    description: Option<String>,
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackTrace {
    #[serde(default)]
    call_frames: Vec<CallFrame>,
}

impl StackTrace {
    fn render(&self) -> String {
        self.call_frames
            .iter()
            .map(|frame| {
                let name = if frame.function_name.is_empty() {
                    "<anonymous>"
                } else {
                    frame.function_name.as_str()
                };
                format!(
                    "    at {name} ({}:{}:{})",
                    frame.url,
                    frame.line_number + 1,
                    frame.column_number + 1
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallFrame {
    #[serde(default)]
    function_name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    line_number: i64,
    #[serde(default)]
    column_number: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWillBeSentParams {
    request_id: String,
    request: RequestPayload,
}

#[derive(Debug, Deserialize)]
struct RequestPayload {
    method: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseReceivedParams {
    request_id: String,
    response: ResponsePayload,
}

#[derive(Debug, Deserialize)]
struct ResponsePayload {
    url: String,
    status: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingDoneParams {
    request_id: String,
}
