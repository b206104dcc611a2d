//! Websocket transport to Chromium.
//!
//! `ChromiumTransport` either launches a browser or attaches to `CdpConfig::websocket_url`,
//! then runs a single pump task that multiplexes outgoing commands and incoming
//! responses/events over the chromiumoxide connection.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::{future::BoxFuture, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::util::extract_ws_url;

/// A CDP notification as received from the wire.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Where a command is routed: the browser endpoint or a flattened page session.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;
}

type LinkFactory =
    Arc<dyn Fn(CdpConfig) -> BoxFuture<'static, Result<Arc<Link>, AdapterError>> + Send + Sync>;

#[derive(Clone)]
pub struct ChromiumTransport {
    cfg: CdpConfig,
    link: Arc<OnceCell<Mutex<Option<Arc<Link>>>>>,
    factory: LinkFactory,
}

impl ChromiumTransport {
    pub fn new(cfg: CdpConfig) -> Self {
        let factory: LinkFactory =
            Arc::new(|cfg: CdpConfig| Box::pin(async move { Link::open(cfg).await.map(Arc::new) }));
        Self {
            cfg,
            link: Arc::new(OnceCell::new()),
            factory,
        }
    }

    /// Returns the live link, reconnecting when the previous pump has died.
    async fn link(&self) -> Result<Arc<Link>, AdapterError> {
        let cell = self.link.get_or_init(|| async { Mutex::new(None) }).await;
        let mut guard = cell.lock().await;
        if let Some(link) = guard.as_ref().filter(|link| link.is_alive()) {
            return Ok(Arc::clone(link));
        }
        let link = (self.factory)(self.cfg.clone()).await?;
        *guard = Some(Arc::clone(&link));
        Ok(link)
    }

    #[cfg(test)]
    fn with_factory(cfg: CdpConfig, factory: LinkFactory) -> Self {
        Self {
            cfg,
            link: Arc::new(OnceCell::new()),
            factory,
        }
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.default_deadline_ms)
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        let link = self.link().await?;
        link.call(
            CommandTarget::Browser,
            "Target.setDiscoverTargets",
            json!({ "discover": true }),
            self.deadline(),
        )
        .await?;
        link.call(
            CommandTarget::Browser,
            "Target.setAutoAttach",
            json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": false,
                "flatten": true,
            }),
            self.deadline(),
        )
        .await?;
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        match self.link().await {
            Ok(link) => link.next_event().await,
            Err(err) => {
                warn!(target: "cdp-transport", ?err, "transport not ready");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        self.link()
            .await?
            .call(target, method, params, self.deadline())
            .await
    }
}

type Responder = oneshot::Sender<Result<Value, AdapterError>>;

struct PendingCall {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: Responder,
}

/// One live websocket connection plus the tasks that service it.
struct Link {
    calls: mpsc::Sender<PendingCall>,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    pump: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
}

impl Link {
    async fn open(cfg: CdpConfig) -> Result<Self, AdapterError> {
        let (child, ws_url) = match cfg.websocket_url.clone() {
            Some(url) => (None, url),
            None => {
                let browser_cfg = browser_config(&cfg)?;
                let (child, url) = launch(browser_cfg).await?;
                (Some(child), url)
            }
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

        let (calls_tx, calls_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let alive = Arc::new(AtomicBool::new(true));

        let pump_alive = Arc::clone(&alive);
        let pump = tokio::spawn(async move {
            if let Err(err) = pump(conn, calls_rx, events_tx).await {
                error!(target: "cdp-transport", ?err, "transport pump terminated with error");
            }
            pump_alive.store(false, Ordering::Relaxed);
        });

        let heartbeat = spawn_heartbeat(
            calls_tx.clone(),
            Arc::clone(&alive),
            Duration::from_millis(cfg.heartbeat_interval_ms),
            Duration::from_millis(cfg.default_deadline_ms.min(5_000)),
        );

        info!(target: "cdp-transport", url = %ws_url, "chromium connection established");

        Ok(Self {
            calls: calls_tx,
            events: Mutex::new(events_rx),
            pump,
            heartbeat,
            child: Mutex::new(child),
            alive,
        })
    }

    #[cfg(test)]
    fn stub() -> (Arc<Self>, Arc<AtomicBool>) {
        let (calls, _calls_rx) = mpsc::channel(8);
        let (_events_tx, events_rx) = mpsc::channel(8);
        let alive = Arc::new(AtomicBool::new(true));
        let link = Arc::new(Self {
            calls,
            events: Mutex::new(events_rx),
            pump: tokio::spawn(futures::future::pending::<()>()),
            heartbeat: None,
            child: Mutex::new(None),
            alive: Arc::clone(&alive),
        });
        (link, alive)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn call(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, AdapterError> {
        let (responder, response) = oneshot::channel();
        self.calls
            .send(PendingCall {
                target,
                method: method.to_string(),
                params,
                responder,
            })
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("{method}: response channel closed"))),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                .with_hint(format!("{method}: no response within {}ms", deadline.as_millis()))),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.pump.abort();
        if let Some(handle) = &self.heartbeat {
            handle.abort();
        }

        let Ok(mut guard) = self.child.try_lock() else {
            return;
        };
        let Some(mut child) = guard.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = child.kill().await {
                        warn!(target: "cdp-transport", ?err, "failed to kill chromium child");
                    }
                });
            }
            Err(_) => {
                debug!(target: "cdp-transport", "no tokio runtime available to kill chromium child");
            }
        }
    }
}

fn spawn_heartbeat(
    calls: mpsc::Sender<PendingCall>,
    alive: Arc<AtomicBool>,
    every: Duration,
    deadline: Duration,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        while alive.load(Ordering::Relaxed) {
            ticker.tick().await;
            let (responder, response) = oneshot::channel();
            let ping = PendingCall {
                target: CommandTarget::Browser,
                method: "Browser.getVersion".to_string(),
                params: json!({}),
                responder,
            };
            if calls.send(ping).await.is_err() {
                debug!(target: "cdp-transport", "heartbeat stopped: command channel closed");
                break;
            }
            match tokio::time::timeout(deadline, response).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(target: "cdp-transport", ?err, "heartbeat command error");
                    break;
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(target: "cdp-transport", "heartbeat timed out");
                    break;
                }
            }
        }
    }))
}

fn browser_config(cfg: &CdpConfig) -> Result<BrowserConfig, AdapterError> {
    if cfg.executable.as_os_str().is_empty() {
        return Err(AdapterError::new(AdapterErrorKind::Launch)
            .with_hint("no Chrome/Chromium executable found")
            .with_data(json!({
                "remediation": "install Chromium, set SITEAUDIT_CHROME, or pass --chrome-path / --ws-url"
            })));
    }
    if !cfg.executable.exists() {
        return Err(AdapterError::new(AdapterErrorKind::Launch).with_hint(format!(
            "chrome executable not found at {}",
            cfg.executable.display()
        )));
    }

    let profile_dir = if cfg.user_data_dir.is_absolute() {
        cfg.user_data_dir.clone()
    } else {
        std::env::current_dir()
            .map_err(|err| {
                AdapterError::new(AdapterErrorKind::Launch)
                    .with_hint(format!("failed to resolve cwd for user-data-dir: {err}"))
            })?
            .join(&cfg.user_data_dir)
    };
    fs::create_dir_all(&profile_dir).map_err(|err| {
        AdapterError::new(AdapterErrorKind::Launch).with_hint(format!(
            "failed to create user-data-dir {}: {err}",
            profile_dir.display()
        ))
    })?;

    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_millis(cfg.default_deadline_ms))
        .launch_timeout(Duration::from_millis(cfg.launch_timeout_ms))
        .chrome_executable(cfg.executable.clone())
        .user_data_dir(profile_dir);

    if !cfg.headless {
        builder = builder.with_head();
    }
    if cfg.no_sandbox {
        builder = builder.no_sandbox();
    }

    let mut args = vec![
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-breakpad",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-popup-blocking",
        "--disable-sync",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--remote-allow-origins=*",
        "--use-mock-keychain",
    ];
    if cfg.headless {
        args.extend(["--headless=new", "--hide-scrollbars", "--mute-audio"]);
    }

    builder.args(args).build().map_err(|err| {
        AdapterError::new(AdapterErrorKind::Launch).with_hint(format!("browser config error: {err}"))
    })
}

async fn launch(config: BrowserConfig) -> Result<(Child, String), AdapterError> {
    let mut child = config.launch().map_err(|err| {
        AdapterError::new(AdapterErrorKind::Launch)
            .with_hint(format!("failed to launch chromium: {err}"))
    })?;
    let ws_url = extract_ws_url(&mut child).await?;
    Ok((child, ws_url))
}

async fn pump(
    mut conn: Connection<CdpEventMessage>,
    mut calls: mpsc::Receiver<PendingCall>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<(), AdapterError> {
    let mut inflight: HashMap<CallId, Responder> = HashMap::new();

    loop {
        tokio::select! {
            Some(call) = calls.recv() => {
                let session = match call.target {
                    CommandTarget::Browser => None,
                    CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
                };
                let method: MethodId = call.method.into();
                match conn.submit_command(method, session, call.params) {
                    Ok(id) => {
                        inflight.insert(id, call.responder);
                    }
                    Err(err) => {
                        let _ = call.responder.send(Err(
                            AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()),
                        ));
                    }
                }
            }
            message = conn.next() => match message {
                Some(Ok(Message::Response(resp))) => {
                    if let Some(responder) = inflight.remove(&resp.id) {
                        let _ = responder.send(response_payload(resp));
                    }
                }
                Some(Ok(Message::Event(event))) => {
                    if let Err(err) = forward_event(event, &events).await {
                        warn!(target: "cdp-transport", ?err, "failed to forward event");
                    }
                }
                Some(Err(err)) => {
                    let failure = map_cdp_error(err);
                    for (_, responder) in inflight.drain() {
                        let _ = responder.send(Err(failure.clone()));
                    }
                    return Err(failure);
                }
                None => {
                    let closed =
                        AdapterError::new(AdapterErrorKind::CdpIo).with_hint("cdp connection closed");
                    for (_, responder) in inflight.drain() {
                        let _ = responder.send(Err(closed.clone()));
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn forward_event(
    event: CdpEventMessage,
    events: &mpsc::Sender<TransportEvent>,
) -> Result<(), AdapterError> {
    let raw: CdpJsonEventMessage = event.try_into().map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("failed to decode cdp event: {err}"))
    })?;
    events
        .send(TransportEvent {
            method: raw.method.into_owned(),
            params: raw.params,
            session_id: raw.session_id,
        })
        .await
        .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))
}

fn response_payload(resp: Response) -> Result<Value, AdapterError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(protocol_error(error.code, &error.message)),
        (None, None) => {
            Err(AdapterError::new(AdapterErrorKind::Internal).with_hint("empty cdp response"))
        }
    }
}

/// Chrome answers with the JSON-RPC server-error range while a frame's execution context is
/// being replaced; those calls succeed once the new document commits.
fn protocol_error(code: i64, message: &str) -> AdapterError {
    AdapterError::new(AdapterErrorKind::CdpIo)
        .with_hint(format!("cdp error {code}: {message}"))
        .retriable((-32099..=-32000).contains(&code))
}

fn map_cdp_error(err: CdpError) -> AdapterError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => AdapterError::new(AdapterErrorKind::NavTimeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::Serde(_) | CdpError::FrameNotFound(_) | CdpError::JavascriptException(_) => {
            AdapterError::new(AdapterErrorKind::Internal).with_hint(hint)
        }
        _ => AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(hint)
            .retriable(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn reconnects_when_link_died() {
        let opened = Arc::new(AtomicUsize::new(0));
        let flags = Arc::new(Mutex::new(Vec::<Arc<AtomicBool>>::new()));

        let factory: LinkFactory = {
            let opened = Arc::clone(&opened);
            let flags = Arc::clone(&flags);
            Arc::new(move |_cfg: CdpConfig| {
                let opened = Arc::clone(&opened);
                let flags = Arc::clone(&flags);
                Box::pin(async move {
                    opened.fetch_add(1, Ordering::SeqCst);
                    let (link, alive) = Link::stub();
                    flags.lock().await.push(alive);
                    Ok(link)
                })
            })
        };

        let transport = ChromiumTransport::with_factory(CdpConfig::default(), factory);

        let first = transport.link().await.expect("first link");
        let again = transport.link().await.expect("cached link");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        flags.lock().await[0].store(false, Ordering::SeqCst);

        let second = transport.link().await.expect("second link");
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn server_errors_are_retriable() {
        let err = protocol_error(-32000, "Cannot find context with specified id");
        assert_eq!(err.kind, AdapterErrorKind::CdpIo);
        assert!(err.retriable);

        let err = protocol_error(-32602, "Invalid parameters");
        assert!(!err.retriable);
        assert!(err.to_string().contains("-32602"));
    }

    #[test]
    fn missing_executable_is_a_launch_error() {
        let cfg = CdpConfig {
            executable: "/definitely/not/here/chrome".into(),
            ..CdpConfig::default()
        };
        let err = browser_config(&cfg).expect_err("missing binary must fail");
        assert_eq!(err.kind, AdapterErrorKind::Launch);
        assert!(err.to_string().contains("/definitely/not/here/chrome"));
    }
}
