//! Chromium-backed [`AuditPage`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_adapter::{
    event_bus, AdapterError, AdapterMetricsSnapshot, Cdp, CdpAdapter, CdpConfig, EventStream,
    NavigateOptions, Navigation, PageId,
};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::audit::AuditPage;
use crate::errors::{AuditError, AuditResult};

const EVENT_BUFFER: usize = 1024;

/// A launched (or attached) browser with the single tab the audit drives.
pub struct BrowserSession {
    adapter: Arc<CdpAdapter>,
    page: PageId,
}

impl BrowserSession {
    /// Launches or attaches to Chromium and opens the audit tab.
    pub async fn launch(cfg: CdpConfig) -> AuditResult<Self> {
        let (bus, _initial) = event_bus(EVENT_BUFFER);
        let attach = cfg.websocket_url.clone();
        let adapter = Arc::new(CdpAdapter::new(cfg, bus).map_err(AuditError::browser_setup)?);
        Arc::clone(&adapter)
            .start()
            .await
            .map_err(AuditError::browser_setup)?;

        let page = match adapter.open_page().await {
            Ok(page) => page,
            Err(err) => {
                adapter.shutdown().await;
                return Err(AuditError::browser_setup(err));
            }
        };
        info!(target: "siteaudit::browser", page = %page.0, attached = attach.is_some(), "browser ready");
        Ok(Self { adapter, page })
    }

    pub fn metrics(&self) -> AdapterMetricsSnapshot {
        self.adapter.metrics()
    }

    /// Adapter metrics in the Prometheus text format.
    pub fn metrics_text(&self) -> Result<String, AdapterError> {
        self.adapter.render_metrics()
    }

    pub async fn close(self) {
        if let Err(err) = self.adapter.close_page(self.page).await {
            debug!(target: "siteaudit::browser", %err, "closing audit tab failed");
        }
        self.adapter.shutdown().await;
    }
}

#[async_trait]
impl AuditPage for BrowserSession {
    async fn goto(&self, url: &Url, timeout: Duration) -> Result<Navigation, AdapterError> {
        let opts = NavigateOptions {
            timeout,
            wait_network_idle: true,
        };
        self.adapter.navigate(self.page, url.as_str(), &opts).await
    }

    fn events(&self) -> EventStream {
        self.adapter.subscribe()
    }

    async fn evaluate(&self, script: &str) -> Result<Value, AdapterError> {
        self.adapter.evaluate_script(self.page, script).await
    }

    async fn screenshot_full_page(&self) -> Result<Vec<u8>, AdapterError> {
        self.adapter.screenshot_full_page(self.page).await
    }

    fn page_id(&self) -> Option<PageId> {
        Some(self.page)
    }
}
