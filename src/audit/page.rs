use std::time::Duration;

use async_trait::async_trait;
use cdp_adapter::{AdapterError, EventStream, Navigation, PageId};
use serde_json::Value;
use url::Url;

/// The browser page the walker drives and the capture layer listens to.
#[async_trait]
pub trait AuditPage: Send + Sync {
    /// Navigates and waits for the network to go idle, bounded by `timeout`.
    async fn goto(&self, url: &Url, timeout: Duration) -> Result<Navigation, AdapterError>;

    /// Fresh subscription to the page's raw events.
    fn events(&self) -> EventStream;

    async fn evaluate(&self, script: &str) -> Result<Value, AdapterError>;

    async fn screenshot_full_page(&self) -> Result<Vec<u8>, AdapterError>;

    /// Page identity used to filter the shared event bus.
    fn page_id(&self) -> Option<PageId> {
        None
    }
}
