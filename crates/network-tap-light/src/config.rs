//! Tuning knobs for the network tap.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    /// Zero in-flight requests for this long means the page is network idle.
    pub quiet_window_ms: u64,
    /// Requests older than this stop counting as in flight (long-polling, event streams).
    pub max_request_age_ms: u64,
    pub min_publish_interval_ms: u64,
    pub maintenance_interval_ms: u64,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: 500,
            max_request_age_ms: 10_000,
            min_publish_interval_ms: 250,
            maintenance_interval_ms: 100,
        }
    }
}
