//! Error taxonomy of an audit run.
//!
//! Only [`AuditError::Setup`] ends the process early. Navigation failures become captured events,
//! capture problems are logged, and persistence problems are recorded per sink.

use cdp_adapter::AdapterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("navigation to {route} failed: {reason}")]
    Navigation { route: String, reason: String },
    #[error("event capture failed: {0}")]
    Capture(String),
    #[error("sink {sink} failed to write {document}: {reason}")]
    Persistence {
        sink: String,
        document: String,
        reason: String,
    },
}

pub type AuditResult<T> = Result<T, AuditError>;

impl AuditError {
    pub fn setup(message: impl Into<String>) -> Self {
        AuditError::Setup(message.into())
    }

    pub fn navigation(route: impl Into<String>, reason: impl Into<String>) -> Self {
        AuditError::Navigation {
            route: route.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence(
        sink: impl Into<String>,
        document: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        AuditError::Persistence {
            sink: sink.into(),
            document: document.into(),
            reason: reason.to_string(),
        }
    }

    /// Wraps a browser launch/attach failure, keeping the adapter's remediation hint.
    pub fn browser_setup(err: AdapterError) -> Self {
        let remediation = err
            .data
            .as_ref()
            .and_then(|data| data.get("remediation"))
            .and_then(|value| value.as_str())
            .map(|hint| format!(" ({hint})"))
            .unwrap_or_default();
        AuditError::Setup(format!("browser unavailable: {err}{remediation}"))
    }
}
