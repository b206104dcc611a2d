//! Records produced during an audit and their severity classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry of the ordered route list; insertion order is visit order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub label: String,
    pub path: String,
}

impl RouteSpec {
    pub fn new(label: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
        }
    }

    /// File-name stem for the route screenshot: lowercased, with whitespace and characters that
    /// are not allowed in a file name replaced by hyphens. Always a single path component.
    pub fn slug(&self) -> String {
        self.label
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
                c if c.is_whitespace() || c.is_control() => '-',
                c => c,
            })
            .collect()
    }
}

/// Console levels worth recording; everything below warning is discarded at capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Error,
    Warning,
}

/// Payload of a captured event, serialized with a `type` discriminator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    Console {
        level: ConsoleLevel,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    PageException {
        message: String,
        stack_trace: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FailedResponse {
        http_status: u16,
        url: String,
        method: String,
    },
    #[serde(rename_all = "camelCase")]
    NavigationFailure { target_route: String, reason: String },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::Console { .. } => "console",
            EventKind::PageException { .. } => "pageException",
            EventKind::FailedResponse { .. } => "failedResponse",
            EventKind::NavigationFailure { .. } => "navigationFailure",
        }
    }

    /// Text identifying the finding; identical texts on one route collapse into one finding.
    pub fn describe(&self) -> String {
        match self {
            EventKind::Console { message, .. } | EventKind::PageException { message, .. } => {
                message.clone()
            }
            EventKind::FailedResponse {
                http_status,
                url,
                method,
            } => format!("{method} {url} -> {http_status}"),
            EventKind::NavigationFailure {
                target_route,
                reason,
            } => format!("{target_route}: {reason}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedEvent {
    pub route: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl CapturedEvent {
    pub fn new(route: impl Into<String>, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            route: route.into(),
            timestamp,
            kind,
        }
    }

    pub fn navigation_failure(route: &str, reason: impl Into<String>) -> Self {
        Self::new(
            route,
            Utc::now(),
            EventKind::NavigationFailure {
                target_route: route.to_string(),
                reason: reason.into(),
            },
        )
    }
}

/// Declared worst first, so `Ord` ranks `Critical` lowest and `min` yields the worst.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default classification. A navigation failure counts as a page crash.
pub fn severity_of(event: &CapturedEvent) -> Severity {
    SeverityPolicy::default().classify(event)
}

/// Classification knobs; the default policy is exactly [`severity_of`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityPolicy {
    /// Severity assigned to 4xx responses.
    pub client_error: Severity,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            client_error: Severity::High,
        }
    }
}

impl SeverityPolicy {
    pub fn classify(&self, event: &CapturedEvent) -> Severity {
        match &event.kind {
            EventKind::Console {
                level: ConsoleLevel::Error,
                ..
            } => Severity::Error,
            EventKind::Console {
                level: ConsoleLevel::Warning,
                ..
            } => Severity::Warning,
            EventKind::PageException { .. } | EventKind::NavigationFailure { .. } => {
                Severity::Critical
            }
            EventKind::FailedResponse { http_status, .. } if *http_status >= 500 => {
                Severity::Critical
            }
            EventKind::FailedResponse { .. } => self.client_error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Passed,
    Failed,
}

impl AuditStatus {
    pub fn from_worst(worst: Option<Severity>) -> Self {
        match worst {
            Some(Severity::Critical) => AuditStatus::Failed,
            _ => AuditStatus::Passed,
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditStatus::Passed => f.write_str("PASSED"),
            AuditStatus::Failed => f.write_str("FAILED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(status: u16) -> CapturedEvent {
        CapturedEvent::new(
            "Home",
            Utc::now(),
            EventKind::FailedResponse {
                http_status: status,
                url: "http://localhost/api".into(),
                method: "GET".into(),
            },
        )
    }

    #[test]
    fn slug_lowercases_and_hyphenates() {
        assert_eq!(RouteSpec::new("Patient List", "/p").slug(), "patient-list");
        assert_eq!(RouteSpec::new("Home", "/").slug(), "home");
    }

    #[test]
    fn slug_never_leaves_the_screenshot_directory() {
        assert_eq!(
            RouteSpec::new("Reports / Monthly", "/r").slug(),
            "reports---monthly"
        );
        assert_eq!(RouteSpec::new("../x", "/x").slug(), "..-x");
        assert_eq!(RouteSpec::new(r"a\b", "/ab").slug(), "a-b");
        assert!(!RouteSpec::new("Billing\tQ1", "/b").slug().contains('\t'));
    }

    #[test]
    fn classification_table() {
        assert_eq!(severity_of(&response(500)), Severity::Critical);
        assert_eq!(severity_of(&response(503)), Severity::Critical);
        assert_eq!(severity_of(&response(404)), Severity::High);
        let warn = CapturedEvent::new(
            "Home",
            Utc::now(),
            EventKind::Console {
                level: ConsoleLevel::Warning,
                message: "deprecated".into(),
            },
        );
        assert_eq!(severity_of(&warn), Severity::Warning);
        let crash = CapturedEvent::new(
            "Home",
            Utc::now(),
            EventKind::PageException {
                message: "TypeError".into(),
                stack_trace: None,
            },
        );
        assert_eq!(severity_of(&crash), Severity::Critical);
        let nav = CapturedEvent::navigation_failure("Home", "timeout");
        assert_eq!(severity_of(&nav), Severity::Critical);
    }

    #[test]
    fn policy_can_escalate_client_errors() {
        let strict = SeverityPolicy {
            client_error: Severity::Critical,
        };
        assert_eq!(strict.classify(&response(401)), Severity::Critical);
    }

    #[test]
    fn worst_severity_is_the_minimum() {
        let worst = [Severity::Warning, Severity::Critical, Severity::High]
            .into_iter()
            .min();
        assert_eq!(worst, Some(Severity::Critical));
        assert_eq!(AuditStatus::from_worst(Some(Severity::High)), AuditStatus::Passed);
    }

    #[test]
    fn serializes_with_type_tag_and_camel_case_fields() {
        let value = serde_json::to_value(response(502)).unwrap();
        assert_eq!(value["type"], json!("failedResponse"));
        assert_eq!(value["httpStatus"], json!(502));
        assert_eq!(value["route"], json!("Home"));

        let nav = serde_json::to_value(CapturedEvent::navigation_failure("Cart", "boom")).unwrap();
        assert_eq!(nav["type"], json!("navigationFailure"));
        assert_eq!(nav["targetRoute"], json!("Cart"));

        let back: CapturedEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind.type_name(), "failedResponse");
    }
}
