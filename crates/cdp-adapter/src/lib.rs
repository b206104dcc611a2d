//! Chromium DevTools Protocol adapter for the siteaudit engine.
//!
//! The adapter owns a single browser connection, tracks the pages attached to it and
//! republishes the CDP events the audit cares about (console output, uncaught exceptions,
//! HTTP responses, lifecycle changes) as [`events::RawEvent`]s on a broadcast bus.

use std::{env, path::PathBuf};
use tokio::sync::broadcast;
use which::which;

pub mod ids {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Identifier for a page/tab attached to the adapter.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct PageId(pub Uuid);

    /// Adapter-local identifier for the CDP session bound to a page.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct SessionId(pub Uuid);

    impl PageId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for PageId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SessionId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for SessionId {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the adapter.
    #[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
    pub enum AdapterErrorKind {
        #[error("navigation timed out")]
        NavTimeout,
        #[error("navigation failed")]
        NavFailed,
        #[error("browser launch failed")]
        Launch,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("page not found")]
        PageNotFound,
        #[error("script evaluation failed")]
        Script,
        #[error("internal error")]
        Internal,
    }

    /// Error returned by every adapter operation.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }

        pub fn is_timeout(&self) -> bool {
            self.kind == AdapterErrorKind::NavTimeout
        }
    }
}

pub mod events {
    use super::ids::PageId;
    use serde::{Deserialize, Serialize};

    /// Console severities as reported by `Runtime.consoleAPICalled` and `Log.entryAdded`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ConsoleLevel {
        Debug,
        Info,
        Log,
        Warning,
        Error,
    }

    impl ConsoleLevel {
        /// Maps a `Runtime.consoleAPICalled` call type.
        pub fn from_api_type(kind: &str) -> Self {
            match kind {
                "error" | "assert" => ConsoleLevel::Error,
                "warning" => ConsoleLevel::Warning,
                "debug" => ConsoleLevel::Debug,
                "info" => ConsoleLevel::Info,
                _ => ConsoleLevel::Log,
            }
        }

        /// Maps a `Log.entryAdded` entry level.
        pub fn from_log_level(level: &str) -> Self {
            match level {
                "error" => ConsoleLevel::Error,
                "warning" => ConsoleLevel::Warning,
                "verbose" => ConsoleLevel::Debug,
                _ => ConsoleLevel::Info,
            }
        }
    }

    /// Where a console message originated.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ConsoleSource {
        /// Page script calling `console.*`.
        Api,
        /// Browser-generated log entry (network, security, violation...).
        Browser,
    }

    /// Events published by the adapter, one per relevant CDP notification.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub enum RawEvent {
        PageLifecycle {
            page: PageId,
            phase: String,
            ts: u64,
        },
        PageNavigated {
            page: PageId,
            url: String,
            ts: u64,
        },
        ConsoleMessage {
            page: PageId,
            level: ConsoleLevel,
            source: ConsoleSource,
            text: String,
            ts: u64,
        },
        ExceptionThrown {
            page: PageId,
            message: String,
            stack: Option<String>,
            ts: u64,
        },
        ResponseReceived {
            page: PageId,
            url: String,
            status: i64,
            method: String,
            ts: u64,
        },
        Error {
            page: Option<PageId>,
            message: String,
        },
    }

    impl RawEvent {
        pub fn page(&self) -> Option<PageId> {
            match self {
                RawEvent::PageLifecycle { page, .. }
                | RawEvent::PageNavigated { page, .. }
                | RawEvent::ConsoleMessage { page, .. }
                | RawEvent::ExceptionThrown { page, .. }
                | RawEvent::ResponseReceived { page, .. } => Some(*page),
                RawEvent::Error { page, .. } => *page,
            }
        }
    }
}

pub mod config {
    use crate::detect_chrome_executable;
    use serde::{Deserialize, Serialize};
    use std::{env, path::PathBuf};

    /// Configuration for launching (or attaching to) Chromium.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct CdpConfig {
        pub executable: PathBuf,
        pub user_data_dir: PathBuf,
        pub headless: bool,
        pub no_sandbox: bool,
        pub default_deadline_ms: u64,
        pub launch_timeout_ms: u64,
        pub heartbeat_interval_ms: u64,
        /// Attach to an already running browser instead of launching one.
        pub websocket_url: Option<String>,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                executable: detect_chrome_executable().unwrap_or_default(),
                user_data_dir: default_profile_dir(),
                headless: resolve_headless_default(),
                no_sandbox: resolve_flag("SITEAUDIT_DISABLE_SANDBOX"),
                default_deadline_ms: 30_000,
                launch_timeout_ms: 20_000,
                heartbeat_interval_ms: 15_000,
                websocket_url: None,
            }
        }
    }

    impl CdpConfig {
        /// True when the adapter launches the browser itself and must close it on shutdown.
        pub fn owns_browser(&self) -> bool {
            self.websocket_url.is_none()
        }
    }

    fn resolve_headless_default() -> bool {
        match env::var("SITEAUDIT_HEADLESS") {
            Ok(value) => {
                let lower = value.to_ascii_lowercase();
                !matches!(lower.as_str(), "0" | "false" | "no" | "off")
            }
            Err(_) => true,
        }
    }

    fn resolve_flag(key: &str) -> bool {
        env::var(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    fn default_profile_dir() -> PathBuf {
        if let Ok(path) = env::var("SITEAUDIT_CHROME_PROFILE") {
            return PathBuf::from(path);
        }
        env::temp_dir().join("siteaudit-profile")
    }
}

/// Locates a Chrome/Chromium binary: `SITEAUDIT_CHROME`, then `PATH`, then OS defaults.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("SITEAUDIT_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    if let Some(path) = chrome_executable_names()
        .iter()
        .find_map(|name| which(name).ok())
    {
        return Some(path);
    }

    let skip_defaults = env::var("SITEAUDIT_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if skip_defaults {
        return None;
    }

    os_specific_chrome_paths()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"]
            .iter()
            .filter_map(|key| env::var(key).ok())
            .map(|root| PathBuf::from(root.trim()))
            .flat_map(|root| {
                [
                    root.join("Google/Chrome/Application/chrome.exe"),
                    root.join("Chromium/Application/chrome.exe"),
                    root.join("Microsoft/Edge/Application/msedge.exe"),
                ]
            })
            .collect()
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }
}

pub mod adapter;
pub mod commands;
pub mod metrics;
pub mod registry;
pub mod transport;
pub mod util;

pub use adapter::{Cdp, CdpAdapter, EventBus};
pub use commands::{NavigateOptions, Navigation};
pub use config::CdpConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use events::{ConsoleLevel, ConsoleSource, RawEvent};
pub use ids::{PageId, SessionId};
pub use metrics::AdapterMetricsSnapshot;
pub use transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};

/// Subscription handle for adapter events.
pub type EventStream = broadcast::Receiver<RawEvent>;

/// Creates the broadcast bus the adapter publishes on.
pub fn event_bus(buffer: usize) -> (EventBus, EventStream) {
    broadcast::channel(buffer)
}

#[cfg(test)]
mod tests {
    use super::events::ConsoleLevel;
    use super::{chrome_executable_names, detect_chrome_executable};
    use serial_test::serial;
    use std::{env, fs};
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn detects_from_env_var() {
        let dir = tempdir().unwrap();
        let exe_path = dir.path().join("my-chrome");
        fs::write(&exe_path, b"").unwrap();
        let original = env::var("SITEAUDIT_CHROME").ok();
        env::set_var("SITEAUDIT_CHROME", exe_path.to_string_lossy().to_string());
        let detected = detect_chrome_executable();
        match original {
            Some(value) => env::set_var("SITEAUDIT_CHROME", value),
            None => env::remove_var("SITEAUDIT_CHROME"),
        }
        assert_eq!(detected, Some(exe_path));
    }

    #[test]
    #[serial]
    fn detects_from_path_entries() {
        let dir = tempdir().unwrap();
        let name = chrome_executable_names()[0];
        let exe_path = dir.path().join(name);
        fs::write(&exe_path, b"").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&exe_path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let saved: Vec<(&str, Option<String>)> =
            ["PATH", "SITEAUDIT_CHROME", "SITEAUDIT_SKIP_OS_PATHS"]
                .into_iter()
                .map(|key| (key, env::var(key).ok()))
                .collect();
        env::set_var("SITEAUDIT_CHROME", "");
        env::set_var("SITEAUDIT_SKIP_OS_PATHS", "1");
        env::set_var("PATH", dir.path());
        let detected = detect_chrome_executable();
        for (key, value) in saved {
            match value {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
        }
        assert_eq!(detected, Some(exe_path));
    }

    #[test]
    fn console_levels_follow_cdp_vocabulary() {
        assert_eq!(ConsoleLevel::from_api_type("error"), ConsoleLevel::Error);
        assert_eq!(ConsoleLevel::from_api_type("assert"), ConsoleLevel::Error);
        assert_eq!(ConsoleLevel::from_api_type("warning"), ConsoleLevel::Warning);
        assert_eq!(ConsoleLevel::from_api_type("table"), ConsoleLevel::Log);
        assert_eq!(ConsoleLevel::from_log_level("verbose"), ConsoleLevel::Debug);
        assert_eq!(ConsoleLevel::from_log_level("error"), ConsoleLevel::Error);
    }
}
