//! Audit configuration.
//!
//! Resolved in layers: defaults, the YAML config file, environment variables, then CLI flags.
//! [`AuditConfig::plan`] validates the result into an [`AuditPlan`].

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cdp_adapter::CdpConfig;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::audit::{AuditPlan, RouteSpec, Severity, SeverityPolicy, WalkOptions};
use crate::errors::{AuditError, AuditResult};
use crate::sink::Collections;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub base_url: Option<String>,
    pub routes: Vec<RouteSpec>,
    /// JSON or YAML file with the route list; replaces `routes` when set.
    pub routes_file: Option<PathBuf>,
    pub navigation_timeout_ms: u64,
    pub dwell_ms: u64,
    pub scroll_pause_ms: u64,
    pub screenshot_dir: Option<PathBuf>,
    pub capture_screenshots: bool,
    pub client_error_severity: Severity,
    pub browser: BrowserSettings,
    pub mongo: Option<MongoSettings>,
    pub jsonl_dir: Option<PathBuf>,
    pub events_collection: String,
    pub summary_collection: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        let collections = Collections::default();
        Self {
            base_url: None,
            routes: Vec::new(),
            routes_file: None,
            navigation_timeout_ms: 30_000,
            dwell_ms: 2_500,
            scroll_pause_ms: 500,
            screenshot_dir: None,
            capture_screenshots: true,
            client_error_severity: Severity::High,
            browser: BrowserSettings::default(),
            mongo: None,
            jsonl_dir: None,
            events_collection: collections.events,
            summary_collection: collections.summary,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// DevTools websocket of an already running browser.
    pub ws_url: Option<String>,
    pub user_data_dir: Option<PathBuf>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            ws_url: None,
            user_data_dir: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MongoSettings {
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
}

impl MongoSettings {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: default_database(),
        }
    }
}

fn default_database() -> String {
    "siteaudit".to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RoutesDocument {
    List(Vec<RouteSpec>),
    Wrapped { routes: Vec<RouteSpec> },
}

impl AuditConfig {
    pub fn from_yaml_str(content: &str) -> AuditResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|err| AuditError::setup(format!("invalid configuration: {err}")))
    }

    /// Applies `SITEAUDIT_BASE_URL` and `SITEAUDIT_MONGO_URI` when set and non-empty.
    pub fn apply_env(&mut self) {
        if let Some(base_url) = env_value("SITEAUDIT_BASE_URL") {
            self.base_url = Some(base_url);
        }
        if let Some(uri) = env_value("SITEAUDIT_MONGO_URI") {
            match &mut self.mongo {
                Some(mongo) => mongo.uri = uri,
                None => self.mongo = Some(MongoSettings::new(uri)),
            }
        }
    }

    pub fn collections(&self) -> Collections {
        Collections {
            events: self.events_collection.clone(),
            summary: self.summary_collection.clone(),
        }
    }

    /// Routes from `routes_file` when configured, otherwise the inline list.
    pub fn resolve_routes(&self) -> AuditResult<Vec<RouteSpec>> {
        match &self.routes_file {
            Some(path) => load_routes_file(path),
            None => Ok(self.routes.clone()),
        }
    }

    pub fn plan(&self) -> AuditResult<AuditPlan> {
        let raw = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                AuditError::setup("no base URL configured (use --base-url or SITEAUDIT_BASE_URL)")
            })?;
        let base_url = Url::parse(raw)
            .map_err(|err| AuditError::setup(format!("invalid base URL {raw:?}: {err}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(AuditError::setup(format!(
                "base URL must use http or https, got {}",
                base_url.scheme()
            )));
        }

        let routes = self.resolve_routes()?;
        validate_routes(&routes)?;

        if self.navigation_timeout_ms == 0 {
            return Err(AuditError::setup("navigation timeout must be greater than zero"));
        }

        Ok(AuditPlan {
            base_url,
            routes,
            walk: WalkOptions {
                navigation_timeout: Duration::from_millis(self.navigation_timeout_ms),
                dwell: Duration::from_millis(self.dwell_ms),
                scroll_pause: Duration::from_millis(self.scroll_pause_ms),
                screenshot_dir: self
                    .screenshot_dir
                    .clone()
                    .filter(|_| self.capture_screenshots),
            },
            policy: SeverityPolicy {
                client_error: self.client_error_severity,
            },
        })
    }

    pub fn cdp_config(&self) -> CdpConfig {
        let mut cfg = CdpConfig::default();
        cfg.headless = self.browser.headless;
        if let Some(path) = &self.browser.chrome_path {
            cfg.executable = path.clone();
        }
        if let Some(dir) = &self.browser.user_data_dir {
            cfg.user_data_dir = dir.clone();
        }
        cfg.websocket_url = self.browser.ws_url.clone();
        cfg.default_deadline_ms = self.navigation_timeout_ms;
        cfg
    }
}

/// Reads a route list: a JSON array of `{label, path}`, or `{"routes": [...]}`.
/// Files ending in `.yaml`/`.yml` are parsed as YAML.
pub fn load_routes_file(path: &Path) -> AuditResult<Vec<RouteSpec>> {
    let content = fs::read_to_string(path).map_err(|err| {
        AuditError::setup(format!("cannot read routes file {}: {err}", path.display()))
    })?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "yaml" | "yml"))
        .unwrap_or(false);

    let parsed = if is_yaml {
        serde_yaml::from_str::<RoutesDocument>(&content).map_err(|err| err.to_string())
    } else {
        serde_json::from_str::<RoutesDocument>(&content).map_err(|err| err.to_string())
    };
    match parsed {
        Ok(RoutesDocument::List(routes)) | Ok(RoutesDocument::Wrapped { routes }) => Ok(routes),
        Err(err) => Err(AuditError::setup(format!(
            "invalid routes file {}: {err}",
            path.display()
        ))),
    }
}

pub fn validate_routes(routes: &[RouteSpec]) -> AuditResult<()> {
    if routes.is_empty() {
        return Err(AuditError::setup("no routes configured"));
    }
    let mut seen = HashSet::new();
    let mut slugs: HashMap<String, &str> = HashMap::new();
    for route in routes {
        let label = route.label.trim();
        if label.is_empty() {
            return Err(AuditError::setup(format!(
                "route with path {:?} has an empty label",
                route.path
            )));
        }
        if !seen.insert(label) {
            return Err(AuditError::setup(format!("duplicate route label {label:?}")));
        }
        let slug = route.slug();
        if slug == "." || slug == ".." {
            return Err(AuditError::setup(format!(
                "route label {label:?} cannot be used as a screenshot name"
            )));
        }
        if let Some(other) = slugs.insert(slug.clone(), label) {
            return Err(AuditError::setup(format!(
                "route labels {other:?} and {label:?} both map to screenshot {slug}.png"
            )));
        }
    }
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
