use clap::Parser;
use std::path::PathBuf;

use super::output::OutputFormat;
use crate::audit::Severity;
use crate::config::{AuditConfig, MongoSettings};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, env = "SITEAUDIT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    /// Report format written to stdout
    #[arg(short, long, value_enum, default_value = "human")]
    pub output: OutputFormat,

    /// Base URL of the application under audit
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// JSON (or YAML) file with the ordered route list
    #[arg(long, value_name = "FILE")]
    pub routes_file: Option<PathBuf>,

    /// Per-navigation timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Time to stay on each route after navigation, in milliseconds
    #[arg(long, value_name = "MS")]
    pub dwell_ms: Option<u64>,

    /// Directory for route screenshots
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Skip full-page screenshots
    #[arg(long)]
    pub no_screenshots: bool,

    /// MongoDB connection string for persisting results
    #[arg(long, value_name = "URI")]
    pub mongo_uri: Option<String>,

    /// MongoDB database name
    #[arg(long, value_name = "NAME")]
    pub mongo_db: Option<String>,

    /// Directory for JSON-lines result files
    #[arg(long, value_name = "DIR")]
    pub jsonl_dir: Option<PathBuf>,

    /// Chrome/Chromium executable
    #[arg(long, value_name = "PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    pub headful: bool,

    /// Attach to a running browser through its DevTools websocket
    #[arg(long, value_name = "WS_URL")]
    pub ws_url: Option<String>,

    /// Treat 4xx responses as critical
    #[arg(long)]
    pub fail_on_client_errors: bool,

    /// Write adapter metrics (Prometheus text format) to this file
    #[arg(long, value_name = "FILE")]
    pub metrics_out: Option<PathBuf>,
}

impl CliArgs {
    /// Flags win over the config file and the environment.
    pub fn apply_overrides(&self, config: &mut AuditConfig) {
        if let Some(base_url) = &self.base_url {
            config.base_url = Some(base_url.clone());
        }
        if let Some(path) = &self.routes_file {
            config.routes_file = Some(path.clone());
        }
        if let Some(timeout) = self.timeout_ms {
            config.navigation_timeout_ms = timeout;
        }
        if let Some(dwell) = self.dwell_ms {
            config.dwell_ms = dwell;
        }
        if let Some(dir) = &self.out_dir {
            config.screenshot_dir = Some(dir.clone());
        }
        if self.no_screenshots {
            config.capture_screenshots = false;
        }
        if let Some(uri) = &self.mongo_uri {
            match &mut config.mongo {
                Some(mongo) => mongo.uri = uri.clone(),
                None => config.mongo = Some(MongoSettings::new(uri.clone())),
            }
        }
        if let (Some(db), Some(mongo)) = (&self.mongo_db, &mut config.mongo) {
            mongo.database = db.clone();
        }
        if let Some(dir) = &self.jsonl_dir {
            config.jsonl_dir = Some(dir.clone());
        }
        if let Some(path) = &self.chrome_path {
            config.browser.chrome_path = Some(path.clone());
        }
        if self.headful {
            config.browser.headless = false;
        }
        if let Some(ws) = &self.ws_url {
            config.browser.ws_url = Some(ws.clone());
        }
        if self.fail_on_client_errors {
            config.client_error_severity = Severity::Critical;
        }
    }
}
