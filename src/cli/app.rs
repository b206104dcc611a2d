use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::env::CliArgs;
use super::output::render;
use super::runtime::{init_logging, load_config, LoadedConfig};
use crate::audit::{run_audit, AuditRecord, AuditStatus};
use crate::browser::BrowserSession;
use crate::config::AuditConfig;
use crate::sink::{persist, probe, JsonlSink, MongoSink, Sink};

/// How the run ended; maps onto the process exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    Failed,
    Interrupted,
}

impl RunOutcome {
    pub fn from_record(record: &AuditRecord) -> Self {
        if record.interrupted() {
            RunOutcome::Interrupted
        } else {
            match record.status() {
                AuditStatus::Passed => RunOutcome::Passed,
                AuditStatus::Failed => RunOutcome::Failed,
            }
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RunOutcome::Passed => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Interrupted => 2,
        }
    }

    pub fn exit_code(self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

pub async fn run() -> Result<RunOutcome> {
    run_with(CliArgs::parse()).await
}

pub async fn run_with(cli: CliArgs) -> Result<RunOutcome> {
    init_logging(&cli.log_level, cli.debug)?;
    info!(
        "Starting siteaudit v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("SITEAUDIT_GIT_HASH"),
        env!("SITEAUDIT_BUILD_DATE")
    );

    let LoadedConfig { mut config, path } = load_config(cli.config.as_ref()).await?;
    config.apply_env();
    cli.apply_overrides(&mut config);
    let plan = config
        .plan()
        .with_context(|| format!("invalid audit configuration (config: {})", path.display()))?;

    let mut sinks = build_sinks(&config);
    probe(&mut sinks).await?;

    if let Some(dir) = &plan.walk.screenshot_dir {
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), %err, "cannot create screenshot directory");
        }
    }

    let session = BrowserSession::launch(config.cdp_config()).await?;

    let walk_cancel = CancellationToken::new();
    let persist_cancel = CancellationToken::new();
    let interrupt = spawn_interrupt_watcher(walk_cancel.clone(), persist_cancel.clone());
    let record = run_audit(&session, &plan, &walk_cancel).await;
    // From here on an interrupt abandons persistence instead.
    walk_cancel.cancel();

    if let Some(path) = &cli.metrics_out {
        match session.metrics_text() {
            Ok(text) => {
                if let Err(err) = tokio::fs::write(path, text).await {
                    warn!(path = %path.display(), %err, "failed to write metrics");
                }
            }
            Err(err) => warn!(%err, "failed to render adapter metrics"),
        }
    }
    session.close().await;

    println!("{}", render(&record, cli.output)?);

    let report = persist(&record, &mut sinks, &config.collections(), &persist_cancel).await;
    interrupt.abort();
    if !report.all_ok() {
        error!(
            failed = report.outcomes.iter().filter(|o| !o.is_ok()).count(),
            "some sinks failed to persist the audit"
        );
    }

    let outcome = RunOutcome::from_record(&record);
    info!(status = %record.status(), exit_code = outcome.code(), "audit complete");
    Ok(outcome)
}

fn build_sinks(config: &AuditConfig) -> Vec<Box<dyn Sink>> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    if let Some(mongo) = &config.mongo {
        sinks.push(Box::new(MongoSink::new(&mongo.uri, &mongo.database)));
    }
    if let Some(dir) = &config.jsonl_dir {
        sinks.push(Box::new(JsonlSink::new(dir)));
    }
    sinks
}

/// The first interrupt stops the walk; one arriving after the walk abandons persistence.
fn spawn_interrupt_watcher(walk: CancellationToken, persist: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if escalate_interrupt(&walk, &persist) {
                break;
            }
        }
    })
}

/// Returns `true` once there is nothing left to cancel.
fn escalate_interrupt(walk: &CancellationToken, persist: &CancellationToken) -> bool {
    if !walk.is_cancelled() {
        warn!("interrupt received; finishing the current step and reporting");
        walk.cancel();
        false
    } else {
        warn!("interrupt received; abandoning persistence");
        persist.cancel();
        true
    }
}
