//! Persistence of finished audits.
//!
//! Each sink is opened, written and closed on its own; a failing sink is logged and recorded in
//! the [`PersistReport`] without affecting the others or the printed report.

mod jsonl;
mod mongo;

pub use jsonl::JsonlSink;
pub use mongo::MongoSink;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::AuditRecord;
use crate::errors::{AuditError, AuditResult};

#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Establishes the connection for one persistence pass.
    async fn open(&mut self) -> AuditResult<()>;

    async fn save(&mut self, collection: &str, document: &Value) -> AuditResult<()>;

    async fn save_many(&mut self, collection: &str, documents: &[Value]) -> AuditResult<()> {
        for document in documents {
            self.save(collection, document).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> AuditResult<()>;
}

/// Destination names shared by all sinks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collections {
    pub events: String,
    pub summary: String,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            events: "audit_events".to_string(),
            summary: "audit_summaries".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SinkOutcome {
    pub sink: String,
    pub events_written: usize,
    pub summary_written: bool,
    pub errors: Vec<String>,
}

impl SinkOutcome {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PersistReport {
    pub outcomes: Vec<SinkOutcome>,
}

impl PersistReport {
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(SinkOutcome::is_ok)
    }
}

/// One document per captured event, stamped with the session id.
pub fn event_documents(record: &AuditRecord) -> Result<Vec<Value>, serde_json::Error> {
    record
        .events
        .iter()
        .map(|event| {
            let mut doc = serde_json::to_value(event)?;
            if let Value::Object(map) = &mut doc {
                map.insert("sessionId".into(), json!(record.session_id));
            }
            Ok(doc)
        })
        .collect()
}

/// The summary plus the session metadata it belongs to.
pub fn summary_document(record: &AuditRecord) -> Result<Value, serde_json::Error> {
    let mut doc = serde_json::to_value(&record.summary)?;
    if let Value::Object(map) = &mut doc {
        map.insert("sessionId".into(), json!(record.session_id));
        map.insert("targetUrl".into(), json!(record.target_url));
        map.insert("startedAt".into(), serde_json::to_value(record.started_at)?);
        map.insert("finishedAt".into(), serde_json::to_value(record.finished_at)?);
        map.insert("interrupted".into(), json!(record.walk.interrupted));
        map.insert("visits".into(), serde_json::to_value(&record.walk.visits)?);
    }
    Ok(doc)
}

/// Opens and immediately closes every sink so connection problems surface before the walk.
pub async fn probe(sinks: &mut [Box<dyn Sink>]) -> AuditResult<()> {
    for sink in sinks.iter_mut() {
        sink.open()
            .await
            .map_err(|err| AuditError::setup(format!("sink {} unavailable: {err}", sink.name())))?;
        if let Err(err) = sink.close().await {
            warn!(target: "siteaudit::sink", sink = sink.name(), %err, "close after probe failed");
        }
    }
    Ok(())
}

/// Upper bound on closing a sink, so a dead connection cannot hold the process open.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Writes the raw events and the summary to every sink. Never fails.
///
/// Cancelling `cancel` abandons the sink being written (it is still closed) and skips the rest;
/// both are reported as errors.
pub async fn persist(
    record: &AuditRecord,
    sinks: &mut [Box<dyn Sink>],
    collections: &Collections,
    cancel: &CancellationToken,
) -> PersistReport {
    let mut report = PersistReport::default();
    if sinks.is_empty() {
        return report;
    }

    let events = event_documents(record);
    let summary = summary_document(record);

    for sink in sinks.iter_mut() {
        let mut outcome = SinkOutcome {
            sink: sink.name().to_string(),
            ..SinkOutcome::default()
        };

        if cancel.is_cancelled() {
            outcome.errors.push("persistence interrupted before this sink".to_string());
            report.outcomes.push(outcome);
            continue;
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = sink.open() => Some(result),
        };
        match opened {
            None => note(
                &mut outcome,
                AuditError::persistence(sink.name(), "connection", "interrupted"),
            ),
            Some(Err(err)) => note(&mut outcome, err),
            Some(Ok(())) => {
                let finished = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = write(&mut **sink, &events, &summary, collections, &mut outcome) => true,
                };
                if !finished {
                    note(
                        &mut outcome,
                        AuditError::persistence(sink.name(), "documents", "interrupted"),
                    );
                }
            }
        }

        match tokio::time::timeout(CLOSE_GRACE, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => note(&mut outcome, err),
            Err(_) => note(
                &mut outcome,
                AuditError::persistence(sink.name(), "connection", "close timed out"),
            ),
        }

        if outcome.is_ok() {
            info!(
                target: "siteaudit::sink",
                sink = %outcome.sink,
                events = outcome.events_written,
                "audit persisted"
            );
        }
        report.outcomes.push(outcome);
    }
    report
}

async fn write(
    sink: &mut dyn Sink,
    events: &Result<Vec<Value>, serde_json::Error>,
    summary: &Result<Value, serde_json::Error>,
    collections: &Collections,
    outcome: &mut SinkOutcome,
) {
    match events {
        Err(err) => note(outcome, AuditError::persistence(sink.name(), "events", err)),
        Ok(docs) if docs.is_empty() => {}
        Ok(docs) => match sink.save_many(&collections.events, docs).await {
            Ok(()) => outcome.events_written = docs.len(),
            Err(err) => note(outcome, err),
        },
    }
    match summary {
        Err(err) => note(outcome, AuditError::persistence(sink.name(), "summary", err)),
        Ok(doc) => match sink.save(&collections.summary, doc).await {
            Ok(()) => outcome.summary_written = true,
            Err(err) => note(outcome, err),
        },
    }
}

fn note(outcome: &mut SinkOutcome, err: AuditError) {
    warn!(target: "siteaudit::sink", sink = %outcome.sink, %err, "persistence failed");
    outcome.errors.push(err.to_string());
}
