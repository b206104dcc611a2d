use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::buffer::EventBuffer;
use super::model::{AuditStatus, CapturedEvent, RouteSpec, SeverityPolicy};
use super::report::{summarize_with, AuditSummary};
use super::route::CurrentRoute;
use super::walker::WalkReport;

/// One audit run: owns the event buffer and the current-route handle for the whole walk.
#[derive(Debug)]
pub struct AuditSession {
    id: Uuid,
    target_url: Url,
    started_at: DateTime<Utc>,
    buffer: EventBuffer,
    current_route: CurrentRoute,
}

impl AuditSession {
    pub fn new(target_url: Url) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_url,
            started_at: Utc::now(),
            buffer: EventBuffer::new(),
            current_route: CurrentRoute::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn buffer(&self) -> EventBuffer {
        self.buffer.clone()
    }

    pub fn current_route(&self) -> CurrentRoute {
        self.current_route.clone()
    }

    /// Consumes the session, summarizing everything it buffered.
    pub fn finalize(
        self,
        routes: &[RouteSpec],
        walk: WalkReport,
        policy: &SeverityPolicy,
    ) -> AuditRecord {
        self.current_route.clear();
        let events = self.buffer.take();
        let summary = summarize_with(routes, &events, policy);
        AuditRecord {
            session_id: self.id,
            target_url: self.target_url.to_string(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            events,
            summary,
            walk,
        }
    }
}

/// Finalized result of an audit session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub session_id: Uuid,
    pub target_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub events: Vec<CapturedEvent>,
    pub summary: AuditSummary,
    pub walk: WalkReport,
}

impl AuditRecord {
    pub fn status(&self) -> AuditStatus {
        self.summary.overall_status
    }

    pub fn interrupted(&self) -> bool {
        self.walk.interrupted
    }

    pub fn duration(&self) -> std::time::Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}
