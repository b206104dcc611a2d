//! The audit engine: capture, route walking and report aggregation.

pub mod buffer;
pub mod capture;
pub mod model;
pub mod page;
pub mod report;
pub mod route;
pub mod runner;
pub mod session;
pub mod walker;

pub use buffer::EventBuffer;
pub use capture::{CaptureLayer, CaptureStats};
pub use model::{
    severity_of, AuditStatus, CapturedEvent, ConsoleLevel, EventKind, RouteSpec, Severity,
    SeverityPolicy,
};
pub use page::AuditPage;
pub use report::{render_human, summarize, summarize_with, AuditSummary, Finding, RouteSummary};
pub use route::CurrentRoute;
pub use runner::{run_audit, AuditPlan};
pub use session::{AuditRecord, AuditSession};
pub use walker::{route_url, RouteOutcome, RouteVisit, RouteWalker, WalkOptions, WalkReport};
