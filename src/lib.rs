//! siteaudit: walks a web application's routes in Chromium and reports console errors,
//! uncaught exceptions, failed requests and navigation failures.

pub mod audit;
pub mod browser;
pub mod cli;
pub mod config;
pub mod errors;
pub mod sink;

pub use audit::{run_audit, AuditPlan, AuditRecord, AuditStatus, AuditSummary};
pub use config::AuditConfig;
pub use errors::{AuditError, AuditResult};
