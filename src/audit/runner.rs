use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use super::capture::CaptureLayer;
use super::model::{RouteSpec, SeverityPolicy};
use super::page::AuditPage;
use super::session::{AuditRecord, AuditSession};
use super::walker::{RouteWalker, WalkOptions};

/// Everything needed for one run, already validated.
#[derive(Clone, Debug)]
pub struct AuditPlan {
    pub base_url: Url,
    pub routes: Vec<RouteSpec>,
    pub walk: WalkOptions,
    pub policy: SeverityPolicy,
}

/// Walks every route on `page` with capture attached and returns the finalized record.
///
/// Never fails: navigation problems become events and capture problems are logged.
pub async fn run_audit<P: AuditPage + ?Sized>(
    page: &P,
    plan: &AuditPlan,
    cancel: &CancellationToken,
) -> AuditRecord {
    let session = AuditSession::new(plan.base_url.clone());
    info!(
        target: "siteaudit::runner",
        session = %session.id(),
        base_url = %plan.base_url,
        routes = plan.routes.len(),
        "audit started"
    );

    let capture = CaptureLayer::new(session.buffer(), session.current_route()).for_page(page.page_id());
    capture.attach(page.events());

    let walker = RouteWalker::new(
        page,
        plan.walk.clone(),
        session.current_route(),
        session.buffer(),
    );
    let walk = walker.walk(&plan.base_url, &plan.routes, cancel).await;

    if let Err(err) = capture.detach().await {
        warn!(target: "siteaudit::runner", %err, "event capture ended abnormally");
    }

    let record = session.finalize(&plan.routes, walk, &plan.policy);
    info!(
        target: "siteaudit::runner",
        session = %record.session_id,
        events = record.events.len(),
        status = %record.status(),
        interrupted = record.interrupted(),
        "audit finished"
    );
    record
}
