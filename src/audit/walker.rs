//! Route walker: visits each configured route in order on a single page.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::buffer::EventBuffer;
use super::model::{CapturedEvent, RouteSpec};
use super::page::AuditPage;
use super::route::CurrentRoute;
use crate::errors::AuditError;

const SCROLL_TO_BOTTOM: &str =
    "window.scrollTo(0, Math.max(document.documentElement.scrollHeight, document.body ? document.body.scrollHeight : 0))";
const SCROLL_TO_TOP: &str = "window.scrollTo(0, 0)";

#[derive(Clone, Debug)]
pub struct WalkOptions {
    pub navigation_timeout: Duration,
    /// Time spent on each page after navigation so async errors can surface.
    pub dwell: Duration,
    pub scroll_pause: Duration,
    /// Full-page screenshots are written here when set.
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_millis(30_000),
            dwell: Duration::from_millis(2_500),
            scroll_pause: Duration::from_millis(500),
            screenshot_dir: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOutcome {
    Visited,
    NavigationFailed,
    /// Not visited because the walk was interrupted.
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteVisit {
    pub label: String,
    pub url: String,
    pub outcome: RouteOutcome,
    pub navigation_ms: Option<u64>,
    pub screenshot: Option<PathBuf>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkReport {
    pub visits: Vec<RouteVisit>,
    pub interrupted: bool,
}

impl WalkReport {
    pub fn count(&self, outcome: RouteOutcome) -> usize {
        self.visits.iter().filter(|v| v.outcome == outcome).count()
    }

    pub fn visit(&self, label: &str) -> Option<&RouteVisit> {
        self.visits.iter().find(|v| v.label == label)
    }
}

/// Joins `path` onto `base`, keeping any path prefix the base URL already has.
pub fn route_url(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let prefixed = format!("{}/", base.path());
        base.set_path(&prefixed);
    }
    base.join(path.trim_start_matches('/'))
}

pub struct RouteWalker<'a, P: AuditPage + ?Sized> {
    page: &'a P,
    options: WalkOptions,
    current_route: CurrentRoute,
    buffer: EventBuffer,
}

impl<'a, P: AuditPage + ?Sized> RouteWalker<'a, P> {
    pub fn new(
        page: &'a P,
        options: WalkOptions,
        current_route: CurrentRoute,
        buffer: EventBuffer,
    ) -> Self {
        Self {
            page,
            options,
            current_route,
            buffer,
        }
    }

    /// Visits every route once, in order. Navigation failures are recorded and the walk goes on;
    /// cancellation stops it and marks the remaining routes as skipped.
    pub async fn walk(
        &self,
        base_url: &Url,
        routes: &[RouteSpec],
        cancel: &CancellationToken,
    ) -> WalkReport {
        let mut report = WalkReport::default();

        for (index, route) in routes.iter().enumerate() {
            if cancel.is_cancelled() {
                report.interrupted = true;
                skip_remaining(&mut report, base_url, &routes[index..]);
                break;
            }

            let visit = self.visit(base_url, route, cancel).await;
            let stop = cancel.is_cancelled();
            report.visits.push(visit);
            if stop {
                report.interrupted = true;
                skip_remaining(&mut report, base_url, &routes[index + 1..]);
                break;
            }
        }

        if report.interrupted {
            warn!(
                target: "siteaudit::walker",
                visited = report.count(RouteOutcome::Visited),
                skipped = report.count(RouteOutcome::Skipped),
                "walk interrupted"
            );
        }
        report
    }

    async fn visit(&self, base_url: &Url, route: &RouteSpec, cancel: &CancellationToken) -> RouteVisit {
        let url = match route_url(base_url, &route.path) {
            Ok(url) => url,
            Err(err) => {
                let reason = format!("invalid route path {:?}: {err}", route.path);
                return self.navigation_failed(route, route.path.clone(), None, reason);
            }
        };

        // The label must be in place before navigation starts: responses arrive mid-goto.
        self.current_route.set(&route.label);
        info!(target: "siteaudit::walker", route = %route.label, %url, "visiting route");

        let started = Instant::now();
        let timeout = self.options.navigation_timeout;
        let navigation = tokio::select! {
            _ = cancel.cancelled() => {
                return RouteVisit {
                    label: route.label.clone(),
                    url: url.to_string(),
                    outcome: RouteOutcome::Skipped,
                    navigation_ms: None,
                    screenshot: None,
                    error: Some("interrupted during navigation".to_string()),
                };
            }
            result = tokio::time::timeout(timeout, self.page.goto(&url, timeout)) => result,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match navigation {
            Err(_) => {
                let reason = format!("navigation timed out after {} ms", timeout.as_millis());
                return self.navigation_failed(route, url.to_string(), Some(elapsed_ms), reason);
            }
            Ok(Err(err)) => {
                return self.navigation_failed(route, url.to_string(), Some(elapsed_ms), err.to_string());
            }
            Ok(Ok(nav)) => {
                debug!(target: "siteaudit::walker", route = %route.label, elapsed_ms = nav.elapsed_ms, "navigation settled");
            }
        }

        let mut visit = RouteVisit {
            label: route.label.clone(),
            url: url.to_string(),
            outcome: RouteOutcome::Visited,
            navigation_ms: Some(elapsed_ms),
            screenshot: None,
            error: None,
        };

        if !self.exercise(route, cancel).await {
            return visit;
        }
        visit.screenshot = self.screenshot(route).await;
        visit
    }

    /// Dwell, then scroll down and back up. Returns `false` when interrupted.
    async fn exercise(&self, route: &RouteSpec, cancel: &CancellationToken) -> bool {
        if !pause(self.options.dwell, cancel).await {
            return false;
        }
        for script in [SCROLL_TO_BOTTOM, SCROLL_TO_TOP] {
            if let Err(err) = self.page.evaluate(script).await {
                warn!(target: "siteaudit::walker", route = %route.label, %err, "scroll failed");
            }
            if !pause(self.options.scroll_pause, cancel).await {
                return false;
            }
        }
        true
    }

    async fn screenshot(&self, route: &RouteSpec) -> Option<PathBuf> {
        let dir = self.options.screenshot_dir.as_ref()?;
        if !dir.is_dir() {
            warn!(
                target: "siteaudit::walker",
                route = %route.label,
                dir = %dir.display(),
                "screenshot directory does not exist; screenshot skipped"
            );
            return None;
        }

        let png = match self.page.screenshot_full_page().await {
            Ok(png) => png,
            Err(err) => {
                warn!(target: "siteaudit::walker", route = %route.label, %err, "screenshot capture failed");
                return None;
            }
        };
        let path = dir.join(format!("{}.png", route.slug()));
        match tokio::fs::write(&path, png).await {
            Ok(()) => {
                debug!(target: "siteaudit::walker", path = %path.display(), "screenshot saved");
                Some(path)
            }
            Err(err) => {
                warn!(target: "siteaudit::walker", path = %path.display(), %err, "failed to write screenshot");
                None
            }
        }
    }

    fn navigation_failed(
        &self,
        route: &RouteSpec,
        url: String,
        navigation_ms: Option<u64>,
        reason: String,
    ) -> RouteVisit {
        let err = AuditError::navigation(&route.label, reason.as_str());
        warn!(target: "siteaudit::walker", %err, "route not reachable");
        self.buffer
            .push(CapturedEvent::navigation_failure(&route.label, reason.clone()));
        RouteVisit {
            label: route.label.clone(),
            url,
            outcome: RouteOutcome::NavigationFailed,
            navigation_ms,
            screenshot: None,
            error: Some(reason),
        }
    }
}

fn skip_remaining(report: &mut WalkReport, base_url: &Url, routes: &[RouteSpec]) {
    for route in routes {
        report.visits.push(RouteVisit {
            label: route.label.clone(),
            url: route_url(base_url, &route.path)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| route.path.clone()),
            outcome: RouteOutcome::Skipped,
            navigation_ms: None,
            screenshot: None,
            error: None,
        });
    }
}

async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
