//! Report aggregation: a pure summary over the buffered events, plus the operator rendering.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{AuditStatus, CapturedEvent, RouteSpec, Severity, SeverityPolicy};
use super::session::AuditRecord;
use super::walker::{RouteOutcome, WalkReport};

const TOP_FINDINGS: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub total_routes: usize,
    pub routes_with_any_event: usize,
    /// Only severities that occurred; a clean run has an empty map.
    pub counts_by_severity: BTreeMap<Severity, usize>,
    pub counts_by_type: BTreeMap<String, usize>,
    pub routes: Vec<RouteSummary>,
    pub findings: Vec<Finding>,
    pub overall_status: AuditStatus,
}

impl AuditSummary {
    pub fn count(&self, severity: Severity) -> usize {
        self.counts_by_severity.get(&severity).copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub label: String,
    pub events: usize,
    pub worst_severity: Option<Severity>,
    pub status: AuditStatus,
}

/// Identical events (same route, type and text) collapsed into one entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub severity: Severity,
    pub route: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub occurrences: usize,
    pub first_seen: DateTime<Utc>,
}

/// Summary under the default severity policy.
pub fn summarize(routes: &[RouteSpec], events: &[CapturedEvent]) -> AuditSummary {
    summarize_with(routes, events, &SeverityPolicy::default())
}

pub fn summarize_with(
    routes: &[RouteSpec],
    events: &[CapturedEvent],
    policy: &SeverityPolicy,
) -> AuditSummary {
    let mut counts_by_severity = BTreeMap::new();
    let mut counts_by_type = BTreeMap::new();
    let mut per_route: HashMap<&str, (usize, Option<Severity>)> = HashMap::new();
    let mut findings: Vec<Finding> = Vec::new();
    let mut finding_index: HashMap<(String, &'static str, String), usize> = HashMap::new();

    for event in events {
        let severity = policy.classify(event);
        *counts_by_severity.entry(severity).or_insert(0) += 1;
        *counts_by_type
            .entry(event.kind.type_name().to_string())
            .or_insert(0) += 1;

        let slot = per_route.entry(event.route.as_str()).or_insert((0, None));
        slot.0 += 1;
        slot.1 = Some(slot.1.map_or(severity, |worst| worst.min(severity)));

        let key = (event.route.clone(), event.kind.type_name(), event.kind.describe());
        match finding_index.get(&key) {
            Some(&idx) => findings[idx].occurrences += 1,
            None => {
                finding_index.insert(key.clone(), findings.len());
                findings.push(Finding {
                    severity,
                    route: key.0,
                    kind: key.1.to_string(),
                    message: key.2,
                    occurrences: 1,
                    first_seen: event.timestamp,
                });
            }
        }
    }
    // Stable sort keeps first-appearance order within a severity.
    findings.sort_by_key(|finding| finding.severity);

    let route_summaries: Vec<RouteSummary> = routes
        .iter()
        .map(|route| {
            let (events, worst) = per_route
                .get(route.label.as_str())
                .copied()
                .unwrap_or((0, None));
            RouteSummary {
                label: route.label.clone(),
                events,
                worst_severity: worst,
                status: AuditStatus::from_worst(worst),
            }
        })
        .collect();

    let overall_status = if counts_by_severity.contains_key(&Severity::Critical) {
        AuditStatus::Failed
    } else {
        AuditStatus::Passed
    };

    AuditSummary {
        total_routes: routes.len(),
        routes_with_any_event: route_summaries.iter().filter(|r| r.events > 0).count(),
        counts_by_severity,
        counts_by_type,
        routes: route_summaries,
        findings,
        overall_status,
    }
}

/// Operator report: route-by-route result, severity counts, top findings and the verdict.
pub fn render_human(record: &AuditRecord) -> String {
    let summary = &record.summary;
    let mut out = String::new();
    let elapsed = Duration::from_millis(record.duration().as_millis() as u64);

    let _ = writeln!(out, "siteaudit report for {}", record.target_url);
    let _ = writeln!(
        out,
        "session {} | started {} | took {}",
        record.session_id,
        record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        humantime::format_duration(elapsed)
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "Routes ({}):", summary.total_routes);
    for route in &summary.routes {
        let _ = writeln!(out, "  {}", route_line(route, &record.walk));
    }
    let _ = writeln!(out);

    if summary.counts_by_severity.is_empty() {
        let _ = writeln!(out, "No console errors, exceptions or failed requests captured.");
    } else {
        let counts: Vec<String> = summary
            .counts_by_severity
            .iter()
            .map(|(severity, count)| format!("{severity}={count}"))
            .collect();
        let _ = writeln!(out, "Severity counts: {}", counts.join(" "));
        let _ = writeln!(
            out,
            "Routes with findings: {}/{}",
            summary.routes_with_any_event, summary.total_routes
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "Findings:");
        for finding in summary.findings.iter().take(TOP_FINDINGS) {
            let repeat = if finding.occurrences > 1 {
                format!(" (x{})", finding.occurrences)
            } else {
                String::new()
            };
            let _ = writeln!(
                out,
                "  [{:<8}] {} | {}: {}{}",
                finding.severity.as_str(),
                finding.route,
                finding.kind,
                truncate(&finding.message, 160),
                repeat
            );
        }
        if summary.findings.len() > TOP_FINDINGS {
            let _ = writeln!(out, "  ... {} more", summary.findings.len() - TOP_FINDINGS);
        }
    }
    let _ = writeln!(out);

    if record.walk.interrupted {
        let _ = writeln!(
            out,
            "Run interrupted: {} route(s) not visited.",
            record.walk.count(RouteOutcome::Skipped)
        );
    }
    let _ = write!(out, "Overall: {}", summary.overall_status);
    out
}

fn route_line(route: &RouteSummary, walk: &WalkReport) -> String {
    let visit = walk.visit(&route.label);
    let verdict = match visit.map(|v| v.outcome) {
        Some(RouteOutcome::Skipped) => "SKIP",
        _ => match route.status {
            AuditStatus::Passed => "PASS",
            AuditStatus::Failed => "FAIL",
        },
    };
    let mut line = format!("{verdict}  {}", route.label);
    if let Some(visit) = visit {
        let _ = write!(line, " ({})", visit.url);
        if let Some(ms) = visit.navigation_ms {
            let _ = write!(line, " {ms} ms");
        }
    }
    let _ = write!(line, ", {} event(s)", route.events);
    if let Some(worst) = route.worst_severity {
        let _ = write!(line, ", worst {worst}");
    }
    line
}

fn truncate(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max_chars {
        return first_line.to_string();
    }
    let cut: String = first_line.chars().take(max_chars).collect();
    format!("{cut}...")
}
