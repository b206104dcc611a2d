//! Prometheus collectors for CDP traffic.
//!
//! Each adapter owns its own registry so a run can dump exactly its own numbers with
//! [`AdapterMetrics::render`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{
    histogram_opts, Encoder, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{AdapterError, AdapterErrorKind};

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub commands: u64,
    pub command_failures: u64,
    pub command_latency_total_us: u64,
    pub events: u64,
    pub network_idle: u64,
}

pub struct AdapterMetrics {
    registry: Registry,
    commands_total: IntCounterVec,
    command_failures_total: IntCounterVec,
    command_duration: HistogramVec,
    events_total: IntCounterVec,
    network_idle_total: IntCounter,
    commands: AtomicU64,
    command_failures: AtomicU64,
    command_latency_total_us: AtomicU64,
    events: AtomicU64,
    network_idle: AtomicU64,
}

impl AdapterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let commands_total = IntCounterVec::new(
            Opts::new("siteaudit_cdp_commands_total", "CDP commands sent"),
            &["method"],
        )?;
        let command_failures_total = IntCounterVec::new(
            Opts::new("siteaudit_cdp_command_failures_total", "CDP commands that failed"),
            &["method"],
        )?;
        let command_duration = HistogramVec::new(
            histogram_opts!(
                "siteaudit_cdp_command_duration_seconds",
                "CDP command round-trip latency",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["method"],
        )?;
        let events_total = IntCounterVec::new(
            Opts::new("siteaudit_cdp_events_total", "Adapter events published, by kind"),
            &["kind"],
        )?;
        let network_idle_total = IntCounter::new(
            "siteaudit_network_idle_total",
            "Transitions of a page into network idle",
        )?;

        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(command_failures_total.clone()))?;
        registry.register(Box::new(command_duration.clone()))?;
        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(network_idle_total.clone()))?;

        Ok(Self {
            registry,
            commands_total,
            command_failures_total,
            command_duration,
            events_total,
            network_idle_total,
            commands: AtomicU64::new(0),
            command_failures: AtomicU64::new(0),
            command_latency_total_us: AtomicU64::new(0),
            events: AtomicU64::new(0),
            network_idle: AtomicU64::new(0),
        })
    }

    pub fn record_command(&self, method: &str) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        self.commands_total.with_label_values(&[method]).inc();
    }

    pub fn record_command_success(&self, method: &str, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.command_latency_total_us
            .fetch_add(micros, Ordering::Relaxed);
        self.command_duration
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_command_failure(&self, method: &str) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
        self.command_failures_total
            .with_label_values(&[method])
            .inc();
    }

    pub fn record_event(&self, kind: &str) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.events_total.with_label_values(&[kind]).inc();
    }

    pub fn record_network_idle(&self) {
        self.network_idle.fetch_add(1, Ordering::Relaxed);
        self.network_idle_total.inc();
    }

    pub fn snapshot(&self) -> AdapterMetricsSnapshot {
        AdapterMetricsSnapshot {
            commands: self.commands.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            command_latency_total_us: self.command_latency_total_us.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            network_idle: self.network_idle.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition of every collector.
    pub fn render(&self) -> Result<String, AdapterError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|err| {
                AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string())
            })?;
        String::from_utf8(buffer)
            .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_commands_and_failures() {
        let metrics = AdapterMetrics::new().expect("metrics");
        metrics.record_command("Page.navigate");
        metrics.record_command_success("Page.navigate", Duration::from_micros(150));
        metrics.record_command("Page.navigate");
        metrics.record_command_failure("Page.navigate");
        metrics.record_event("console");

        let snap = metrics.snapshot();
        assert_eq!(snap.commands, 2);
        assert_eq!(snap.command_failures, 1);
        assert_eq!(snap.command_latency_total_us, 150);
        assert_eq!(snap.events, 1);
    }

    #[test]
    fn renders_text_exposition() {
        let metrics = AdapterMetrics::new().expect("metrics");
        metrics.record_command("Runtime.evaluate");
        metrics.record_network_idle();

        let text = metrics.render().expect("render");
        assert!(text.contains("siteaudit_cdp_commands_total{method=\"Runtime.evaluate\"} 1"));
        assert!(text.contains("siteaudit_network_idle_total 1"));
    }
}
