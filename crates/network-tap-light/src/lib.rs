//! Per-page network activity tap.
//!
//! The tap tracks in-flight requests by CDP `requestId` and answers one question for the
//! navigation code: has this page been network idle for the configured quiet window? Every
//! state change also refreshes a [`TrafficSummary`] that is broadcast to interested listeners.

pub mod config;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::TapConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Identifier of a page tracked by the tap.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PageKey(pub Uuid);

impl PageKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PageKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time traffic counters for one page.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub requests: u64,
    pub ok: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub inflight: u64,
    pub quiet: bool,
    pub since_last_activity_ms: u64,
}

/// Snapshot tagged with its page, as published on the summary bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrafficSummary {
    pub page: PageKey,
    pub snapshot: TrafficSnapshot,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TapError {
    #[error("page not enabled")]
    PageNotEnabled,
}

/// Network notifications the tap understands, keyed by CDP `requestId`.
#[derive(Clone, Debug)]
pub enum TapEvent {
    RequestStarted { request_id: String },
    ResponseReceived { request_id: String, status: i64 },
    RequestFinished { request_id: String },
    RequestFailed { request_id: String },
}

pub type SummaryBus = broadcast::Sender<TrafficSummary>;

#[derive(Debug)]
struct PageTraffic {
    inflight: HashMap<String, Instant>,
    requests: u64,
    ok: u64,
    client_errors: u64,
    server_errors: u64,
    last_activity: Instant,
    last_publish: Instant,
    last_quiet: bool,
}

impl PageTraffic {
    fn new(config: &TapConfig) -> Self {
        let now = Instant::now();
        Self {
            inflight: HashMap::new(),
            requests: 0,
            ok: 0,
            client_errors: 0,
            server_errors: 0,
            last_activity: now,
            last_publish: now
                .checked_sub(Duration::from_millis(config.min_publish_interval_ms))
                .unwrap_or(now),
            last_quiet: false,
        }
    }

    fn apply(&mut self, event: TapEvent, now: Instant) {
        self.last_activity = now;
        match event {
            TapEvent::RequestStarted { request_id } => {
                // Redirects reuse the request id; count the hop but not a second slot.
                self.requests += 1;
                self.inflight.insert(request_id, now);
            }
            TapEvent::ResponseReceived { status, .. } => match status {
                200..=399 => self.ok += 1,
                400..=499 => self.client_errors += 1,
                500..=599 => self.server_errors += 1,
                _ => {}
            },
            TapEvent::RequestFinished { request_id } | TapEvent::RequestFailed { request_id } => {
                self.inflight.remove(&request_id);
            }
        }
    }

    /// Drops requests that have been pending longer than `max_request_age_ms`.
    fn expire_stale(&mut self, now: Instant, config: &TapConfig) -> usize {
        let max_age = Duration::from_millis(config.max_request_age_ms);
        let before = self.inflight.len();
        self.inflight
            .retain(|_, started| now.saturating_duration_since(*started) < max_age);
        before - self.inflight.len()
    }

    fn snapshot(&self, now: Instant, config: &TapConfig) -> TrafficSnapshot {
        let since_last = now.saturating_duration_since(self.last_activity).as_millis() as u64;
        TrafficSnapshot {
            requests: self.requests,
            ok: self.ok,
            client_errors: self.client_errors,
            server_errors: self.server_errors,
            inflight: self.inflight.len() as u64,
            quiet: self.inflight.is_empty() && since_last >= config.quiet_window_ms,
            since_last_activity_ms: since_last,
        }
    }

    fn should_publish(&mut self, quiet: bool, now: Instant, config: &TapConfig) -> bool {
        let interval_elapsed = now.saturating_duration_since(self.last_publish).as_millis() as u64
            >= config.min_publish_interval_ms;
        let turned_quiet = quiet && !self.last_quiet;
        self.last_quiet = quiet;
        if interval_elapsed || turned_quiet {
            self.last_publish = now;
            true
        } else {
            false
        }
    }
}

pub struct NetworkTapLight {
    pub bus: SummaryBus,
    pages: DashMap<PageKey, Arc<Mutex<PageTraffic>>>,
    config: TapConfig,
}

/// Keeps the maintenance loop alive; dropping it stops the loop.
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub async fn shutdown(mut self) -> Result<(), tokio::task::JoinError> {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => match task.await {
                Err(err) if !err.is_cancelled() => Err(err),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl NetworkTapLight {
    pub fn new(buffer: usize) -> (Self, broadcast::Receiver<TrafficSummary>) {
        Self::with_config(TapConfig::default(), buffer)
    }

    pub fn with_config(
        config: TapConfig,
        buffer: usize,
    ) -> (Self, broadcast::Receiver<TrafficSummary>) {
        let (tx, rx) = broadcast::channel(buffer);
        (
            Self {
                bus: tx,
                pages: DashMap::new(),
                config,
            },
            rx,
        )
    }

    pub fn config(&self) -> &TapConfig {
        &self.config
    }

    /// Spawns the loop that expires stale requests and announces quiet transitions.
    pub fn spawn_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        let tap = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let every = Duration::from_millis(self.config.maintenance_interval_ms.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => tap.evaluate_timeouts().await,
                }
            }
        });
        MaintenanceHandle {
            cancel,
            task: Some(task),
        }
    }

    /// Starts tracking a page. Enabling twice keeps the existing counters.
    pub fn enable(&self, page: PageKey) {
        self.pages
            .entry(page)
            .or_insert_with(|| Arc::new(Mutex::new(PageTraffic::new(&self.config))));
    }

    pub fn disable(&self, page: PageKey) -> Result<(), TapError> {
        self.pages
            .remove(&page)
            .map(|_| ())
            .ok_or(TapError::PageNotEnabled)
    }

    pub fn is_enabled(&self, page: PageKey) -> bool {
        self.pages.contains_key(&page)
    }

    fn traffic(&self, page: PageKey) -> Result<Arc<Mutex<PageTraffic>>, TapError> {
        self.pages
            .get(&page)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TapError::PageNotEnabled)
    }

    pub async fn ingest(&self, page: PageKey, event: TapEvent) -> Result<(), TapError> {
        let traffic = self.traffic(page)?;
        let now = Instant::now();
        let mut guard = traffic.lock().await;
        guard.apply(event, now);
        let snapshot = guard.snapshot(now, &self.config);
        let publish = guard.should_publish(snapshot.quiet, now, &self.config);
        drop(guard);

        if publish {
            self.publish(page, snapshot);
        }
        Ok(())
    }

    /// Live counters for a page; quiet state is computed at call time.
    pub async fn snapshot(&self, page: PageKey) -> Option<TrafficSnapshot> {
        let traffic = self.traffic(page).ok()?;
        let guard = traffic.lock().await;
        Some(guard.snapshot(Instant::now(), &self.config))
    }

    pub async fn evaluate_timeouts(&self) {
        let now = Instant::now();
        let pages: Vec<(PageKey, Arc<Mutex<PageTraffic>>)> = self
            .pages
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (page, traffic) in pages {
            let mut guard = traffic.lock().await;
            let expired = guard.expire_stale(now, &self.config);
            if expired > 0 {
                debug!(target: "network-tap", page = %page.0, expired, "expired long-running requests");
            }
            let snapshot = guard.snapshot(now, &self.config);
            let publish = guard.should_publish(snapshot.quiet, now, &self.config);
            drop(guard);

            if publish {
                self.publish(page, snapshot);
            }
        }
    }

    fn publish(&self, page: PageKey, snapshot: TrafficSnapshot) {
        let _ = self.bus.send(TrafficSummary { page, snapshot });
    }
}
