use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

/// Hub and orchestrator activity counters
#[derive(Debug)]
pub struct HubMetrics {
    enabled: AtomicBool,
    pub total_requests: AtomicU64,
    pub errors: AtomicU64,
    pub claim_conflicts: AtomicU64,
    pub auto_releases: AtomicU64,
    pub events_delivered: AtomicU64,
    pub connections_opened: AtomicU64,
    pub runs_admitted: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            total_requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            claim_conflicts: AtomicU64::new(0),
            auto_releases: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            runs_admitted: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
        }
    }
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters stay frozen while disabled
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn bump(&self, counter: &AtomicU64, by: u64) {
        if self.is_enabled() {
            counter.fetch_add(by, Ordering::Relaxed);
        }
    }

    pub fn record_request(&self) {
        self.bump(&self.total_requests, 1);
    }

    pub fn record_error(&self) {
        self.bump(&self.errors, 1);
    }

    pub fn record_claim_conflict(&self) {
        self.bump(&self.claim_conflicts, 1);
    }

    pub fn record_auto_release(&self) {
        self.bump(&self.auto_releases, 1);
    }

    pub fn record_events_delivered(&self, count: usize) {
        self.bump(&self.events_delivered, count as u64);
    }

    pub fn record_connection(&self) {
        self.bump(&self.connections_opened, 1);
    }

    pub fn record_run_admitted(&self) {
        self.bump(&self.runs_admitted, 1);
    }

    pub fn record_run_completed(&self) {
        self.bump(&self.runs_completed, 1);
    }

    pub fn record_run_failed(&self) {
        self.bump(&self.runs_failed, 1);
    }

    pub fn get_stats(&self) -> HubStats {
        HubStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
            auto_releases: self.auto_releases.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            runs_admitted: self.runs_admitted.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Hub metrics: requests={}, errors={}, claim_conflicts={}, auto_releases={}, events={}, connections={}, runs admitted/completed/failed={}/{}/{}",
            stats.total_requests,
            stats.errors,
            stats.claim_conflicts,
            stats.auto_releases,
            stats.events_delivered,
            stats.connections_opened,
            stats.runs_admitted,
            stats.runs_completed,
            stats.runs_failed
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    pub total_requests: u64,
    pub errors: u64,
    pub claim_conflicts: u64,
    pub auto_releases: u64,
    pub events_delivered: u64,
    pub connections_opened: u64,
    pub runs_admitted: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
}

/// Global metrics instance
static HUB_METRICS: std::sync::LazyLock<HubMetrics> = std::sync::LazyLock::new(HubMetrics::new);

pub fn hub_metrics() -> &'static HubMetrics {
    &HUB_METRICS
}
