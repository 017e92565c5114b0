use crate::state::{PrStage, PrState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

const MAX_SAMPLES: usize = 1000;
const ERROR_RATE_WINDOW_MINUTES: i64 = 5;

/// Process-wide metrics aggregate. Explicitly passed to whoever records into
/// it; every public method is safe under concurrent mutation.
pub struct Metrics {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    issues_processed: HashMap<String, u64>,
    prs_merged: u64,
    prs_failed: u64,
    prs_conflicting: u64,
    circuit_breaker_trips: u64,
    api_errors: HashMap<String, u64>,
    label_cleanups: HashMap<String, u64>,
    active_prs_by_stage: HashMap<PrStage, u64>,
    queue_depth: u64,
    failed_queue_depth: u64,
    pr_time_to_merge: Vec<Duration>,
    ci_wait_durations: Vec<Duration>,
    execution_durations: Vec<Duration>,
    api_error_events: Vec<DateTime<Utc>>,
}

/// Deep copy of the aggregate at one instant, with derived fields filled in.
/// Later mutations of [`Metrics`] never show through an existing snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub issues_processed: HashMap<String, u64>,
    pub prs_merged: u64,
    pub prs_failed: u64,
    pub prs_conflicting: u64,
    pub circuit_breaker_trips: u64,
    pub api_errors: HashMap<String, u64>,
    pub label_cleanups: HashMap<String, u64>,
    pub active_prs_by_stage: HashMap<PrStage, u64>,
    pub queue_depth: u64,
    pub failed_queue_depth: u64,
    pub pr_time_to_merge: Vec<Duration>,
    pub ci_wait_durations: Vec<Duration>,
    pub execution_durations: Vec<Duration>,

    pub total_active_prs: u64,
    /// Fraction of processed issues whose result was "success"; 0 when
    /// nothing was processed yet.
    pub success_rate: f64,
    /// API errors per minute over the trailing five-minute window.
    pub api_error_rate: f64,
    pub avg_time_to_merge: Duration,
    pub avg_ci_wait: Duration,
    pub avg_execution: Duration,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn record_issue_processed(&self, result: &str) {
        let mut inner = self.inner.write().unwrap();
        *inner.issues_processed.entry(result.into()).or_insert(0) += 1;
    }

    pub fn record_pr_merged(&self) {
        self.inner.write().unwrap().prs_merged += 1;
    }

    pub fn record_pr_failed(&self) {
        self.inner.write().unwrap().prs_failed += 1;
    }

    pub fn record_pr_conflicting(&self) {
        self.inner.write().unwrap().prs_conflicting += 1;
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.inner.write().unwrap().circuit_breaker_trips += 1;
    }

    pub fn record_label_cleanup(&self, label: &str) {
        let mut inner = self.inner.write().unwrap();
        *inner.label_cleanups.entry(label.into()).or_insert(0) += 1;
    }

    pub fn record_api_error(&self, endpoint: &str) {
        let mut inner = self.inner.write().unwrap();
        *inner.api_errors.entry(endpoint.into()).or_insert(0) += 1;
        inner.api_error_events.push(Utc::now());
        truncate_ring(&mut inner.api_error_events);
    }

    /// Rebuilds the per-stage gauge from scratch so stages with no live PRs
    /// drop back to zero.
    pub fn update_active_prs(&self, prs: &[PrState]) {
        let mut inner = self.inner.write().unwrap();
        inner.active_prs_by_stage.clear();
        for pr in prs {
            *inner.active_prs_by_stage.entry(pr.stage).or_insert(0) += 1;
        }
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.inner.write().unwrap().queue_depth = depth;
    }

    pub fn set_failed_queue_depth(&self, depth: u64) {
        self.inner.write().unwrap().failed_queue_depth = depth;
    }

    pub fn record_time_to_merge(&self, elapsed: Duration) {
        let mut inner = self.inner.write().unwrap();
        inner.pr_time_to_merge.push(elapsed);
        truncate_ring(&mut inner.pr_time_to_merge);
    }

    pub fn record_ci_wait(&self, elapsed: Duration) {
        let mut inner = self.inner.write().unwrap();
        inner.ci_wait_durations.push(elapsed);
        truncate_ring(&mut inner.ci_wait_durations);
    }

    pub fn record_execution(&self, elapsed: Duration) {
        let mut inner = self.inner.write().unwrap();
        inner.execution_durations.push(elapsed);
        truncate_ring(&mut inner.execution_durations);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().unwrap();
        let total_active_prs = inner.active_prs_by_stage.values().sum();
        let issues_total: u64 = inner.issues_processed.values().sum();
        let success_rate = if issues_total == 0 {
            0.0
        } else {
            *inner.issues_processed.get("success").unwrap_or(&0) as f64 / issues_total as f64
        };
        let window_start = Utc::now() - ChronoDuration::minutes(ERROR_RATE_WINDOW_MINUTES);
        let recent_errors = inner
            .api_error_events
            .iter()
            .filter(|at| **at >= window_start)
            .count();
        let api_error_rate = recent_errors as f64 / ERROR_RATE_WINDOW_MINUTES as f64;

        MetricsSnapshot {
            issues_processed: inner.issues_processed.clone(),
            prs_merged: inner.prs_merged,
            prs_failed: inner.prs_failed,
            prs_conflicting: inner.prs_conflicting,
            circuit_breaker_trips: inner.circuit_breaker_trips,
            api_errors: inner.api_errors.clone(),
            label_cleanups: inner.label_cleanups.clone(),
            active_prs_by_stage: inner.active_prs_by_stage.clone(),
            queue_depth: inner.queue_depth,
            failed_queue_depth: inner.failed_queue_depth,
            pr_time_to_merge: inner.pr_time_to_merge.clone(),
            ci_wait_durations: inner.ci_wait_durations.clone(),
            execution_durations: inner.execution_durations.clone(),
            total_active_prs,
            success_rate,
            api_error_rate,
            avg_time_to_merge: average(&inner.pr_time_to_merge),
            avg_ci_wait: average(&inner.ci_wait_durations),
            avg_execution: average(&inner.execution_durations),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_ring<T>(samples: &mut Vec<T>) {
    if samples.len() > MAX_SAMPLES {
        samples.drain(..samples.len() - MAX_SAMPLES);
    }
}

fn average(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let total: Duration = samples.iter().sum();
    total / samples.len() as u32
}
