use crate::metrics::{Metrics, MetricsSnapshot};
use crate::store::{MetricsRow, StateStore, StoreError};
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const HISTORY_RETENTION_DAYS: i64 = 7;

/// Periodically flattens the live metrics into a history row and prunes old
/// rows. Persistence problems are warned about and swallowed; losing a
/// metrics sample must never disturb the lifecycle workers.
pub struct MetricsPersister {
    store: Arc<StateStore>,
    metrics: Arc<Metrics>,
    flush_interval: Duration,
    retention: ChronoDuration,
}

impl MetricsPersister {
    pub fn new(store: Arc<StateStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            metrics,
            flush_interval: FLUSH_INTERVAL,
            retention: ChronoDuration::days(HISTORY_RETENTION_DAYS),
        }
    }

    #[cfg(test)]
    fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Runs until the shutdown signal flips, then writes one final row.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.flush_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush() {
                        warn!("Failed to persist metrics snapshot: {}", e);
                    }
                    if let Err(e) = self.store.purge_old_metrics(self.retention) {
                        warn!("Failed to prune metrics history: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if let Err(e) = self.flush() {
                        warn!("Failed to persist final metrics snapshot: {}", e);
                    }
                    debug!("Metrics persister stopped");
                    return;
                }
            }
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        let row = flatten(&self.metrics.snapshot());
        self.store.insert_metrics_snapshot(&row)
    }
}

fn flatten(snapshot: &MetricsSnapshot) -> MetricsRow {
    MetricsRow {
        recorded_at: Utc::now(),
        prs_merged: snapshot.prs_merged,
        prs_failed: snapshot.prs_failed,
        prs_conflicting: snapshot.prs_conflicting,
        circuit_breaker_trips: snapshot.circuit_breaker_trips,
        api_errors_total: snapshot.api_errors.values().sum(),
        issues_succeeded: *snapshot.issues_processed.get("success").unwrap_or(&0),
        issues_failed: *snapshot.issues_processed.get("failed").unwrap_or(&0),
        issues_rate_limited: *snapshot.issues_processed.get("rate_limited").unwrap_or(&0),
        avg_time_to_merge_ms: snapshot.avg_time_to_merge.as_millis() as i64,
        avg_ci_wait_ms: snapshot.avg_ci_wait.as_millis() as i64,
        avg_execution_ms: snapshot.avg_execution.as_millis() as i64,
        success_rate: snapshot.success_rate,
        api_error_rate: snapshot.api_error_rate,
    }
}
