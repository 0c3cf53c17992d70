//! Periodic cleanup of finished jobs and expired cache entries.
//!
//! Runs on a fixed `tokio::time::interval` until cancelled. Terminal jobs
//! older than the retention period are dropped from the queue (and from the
//! stats idempotency index); expired generation cache entries are purged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use podflow_pipeline::cache::GenerationCache;
use tokio_util::sync::CancellationToken;

use crate::queue::JobQueue;
use crate::stats::StatsAggregator;

pub struct Janitor {
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) stats: Arc<StatsAggregator>,
    pub(crate) cache: Arc<GenerationCache>,
    pub(crate) retention: Duration,
    pub(crate) interval: Duration,
}

impl Janitor {
    /// Run the cleanup loop until `cancel` is triggered.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Janitor started",
        );

        let mut interval = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        // The first tick completes immediately; nothing is old enough yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Janitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
    }

    /// One cleanup pass. Returns the number of jobs purged.
    pub fn sweep(&self) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let purged = self.queue.purge_finished(cutoff);
        self.stats.forget(&purged);
        let expired = self.cache.purge_expired();

        if purged.is_empty() && expired == 0 {
            tracing::debug!("Janitor: nothing to purge");
        } else {
            tracing::info!(jobs = purged.len(), cache_entries = expired, "Janitor: purged");
        }
        purged.len()
    }
}
