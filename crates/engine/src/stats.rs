//! Running job, publish and stage-timing counters.
//!
//! Terminal transitions are recorded at most once per `(job, attempt)` so a
//! duplicate notification never double counts, while a retried job that
//! fails again is counted again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use podflow_core::job::{Job, JobStatus, Stage};
use podflow_core::types::JobId;
use podflow_pipeline::cache::GenerationCacheStats;
use podflow_pipeline::circuit_breaker::BreakerSnapshot;
use serde::Serialize;
use tokio::time::Instant;

use crate::queue::QueueCounts;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounters {
    pub submitted: u64,
    pub completed: u64,
    /// Completed jobs where at least one platform failed.
    pub partially_completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformCounters {
    pub published: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageTiming {
    pub runs: u64,
    pub avg_duration_ms: f64,
}

/// Read-only metrics view.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub jobs: JobCounters,
    pub queue: QueueCounts,
    pub platforms: BTreeMap<String, PlatformCounters>,
    pub stages: BTreeMap<&'static str, StageTiming>,
    pub circuit_breakers: Vec<BreakerSnapshot>,
    pub cache: GenerationCacheStats,
    pub uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DurationTotal {
    runs: u64,
    total_ms: u64,
}

#[derive(Default)]
struct Inner {
    jobs: JobCounters,
    platforms: BTreeMap<String, PlatformCounters>,
    stages: HashMap<Stage, DurationTotal>,
    /// Last attempt number recorded per job.
    recorded: HashMap<JobId, u32>,
}

pub struct StatsAggregator {
    inner: Mutex<Inner>,
    started: Instant,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_submitted(&self, count: usize) {
        self.lock().jobs.submitted += count as u64;
    }

    pub fn record_retried(&self) {
        self.lock().jobs.retried += 1;
    }

    /// Fold a terminal job into the counters.
    ///
    /// Returns `false` (and changes nothing) if this attempt of the job was
    /// already recorded or the job is not terminal.
    pub fn record_terminal(&self, job: &Job) -> bool {
        if !job.is_terminal() {
            return false;
        }
        let mut inner = self.lock();
        if inner.recorded.get(&job.id) == Some(&job.attempts) {
            return false;
        }
        inner.recorded.insert(job.id, job.attempts);

        match job.status {
            JobStatus::Completed => {
                inner.jobs.completed += 1;
                if job.result.as_ref().is_some_and(|r| r.is_partial()) {
                    inner.jobs.partially_completed += 1;
                }
            }
            JobStatus::Failed => inner.jobs.failed += 1,
            JobStatus::Cancelled => inner.jobs.cancelled += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }

        if let Some(result) = &job.result {
            for outcome in &result.publish {
                let counters = inner.platforms.entry(outcome.platform.clone()).or_default();
                if outcome.success {
                    counters.published += 1;
                } else {
                    counters.failed += 1;
                }
            }
            for report in &result.stages {
                let total = inner.stages.entry(report.stage).or_default();
                total.runs += 1;
                total.total_ms += report.duration_ms;
            }
        }
        true
    }

    /// Drop idempotency bookkeeping for purged jobs.
    pub fn forget(&self, ids: &[JobId]) {
        let mut inner = self.lock();
        for id in ids {
            inner.recorded.remove(id);
        }
    }

    pub fn snapshot(
        &self,
        queue: QueueCounts,
        circuit_breakers: Vec<BreakerSnapshot>,
        cache: GenerationCacheStats,
    ) -> StatsSnapshot {
        let inner = self.lock();
        let stages = Stage::ALL
            .iter()
            .filter_map(|stage| {
                let total = inner.stages.get(stage)?;
                let avg = if total.runs == 0 {
                    0.0
                } else {
                    total.total_ms as f64 / total.runs as f64
                };
                Some((
                    stage.as_str(),
                    StageTiming {
                        runs: total.runs,
                        avg_duration_ms: avg,
                    },
                ))
            })
            .collect();

        StatsSnapshot {
            jobs: inner.jobs.clone(),
            queue,
            platforms: inner.platforms.clone(),
            stages,
            circuit_breakers,
            cache,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use podflow_core::error::{ErrorKind, ServiceError};
    use podflow_core::job::{JobError, JobResult, Priority, PublishOutcome, StageReport};
    use podflow_core::request::{PipelineOptions, PipelineRequest};
    use podflow_pipeline::cache::GenerationCache;

    use super::*;

    fn terminal(status: JobStatus, result: Option<JobResult>) -> Job {
        let mut job = Job::new(
            PipelineRequest::theme("abstract", PipelineOptions::default()),
            Priority::Normal,
        );
        job.status = status;
        job.result = result;
        job
    }

    fn snapshot(stats: &StatsAggregator) -> StatsSnapshot {
        let cache = GenerationCache::new(1, std::time::Duration::from_secs(1), std::time::Duration::from_secs(1));
        stats.snapshot(QueueCounts::default(), Vec::new(), cache.stats())
    }

    #[test]
    fn duplicate_terminal_notifications_are_ignored() {
        let stats = StatsAggregator::new();
        let job = terminal(JobStatus::Completed, None);
        assert!(stats.record_terminal(&job));
        assert!(!stats.record_terminal(&job));
        assert_eq!(snapshot(&stats).jobs.completed, 1);
    }

    #[test]
    fn retried_attempt_counts_again() {
        let stats = StatsAggregator::new();
        let mut job = terminal(JobStatus::Failed, None);
        job.error = Some(JobError {
            kind: ErrorKind::TimeoutError,
            message: "slow".into(),
            stage: None,
        });
        stats.record_terminal(&job);
        job.attempts = 1;
        stats.record_terminal(&job);
        assert_eq!(snapshot(&stats).jobs.failed, 2);
    }

    #[test]
    fn non_terminal_jobs_are_not_recorded() {
        let stats = StatsAggregator::new();
        assert!(!stats.record_terminal(&terminal(JobStatus::Running, None)));
    }

    #[test]
    fn publish_outcomes_and_stage_timings_are_aggregated() {
        let stats = StatsAggregator::new();
        let result = |ms| JobResult {
            publish: vec![
                PublishOutcome::published("shop_a", "p1", None),
                PublishOutcome::failed("shop_b", &ServiceError::transient("down")),
            ],
            stages: vec![StageReport {
                stage: Stage::Image,
                attempts: 1,
                duration_ms: ms,
                cache_hit: false,
            }],
            ..Default::default()
        };
        stats.record_terminal(&terminal(JobStatus::Completed, Some(result(100))));
        stats.record_terminal(&terminal(JobStatus::Completed, Some(result(300))));

        let snap = snapshot(&stats);
        assert_eq!(snap.jobs.partially_completed, 2);
        assert_eq!(snap.platforms["shop_a"].published, 2);
        assert_eq!(snap.platforms["shop_b"].failed, 2);
        assert_eq!(snap.stages["image"].avg_duration_ms, 200.0);
        assert!(!snap.stages.contains_key("publish"));
    }

    #[test]
    fn submitted_and_retried_counters() {
        let stats = StatsAggregator::new();
        stats.record_submitted(3);
        stats.record_retried();
        let snap = snapshot(&stats);
        assert_eq!(snap.jobs.submitted, 3);
        assert_eq!(snap.jobs.retried, 1);
    }
}
