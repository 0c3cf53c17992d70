//! Worker pool that drains the [`JobQueue`].
//!
//! `max_concurrent_jobs` workers each loop: claim the next job, run it to a
//! terminal state, repeat. A worker only claims a job when it is idle, so the
//! number of running jobs never exceeds the number of workers.
//!
//! Each run executes on its own task under the job deadline, so a panicking
//! collaborator fails that job instead of taking the worker down.

use std::sync::Arc;
use std::time::Duration;

use podflow_core::error::{ErrorKind, ServiceError, TimeoutScope};
use podflow_core::job::{Job, JobError, JobStatus, Stage};
use podflow_core::types::JobId;
use podflow_events::{EventBus, EventKind};
use podflow_pipeline::executor::{PipelineExecutor, StageObserver};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::queue::{Finish, JobQueue};
use crate::stats::StatsAggregator;

/// Forwards stage transitions to the queue and the event bus.
struct ProgressObserver {
    job_id: JobId,
    queue: Arc<JobQueue>,
    events: Arc<EventBus>,
}

impl StageObserver for ProgressObserver {
    fn stage_started(&self, stage: Stage) {
        self.queue.set_stage(self.job_id, stage);
        self.events.emit(EventKind::JobProgress {
            job_id: self.job_id,
            stage,
            progress: stage.progress(),
        });
    }
}

/// Everything a worker needs, shared between workers.
#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<JobQueue>,
    executor: Arc<PipelineExecutor>,
    stats: Arc<StatsAggregator>,
    events: Arc<EventBus>,
    job_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        executor: Arc<PipelineExecutor>,
        stats: Arc<StatsAggregator>,
        events: Arc<EventBus>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            executor,
            stats,
            events,
            job_timeout,
        }
    }

    /// Spawn `workers` worker loops onto `tasks`. They exit once `shutdown`
    /// fires and their current job (if any) has finished.
    pub fn spawn_workers(&self, workers: usize, shutdown: &CancellationToken, tasks: &mut JoinSet<()>) {
        for worker in 0..workers {
            let scheduler = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { scheduler.run_worker(worker, shutdown).await });
        }
        tracing::info!(workers, job_timeout_secs = self.job_timeout.as_secs(), "Scheduler started");
    }

    async fn run_worker(&self, worker: usize, shutdown: CancellationToken) {
        tracing::debug!(worker, "Worker started");
        while let Some((job, cancel)) = self.queue.wait_ready(&shutdown).await {
            self.execute(job, cancel).await;
        }
        tracing::debug!(worker, "Worker stopping");
    }

    /// Run one claimed job to a terminal state and record the outcome.
    pub(crate) async fn execute(&self, job: Job, cancel: CancellationToken) {
        let job_id = job.id;
        tracing::info!(
            job_id = %job_id,
            request = job.payload.label(),
            priority = job.priority.as_str(),
            attempts = job.attempts,
            "Job started",
        );
        self.events.emit(EventKind::JobStarted {
            job_id,
            attempts: job.attempts,
        });

        let finish = self.run_pipeline(job, cancel.clone()).await;
        // Stop anything the run may have left behind (timeout, panic).
        cancel.cancel();

        let Some(job) = self.queue.finish(job_id, finish) else {
            return;
        };
        self.stats.record_terminal(&job);
        self.announce(&job);
    }

    async fn run_pipeline(&self, job: Job, cancel: CancellationToken) -> Finish {
        let job_id = job.id;
        let observer = ProgressObserver {
            job_id,
            queue: Arc::clone(&self.queue),
            events: Arc::clone(&self.events),
        };
        let executor = Arc::clone(&self.executor);
        let deadline = self.job_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::timeout(
                deadline,
                executor.run(job_id, &job.payload, &cancel, &observer),
            )
            .await
        });

        match handle.await {
            Ok(Ok(Ok(result))) => Finish::Completed(result),
            Ok(Ok(Err(failure))) => match failure.error {
                ServiceError::Cancelled => Finish::Cancelled {
                    partial: Some(failure.partial),
                },
                error => Finish::Failed {
                    error: JobError::from_service(&error, failure.stage),
                    partial: Some(failure.partial),
                },
            },
            Ok(Err(_elapsed)) => {
                let stage = self.queue.get(job_id).and_then(|j| j.current_stage);
                let error = ServiceError::Timeout {
                    scope: TimeoutScope::Job,
                    after: deadline,
                };
                Finish::Failed {
                    error: JobError::from_service(&error, stage),
                    partial: None,
                }
            }
            Err(join_error) => {
                tracing::error!(job_id = %job_id, error = %join_error, "Job task aborted");
                let error = ServiceError::Internal(format!("Job task aborted: {join_error}"));
                Finish::Failed {
                    error: JobError::from_service(&error, None),
                    partial: None,
                }
            }
        }
    }

    fn announce(&self, job: &Job) {
        let job_id = job.id;
        match job.status {
            JobStatus::Completed => {
                let (published, failed_platforms) = match &job.result {
                    Some(result) => (
                        result.published_count(),
                        result
                            .publish
                            .iter()
                            .filter(|o| !o.success)
                            .map(|o| o.platform.clone())
                            .collect(),
                    ),
                    None => (0, Vec::new()),
                };
                tracing::info!(job_id = %job_id, published, failed = failed_platforms.len(), "Job completed");
                self.events.emit(EventKind::JobCompleted {
                    job_id,
                    published,
                    failed_platforms,
                });
            }
            JobStatus::Failed => {
                let (kind, message) = job
                    .error
                    .as_ref()
                    .map(|e| (e.kind, e.message.clone()))
                    .unwrap_or((ErrorKind::InternalError, String::new()));
                tracing::warn!(job_id = %job_id, kind = %kind, error = %message, "Job failed");
                self.events.emit(EventKind::JobFailed {
                    job_id,
                    kind,
                    message,
                });
            }
            JobStatus::Cancelled => {
                tracing::info!(job_id = %job_id, "Job cancelled while running");
                self.events.emit(EventKind::JobCancelled { job_id });
            }
            JobStatus::Pending | JobStatus::Running => {}
        }
    }
}
