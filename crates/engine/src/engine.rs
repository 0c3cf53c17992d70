//! The [`Engine`] facade: the only entry point callers need.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use podflow_core::error::CoreError;
use podflow_core::job::{Job, Priority};
use podflow_core::request::{PipelineRequest, MAX_BATCH_SIZE};
use podflow_core::types::{JobId, Timestamp};
use podflow_events::{EngineEvent, EventBus, EventKind};
use podflow_pipeline::cache::GenerationCache;
use podflow_pipeline::circuit_breaker::CircuitBreakerRegistry;
use podflow_pipeline::collaborators::Collaborators;
use podflow_pipeline::executor::PipelineExecutor;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::janitor::Janitor;
use crate::queue::{CancelOutcome, JobFilter, JobQueue};
use crate::scheduler::Scheduler;
use crate::stats::{StatsAggregator, StatsSnapshot};

/// Owns the queue, worker pool, breakers, cache and stats.
///
/// Construct once at startup, wrap in an `Arc`, call [`Engine::start`] from
/// inside a Tokio runtime, and [`Engine::shutdown`] before exiting.
pub struct Engine {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    executor: Arc<PipelineExecutor>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<GenerationCache>,
    stats: Arc<StatsAggregator>,
    events: Arc<EventBus>,
    /// Parent of every job's cancellation token.
    jobs_root: CancellationToken,
    /// Stops the workers and the janitor.
    shutdown: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.breaker).with_events(Arc::clone(&events)),
        );
        let cache = Arc::new(GenerationCache::new(
            config.cache_capacity,
            config.prompt_cache_ttl,
            config.image_cache_ttl,
        ));
        let executor = Arc::new(PipelineExecutor::new(
            collaborators,
            Arc::clone(&breakers),
            Arc::clone(&cache),
            config.retry_policy(),
        ));
        let jobs_root = CancellationToken::new();

        Self {
            queue: Arc::new(JobQueue::new(jobs_root.clone())),
            executor,
            breakers,
            cache,
            stats: Arc::new(StatsAggregator::new()),
            events,
            jobs_root,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(None),
            config,
        }
    }

    // -- lifecycle -------------------------------------------------------------

    /// Spawn the worker pool and the janitor. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let mut set = JoinSet::new();
        let scheduler = Scheduler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.executor),
            Arc::clone(&self.stats),
            Arc::clone(&self.events),
            self.config.job_timeout,
        );
        scheduler.spawn_workers(self.config.max_concurrent_jobs, &self.shutdown, &mut set);

        let janitor = Janitor {
            queue: Arc::clone(&self.queue),
            stats: Arc::clone(&self.stats),
            cache: Arc::clone(&self.cache),
            retention: self.config.job_retention,
            interval: self.config.cleanup_interval,
        };
        set.spawn(janitor.run(self.shutdown.clone()));

        *tasks = Some(set);
    }

    /// Stop taking jobs, cancel running ones and wait up to `grace` for the
    /// workers to record their outcome. Pending jobs stay pending.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.jobs_root.cancel();

        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut tasks) = tasks else {
            return;
        };

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Engine task ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(grace_secs = grace.as_secs(), "Engine shutdown timed out; aborting tasks");
            tasks.abort_all();
        } else {
            tracing::info!("Engine stopped");
        }
    }

    // -- jobs ----------------------------------------------------------------

    /// Validate and enqueue one request.
    pub fn submit(&self, request: PipelineRequest, priority: Priority) -> Result<JobId, CoreError> {
        let job = self.prepare(request, priority)?;
        let id = job.id;
        self.queue.push(job);
        self.stats.record_submitted(1);
        self.events.emit(EventKind::JobSubmitted {
            job_id: id,
            priority,
        });
        tracing::info!(job_id = %id, priority = priority.as_str(), "Job submitted");
        Ok(id)
    }

    /// Validate every request, then enqueue all of them or none.
    pub fn submit_batch(
        &self,
        requests: Vec<(PipelineRequest, Priority)>,
    ) -> Result<Vec<JobId>, CoreError> {
        if requests.is_empty() {
            return Err(CoreError::Validation("Batch must contain at least one item".into()));
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(CoreError::Validation(format!(
                "Batch exceeds the maximum of {MAX_BATCH_SIZE} items"
            )));
        }

        let jobs = requests
            .into_iter()
            .enumerate()
            .map(|(i, (request, priority))| {
                self.prepare(request, priority).map_err(|e| match e {
                    CoreError::Validation(msg) => CoreError::Validation(format!("items[{i}]: {msg}")),
                    other => other,
                })
            })
            .collect::<Result<Vec<Job>, CoreError>>()?;

        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        let announced: Vec<(JobId, Priority)> = jobs.iter().map(|j| (j.id, j.priority)).collect();
        self.queue.push_all(jobs);
        self.stats.record_submitted(ids.len());
        for (job_id, priority) in announced {
            self.events.emit(EventKind::JobSubmitted { job_id, priority });
        }
        tracing::info!(count = ids.len(), "Job batch submitted");
        Ok(ids)
    }

    fn prepare(&self, request: PipelineRequest, priority: Priority) -> Result<Job, CoreError> {
        let collaborators = self.executor.collaborators();
        request.validate_with(|platform| collaborators.has_platform(platform))?;
        Ok(Job::new(request, priority))
    }

    pub fn get(&self, id: JobId) -> Result<Job, CoreError> {
        self.queue.get(id).ok_or_else(|| CoreError::NotFound {
            entity: "job",
            id: id.to_string(),
        })
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.queue.list(filter)
    }

    /// Cancel a pending job immediately or ask a running one to stop at its
    /// next checkpoint. Returns the job as it is right now.
    pub fn cancel(&self, id: JobId) -> Result<Job, CoreError> {
        match self.queue.cancel(id)? {
            CancelOutcome::Cancelled(job) => {
                self.stats.record_terminal(&job);
                self.events.emit(EventKind::JobCancelled { job_id: id });
                tracing::info!(job_id = %id, "Pending job cancelled");
                Ok(job)
            }
            CancelOutcome::Requested(job) => {
                tracing::info!(job_id = %id, "Cancellation requested for running job");
                Ok(job)
            }
        }
    }

    /// Re-enqueue a failed job as a fresh run.
    pub fn retry(&self, id: JobId) -> Result<Job, CoreError> {
        let job = self.queue.retry(id)?;
        self.stats.record_retried();
        self.events.emit(EventKind::JobRetried {
            job_id: id,
            attempts: job.attempts,
        });
        tracing::info!(job_id = %id, attempts = job.attempts, "Job retried");
        Ok(job)
    }

    /// Drop terminal jobs finished before `older_than`. Returns how many.
    pub fn purge_finished(&self, older_than: Timestamp) -> usize {
        let purged = self.queue.purge_finished(older_than);
        self.stats.forget(&purged);
        purged.len()
    }

    // -- observation ----------------------------------------------------------

    pub async fn metrics(&self) -> StatsSnapshot {
        self.stats.snapshot(
            self.queue.counts(),
            self.breakers.snapshot().await,
            self.cache.stats(),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<GenerationCache> {
        &self.cache
    }

    /// Platforms with a registered publisher.
    pub fn platforms(&self) -> Vec<String> {
        self.executor.collaborators().platforms()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
