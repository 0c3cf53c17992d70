//! In-memory job store and priority dispatch queue.
//!
//! Dispatch order is highest priority tier first, then submission order
//! within a tier. Every job lives in one map behind one lock, together with
//! the heap of dispatch tickets, so enqueue, dequeue, cancel and retry never
//! observe each other half-done.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use podflow_core::error::CoreError;
use podflow_core::job::{
    state_machine, Job, JobError, JobResult, JobStatus, Priority, Stage, PROGRESS_DONE,
};
use podflow_core::types::{JobId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default page size for [`JobQueue::list`].
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Largest accepted page size for [`JobQueue::list`].
pub const MAX_LIST_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Tickets
// ---------------------------------------------------------------------------

/// Heap entry. A ticket is stale once its job left `pending` or was
/// re-enqueued under a newer sequence number.
#[derive(Debug, PartialEq, Eq)]
struct Ticket {
    priority: Priority,
    seq: u64,
    id: JobId,
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Filter and page for [`JobQueue::list`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<Priority>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Result of [`JobQueue::cancel`].
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled.
    Cancelled(Job),
    /// The job is running; the executor will stop at its next checkpoint.
    Requested(Job),
}

impl CancelOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CancelOutcome::Cancelled(job) | CancelOutcome::Requested(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            CancelOutcome::Cancelled(job) | CancelOutcome::Requested(job) => job,
        }
    }
}

/// How a running job ended.
#[derive(Debug, Clone)]
pub enum Finish {
    Completed(JobResult),
    Failed {
        error: JobError,
        partial: Option<JobResult>,
    },
    Cancelled {
        partial: Option<JobResult>,
    },
}

impl Finish {
    fn status(&self) -> JobStatus {
        match self {
            Finish::Completed(_) => JobStatus::Completed,
            Finish::Failed { .. } => JobStatus::Failed,
            Finish::Cancelled { .. } => JobStatus::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

struct Slot {
    job: Job,
    cancel: CancellationToken,
    seq: u64,
}

struct State {
    jobs: HashMap<JobId, Slot>,
    ready: BinaryHeap<Ticket>,
    next_seq: u64,
}

impl State {
    fn enqueue(&mut self, id: JobId, priority: Priority) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(Ticket { priority, seq, id });
        seq
    }
}

pub struct JobQueue {
    state: Mutex<State>,
    notify: Notify,
    /// Parent of every job's cancellation token.
    root: CancellationToken,
}

impl JobQueue {
    /// Create a queue whose job tokens are children of `root`; cancelling
    /// `root` cancels every job.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            state: Mutex::new(State {
                jobs: HashMap::new(),
                ready: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            root,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store pending jobs and make them dispatchable, all under one lock.
    pub fn push_all(&self, jobs: Vec<Job>) {
        let count = jobs.len();
        {
            let mut state = self.lock();
            for job in jobs {
                debug_assert_eq!(job.status, JobStatus::Pending);
                let seq = state.enqueue(job.id, job.priority);
                state.jobs.insert(
                    job.id,
                    Slot {
                        job,
                        cancel: self.root.child_token(),
                        seq,
                    },
                );
            }
        }
        for _ in 0..count {
            self.notify.notify_one();
        }
    }

    pub fn push(&self, job: Job) {
        self.push_all(vec![job]);
    }

    /// Claim the next dispatchable job, marking it running.
    pub fn next_ready(&self) -> Option<(Job, CancellationToken)> {
        let mut state = self.lock();
        while let Some(ticket) = state.ready.pop() {
            let Some(slot) = state.jobs.get_mut(&ticket.id) else {
                continue;
            };
            if slot.seq != ticket.seq || slot.job.status != JobStatus::Pending {
                continue;
            }
            slot.job.status = JobStatus::Running;
            slot.job.started_at = Some(Utc::now());
            return Some((slot.job.clone(), slot.cancel.clone()));
        }
        None
    }

    /// Wait until a job can be claimed or `shutdown` fires.
    pub async fn wait_ready(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<(Job, CancellationToken)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(claimed) = self.next_ready() {
                return Some(claimed);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).map(|s| s.job.clone())
    }

    /// Record that a running job entered `stage`.
    pub fn set_stage(&self, id: JobId, stage: Stage) {
        if let Some(slot) = self.lock().jobs.get_mut(&id) {
            if slot.job.status == JobStatus::Running {
                slot.job.current_stage = Some(stage);
                slot.job.progress = stage.progress();
            }
        }
    }

    /// Move a running job to its terminal status.
    ///
    /// Returns `None` if the job is unknown or not running.
    pub fn finish(&self, id: JobId, finish: Finish) -> Option<Job> {
        let mut state = self.lock();
        let slot = state.jobs.get_mut(&id)?;
        let to = finish.status();
        if let Err(e) = state_machine::validate_transition(slot.job.status, to) {
            tracing::error!(job_id = %id, error = %e, "Refusing job transition");
            return None;
        }

        let job = &mut slot.job;
        job.status = to;
        job.current_stage = None;
        job.finished_at = Some(Utc::now());
        match finish {
            Finish::Completed(result) => {
                job.progress = PROGRESS_DONE;
                job.result = Some(result);
                job.error = None;
            }
            Finish::Failed { error, partial } => {
                job.error = Some(error);
                job.result = partial;
            }
            Finish::Cancelled { partial } => {
                job.result = partial;
            }
        }
        Some(job.clone())
    }

    /// Cancel a pending job outright, or flag a running one.
    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, CoreError> {
        let mut state = self.lock();
        let slot = state.jobs.get_mut(&id).ok_or_else(|| not_found(id))?;

        match slot.job.status {
            JobStatus::Pending => {
                slot.cancel.cancel();
                slot.job.status = JobStatus::Cancelled;
                slot.job.finished_at = Some(Utc::now());
                Ok(CancelOutcome::Cancelled(slot.job.clone()))
            }
            JobStatus::Running => {
                slot.cancel.cancel();
                Ok(CancelOutcome::Requested(slot.job.clone()))
            }
            status => Err(CoreError::Conflict(format!(
                "Job {id} is already {status}"
            ))),
        }
    }

    /// Put a failed job back in the queue as a fresh run.
    pub fn retry(&self, id: JobId) -> Result<Job, CoreError> {
        let job = {
            let mut state = self.lock();
            let slot = state.jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
            if slot.job.status != JobStatus::Failed {
                return Err(CoreError::Conflict(format!(
                    "Only failed jobs can be retried; job {id} is {}",
                    slot.job.status
                )));
            }

            let job = &mut slot.job;
            job.status = JobStatus::Pending;
            job.attempts += 1;
            job.progress = 0;
            job.current_stage = None;
            job.result = None;
            job.error = None;
            job.started_at = None;
            job.finished_at = None;
            slot.cancel = self.root.child_token();
            let snapshot = job.clone();

            let priority = snapshot.priority;
            let seq = state.enqueue(id, priority);
            if let Some(slot) = state.jobs.get_mut(&id) {
                slot.seq = seq;
            }
            snapshot
        };
        self.notify.notify_one();
        Ok(job)
    }

    /// Jobs matching `filter`, newest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .min(MAX_LIST_LIMIT);
        let offset = filter.offset.unwrap_or(0);

        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .map(|s| &s.job)
            .filter(|j| filter.status.map_or(true, |s| s == j.status))
            .filter(|j| filter.priority.map_or(true, |p| p == j.priority))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(b.id.cmp(&a.id)));
        jobs.into_iter().skip(offset).take(limit).collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for slot in self.lock().jobs.values() {
            match slot.job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Remove terminal jobs that finished before `cutoff`.
    pub fn purge_finished(&self, cutoff: Timestamp) -> Vec<JobId> {
        let mut state = self.lock();
        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|s| s.job.is_terminal() && s.job.finished_at.is_some_and(|t| t < cutoff))
            .map(|s| s.job.id)
            .collect();
        for id in &stale {
            state.jobs.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(id: JobId) -> CoreError {
    CoreError::NotFound {
        entity: "job",
        id: id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
