//! Job model, priority tiers and the job status state machine.
//!
//! Lives in `core` so the queue, the executor and the HTTP layer all agree
//! on the same status vocabulary and transition rules.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::artifacts::{ImageRef, Prompt, SavedAsset};
use crate::error::{ErrorKind, ServiceError};
use crate::request::PipelineRequest;
use crate::types::{new_job_id, JobId, Timestamp};

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Dispatch tier. Variants are declared lowest first so the derived `Ord`
/// ranks `Urgent` highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("Unknown priority '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus + state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("Unknown job status '{other}'")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed status transitions.
///
/// Status only moves forward, except that an explicit retry takes a failed
/// job back to pending.
pub mod state_machine {
    use super::JobStatus;

    /// Returns the set of statuses reachable from `from`.
    pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
        match from {
            JobStatus::Pending => &[JobStatus::Running, JobStatus::Cancelled],
            JobStatus::Running => &[
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
            // Retry
            JobStatus::Failed => &[JobStatus::Pending],
            JobStatus::Completed | JobStatus::Cancelled => &[],
        }
    }

    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a transition, returning an error message for invalid ones.
    pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid transition: {from} -> {to}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// One step of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prompt,
    Image,
    Storage,
    Publish,
}

/// Progress reported once every stage has finished.
pub const PROGRESS_DONE: u8 = 100;

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Prompt, Stage::Image, Stage::Storage, Stage::Publish];

    /// Progress value reported when the stage starts.
    pub fn progress(&self) -> u8 {
        match self {
            Stage::Prompt => 10,
            Stage::Image => 30,
            Stage::Storage => 50,
            Stage::Publish => 90,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prompt => "prompt",
            Stage::Image => "image",
            Stage::Storage => "storage",
            Stage::Publish => "publish",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and call count for one finished stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    /// External call attempts made by this stage (0 on a cache hit).
    pub attempts: u32,
    pub duration_ms: u64,
    pub cache_hit: bool,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Result of publishing to one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub platform: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PublishOutcome {
    pub fn published(
        platform: impl Into<String>,
        product_id: impl Into<String>,
        url: Option<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            success: true,
            product_id: Some(product_id.into()),
            url,
            error: None,
            message: None,
        }
    }

    pub fn failed(platform: impl Into<String>, err: &ServiceError) -> Self {
        Self {
            platform: platform.into(),
            success: false,
            product_id: None,
            url: None,
            error: Some(err.kind()),
            message: Some(err.to_string()),
        }
    }
}

/// Everything a pipeline run produced, possibly partial on failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub prompt: Option<Prompt>,
    pub images: Vec<ImageRef>,
    pub assets: Vec<SavedAsset>,
    pub publish: Vec<PublishOutcome>,
    pub stages: Vec<StageReport>,
}

impl JobResult {
    pub fn published_count(&self) -> usize {
        self.publish.iter().filter(|o| o.success).count()
    }

    /// True when at least one platform failed but not all of them.
    pub fn is_partial(&self) -> bool {
        let ok = self.published_count();
        ok > 0 && ok < self.publish.len()
    }

    /// True when platforms were requested and every one failed.
    pub fn all_platforms_failed(&self) -> bool {
        !self.publish.is_empty() && self.published_count() == 0
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }
}

/// Failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl JobError {
    pub fn from_service(err: &ServiceError, stage: Option<Stage>) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            stage,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One submitted pipeline request and its execution state.
///
/// This is also the read-only view handed to callers; the queue owns the
/// authoritative copy and hands out clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub priority: Priority,
    pub payload: PipelineRequest,
    pub status: JobStatus,
    pub progress: u8,
    /// Job-level retries requested so far.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub submitted_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl Job {
    pub fn new(payload: PipelineRequest, priority: Priority) -> Self {
        Self {
            id: new_job_id(),
            priority,
            payload,
            status: JobStatus::Pending,
            progress: 0,
            attempts: 0,
            current_stage: None,
            result: None,
            error: None,
            submitted_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::state_machine::*;
    use super::*;

    // -- priority ------------------------------------------------------------

    #[test]
    fn urgent_ranks_above_everything() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn priority_defaults_to_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn priority_parses_lowercase_names() {
        assert_eq!("urgent".parse::<Priority>(), Ok(Priority::Urgent));
        assert!("URGENT".parse::<Priority>().is_err());
    }

    // -- state machine -------------------------------------------------------

    #[test]
    fn pending_to_running() {
        assert!(can_transition(JobStatus::Pending, JobStatus::Running));
    }

    #[test]
    fn pending_to_cancelled() {
        assert!(can_transition(JobStatus::Pending, JobStatus::Cancelled));
    }

    #[test]
    fn running_to_each_terminal_state() {
        assert!(can_transition(JobStatus::Running, JobStatus::Completed));
        assert!(can_transition(JobStatus::Running, JobStatus::Failed));
        assert!(can_transition(JobStatus::Running, JobStatus::Cancelled));
    }

    #[test]
    fn failed_can_only_go_back_to_pending() {
        assert_eq!(valid_transitions(JobStatus::Failed), &[JobStatus::Pending]);
    }

    #[test]
    fn completed_and_cancelled_are_final() {
        assert!(valid_transitions(JobStatus::Completed).is_empty());
        assert!(valid_transitions(JobStatus::Cancelled).is_empty());
    }

    #[test]
    fn pending_cannot_skip_to_completed() {
        assert!(!can_transition(JobStatus::Pending, JobStatus::Completed));
    }

    #[test]
    fn running_cannot_go_back_to_pending() {
        assert!(!can_transition(JobStatus::Running, JobStatus::Pending));
    }

    #[test]
    fn invalid_transition_message_names_both_states() {
        let err = validate_transition(JobStatus::Completed, JobStatus::Running).unwrap_err();
        assert_eq!(err, "Invalid transition: completed -> running");
    }

    // -- stages --------------------------------------------------------------

    #[test]
    fn stage_progress_increases() {
        let values: Vec<u8> = Stage::ALL.iter().map(Stage::progress).collect();
        assert_eq!(values, vec![10, 30, 50, 90]);
        assert!(values.iter().all(|v| *v < PROGRESS_DONE));
    }

    // -- results -------------------------------------------------------------

    fn outcome(platform: &str, success: bool) -> PublishOutcome {
        if success {
            PublishOutcome::published(platform, "p-1", None)
        } else {
            PublishOutcome::failed(platform, &ServiceError::transient("down"))
        }
    }

    #[test]
    fn partial_when_some_platforms_fail() {
        let result = JobResult {
            publish: vec![outcome("a", true), outcome("b", false)],
            ..Default::default()
        };
        assert!(result.is_partial());
        assert!(!result.all_platforms_failed());
    }

    #[test]
    fn all_failed_requires_at_least_one_platform() {
        assert!(!JobResult::default().all_platforms_failed());
        let result = JobResult {
            publish: vec![outcome("a", false), outcome("b", false)],
            ..Default::default()
        };
        assert!(result.all_platforms_failed());
    }

    #[test]
    fn failed_outcome_serializes_error_kind_by_name() {
        let open = ServiceError::CircuitOpen {
            dependency: "platform:b".into(),
        };
        let json = serde_json::to_value(PublishOutcome::failed("b", &open)).unwrap();
        assert_eq!(json["platform"], "b");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "CircuitOpenError");
        assert!(json.get("product_id").is_none());
    }
}
