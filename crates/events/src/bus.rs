//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans out [`EngineEvent`]s to every subscriber: the HTTP
//! WebSocket stream, tests, or any embedding application. It is shared via
//! `Arc<EventBus>` between the engine, the scheduler and the breaker registry.

use chrono::{DateTime, Utc};
use podflow_core::circuit::CircuitState;
use podflow_core::error::ErrorKind;
use podflow_core::job::{Priority, Stage};
use podflow_core::types::JobId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

/// What happened. Serialized with a `type` tag, e.g.
/// `{"type":"job_progress","job_id":"...","stage":"image","progress":30}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobSubmitted {
        job_id: JobId,
        priority: Priority,
    },
    JobStarted {
        job_id: JobId,
        attempts: u32,
    },
    JobProgress {
        job_id: JobId,
        stage: Stage,
        progress: u8,
    },
    JobCompleted {
        job_id: JobId,
        /// Platforms published successfully.
        published: usize,
        /// Platforms that failed while others succeeded.
        failed_platforms: Vec<String>,
    },
    JobFailed {
        job_id: JobId,
        kind: ErrorKind,
        message: String,
    },
    JobCancelled {
        job_id: JobId,
    },
    JobRetried {
        job_id: JobId,
        attempts: u32,
    },
    CircuitStateChanged {
        dependency: String,
        from: CircuitState,
        to: CircuitState,
    },
}

impl EventKind {
    /// The job this event refers to, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EventKind::JobSubmitted { job_id, .. }
            | EventKind::JobStarted { job_id, .. }
            | EventKind::JobProgress { job_id, .. }
            | EventKind::JobCompleted { job_id, .. }
            | EventKind::JobFailed { job_id, .. }
            | EventKind::JobCancelled { job_id }
            | EventKind::JobRetried { job_id, .. } => Some(*job_id),
            EventKind::CircuitStateChanged { .. } => None,
        }
    }
}

/// A timestamped engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl EngineEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

impl From<EventKind> for EngineEvent {
    fn from(kind: EventKind) -> Self {
        Self::new(kind)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use podflow_events::{EventBus, EventKind};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.emit(EventKind::JobCancelled { job_id: podflow_core::types::new_job_id() });
/// ```
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: EngineEvent) {
        if let Err(err) = self.sender.send(event) {
            tracing::trace!(job_id = ?err.0.kind.job_id(), "No subscribers for event");
        }
    }

    /// Timestamp `kind` now and publish it.
    pub fn emit(&self, kind: EventKind) {
        self.publish(EngineEvent::new(kind));
    }

    /// Subscribe to all events published on this bus from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> JobId {
        podflow_core::types::new_job_id()
    }

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let job_id = id();

        bus.emit(EventKind::JobProgress {
            job_id,
            stage: Stage::Image,
            progress: 30,
        });

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.kind.job_id(), Some(job_id));
        assert_eq!(
            received.kind,
            EventKind::JobProgress {
                job_id,
                stage: Stage::Image,
                progress: 30
            }
        );
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(EventKind::JobCancelled { job_id: id() });

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1, e2);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(EventKind::JobCancelled { job_id: id() });
    }

    #[test]
    fn serializes_flat_with_type_tag() {
        let event = EngineEvent::new(EventKind::CircuitStateChanged {
            dependency: "image-generator".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "circuit_state_changed");
        assert_eq!(json["dependency"], "image-generator");
        assert_eq!(json["to"], "OPEN");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn failure_event_carries_error_kind() {
        let event = EngineEvent::new(EventKind::JobFailed {
            job_id: id(),
            kind: ErrorKind::TimeoutError,
            message: "Timed out".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_failed");
        assert_eq!(json["kind"], "TimeoutError");
    }
}
