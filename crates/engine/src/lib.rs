//! Job orchestration engine.
//!
//! [`Engine`] owns the job queue, the worker pool, the circuit breaker
//! registry, the generation cache and the stats aggregator. It is built once
//! at startup and shared behind an `Arc`; nothing here is global.

pub mod config;
pub mod engine;
pub mod janitor;
pub mod queue;
pub mod scheduler;
pub mod stats;

pub use config::EngineConfig;
pub use engine::Engine;
pub use queue::{CancelOutcome, JobFilter, JobQueue, QueueCounts};
pub use stats::{StatsAggregator, StatsSnapshot};
