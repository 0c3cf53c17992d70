//! Podflow engine event stream.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`EngineEvent`]: envelope for every job and breaker state change.

pub mod bus;

pub use bus::{EngineEvent, EventBus, EventKind};
