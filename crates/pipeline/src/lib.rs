//! Pipeline execution with resilient external calls.
//!
//! - [`collaborators`]: traits for the prompt, image, asset and publish
//!   services, plus the bundle the executor is built from.
//! - [`cache`]: TTL + LRU cache and the generation (duplicate prompt) cache.
//! - [`circuit_breaker`]: per-dependency breaker and its registry.
//! - [`retry`]: exponential backoff around a breaker-guarded call.
//! - [`executor`]: runs prompt → image → storage → publish for one job.
//! - [`http`] / [`memory`]: JSON-over-HTTP and in-process collaborators.

pub mod cache;
pub mod circuit_breaker;
pub mod collaborators;
pub mod executor;
pub mod http;
pub mod memory;
pub mod retry;

pub use cache::{CacheStats, GenerationCache, TtlCache};
pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry};
pub use collaborators::{
    AssetStore, Collaborators, ImageGenerator, PlatformPublisher, PromptGenerator,
};
pub use executor::{PipelineExecutor, PipelineFailure, StageObserver};
pub use retry::{RetryFailure, RetryPolicy};
