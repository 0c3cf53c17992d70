//! Exponential backoff around breaker-guarded calls.
//!
//! The delay before attempt `n + 1` is
//! `min(max_delay, initial_delay * multiplier^(n - 1))`, optionally scaled
//! by a jitter factor in `[0.5, 1.5)` and clamped again. A rate-limit
//! `retry_after` hint replaces the computed delay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use podflow_core::error::{ServiceError, TimeoutScope};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreaker;

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&ServiceError) -> bool + Send + Sync>;

/// The last error of a call that could not be completed, with the number
/// of attempts that reached the dependency.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub error: ServiceError,
    pub attempts: u32,
}

impl From<RetryFailure> for ServiceError {
    fn from(failure: RetryFailure) -> Self {
        failure.error
    }
}

/// Tunable parameters for one class of external call.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    pub jitter: bool,
    /// Deadline for a single attempt. `None` disables it.
    pub call_timeout: Option<Duration>,
    pub retryable: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            call_timeout: Some(Duration::from_secs(120)),
            retryable: Arc::new(ServiceError::is_transient),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Replace the retryable-error predicate.
    pub fn with_predicate(
        mut self,
        retryable: impl Fn(&ServiceError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(retryable);
        self
    }

    /// Un-jittered delay after failed attempt number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis(ms.min(max_ms).max(0.0) as u64)
    }

    fn delay_for(&self, attempt: u32, err: &ServiceError) -> Duration {
        if let Some(hint) = err.retry_after() {
            return hint.min(self.max_delay);
        }
        let base = self.backoff_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        base.mul_f64(factor).min(self.max_delay)
    }

    /// Run `op` through `breaker` until it succeeds, fails permanently or
    /// runs out of attempts. Returns the value and the attempts used, or the
    /// last error and the attempts used.
    ///
    /// A circuit-open rejection is returned at once and does not consume an
    /// attempt. `cancel` is checked before every attempt and while sleeping;
    /// an attempt already in flight is never interrupted by it.
    pub async fn execute<T, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        let failed = |error, attempts| RetryFailure { error, attempts };

        loop {
            if cancel.is_cancelled() {
                return Err(failed(ServiceError::Cancelled, attempt));
            }

            let permit = breaker.try_acquire().map_err(|e| failed(e, attempt))?;
            attempt += 1;

            let result = match self.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(res) => res,
                    Err(_) => Err(ServiceError::Timeout {
                        scope: TimeoutScope::Call,
                        after: limit,
                    }),
                },
                None => op().await,
            };
            permit.record(&result);

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(dependency = breaker.name(), attempt, "Call succeeded after retry");
                    }
                    return Ok((value, attempt));
                }
                Err(e) => e,
            };

            if !(self.retryable)(&err) {
                tracing::warn!(
                    dependency = breaker.name(),
                    attempt,
                    error = %err,
                    "Call failed with non-retryable error",
                );
                return Err(failed(err, attempt));
            }
            if attempt >= max_attempts {
                tracing::warn!(
                    dependency = breaker.name(),
                    attempts = attempt,
                    error = %err,
                    "Retries exhausted",
                );
                return Err(failed(err, attempt));
            }

            let delay = self.delay_for(attempt, &err);
            tracing::info!(
                dependency = breaker.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Call failed, retrying",
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(failed(ServiceError::Cancelled, attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
