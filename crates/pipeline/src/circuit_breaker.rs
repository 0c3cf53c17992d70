//! Per-dependency circuit breaker.
//!
//! # State machine
//!
//! ```text
//! Closed   --[failure_threshold failures within window]--> Open
//! Open     --[cooldown elapsed, next call]-------------> HalfOpen
//! HalfOpen --[trial call succeeds]---------------------> Closed
//! HalfOpen --[trial call fails]------------------------> Open (cooldown restarts)
//! ```
//!
//! Only one trial call runs in `HalfOpen`; concurrent callers are rejected
//! until it finishes. All state lives behind one mutex per breaker so
//! concurrent workers never lose a failure count or a transition.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use podflow_core::circuit::CircuitState;
use podflow_core::error::ServiceError;
use podflow_core::types::Timestamp;
use podflow_events::{EventBus, EventKind};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures within `window` that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a trial call.
    pub cooldown: Duration,
    /// Failure counting window while closed.
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            window: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of one breaker, for metrics and health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<Timestamp>,
    /// Milliseconds until an open circuit admits a trial call.
    pub next_attempt_in_ms: Option<u64>,
    pub times_opened: u64,
    pub rejected_calls: u64,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    window_start: Instant,
    last_failure_at: Option<Timestamp>,
    next_attempt: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
    rejected_calls: u64,
}

type Transition = (CircuitState, CircuitState);

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    events: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                window_start: Instant::now(),
                last_failure_at: None,
                next_attempt: None,
                trial_in_flight: false,
                times_opened: 0,
                rejected_calls: 0,
            }),
            events: None,
        }
    }

    /// Publish state transitions on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask for permission to make one call.
    ///
    /// Returns [`ServiceError::CircuitOpen`] without touching the
    /// dependency when the circuit is open or a trial call is in flight.
    pub fn try_acquire(&self) -> Result<Permit<'_>, ServiceError> {
        let now = Instant::now();
        let (result, transition) = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => (Ok(false), None),
                CircuitState::Open => {
                    let ready = inner.next_attempt.map_or(true, |at| now >= at);
                    if ready {
                        inner.state = CircuitState::HalfOpen;
                        inner.trial_in_flight = true;
                        (Ok(true), Some((CircuitState::Open, CircuitState::HalfOpen)))
                    } else {
                        inner.rejected_calls += 1;
                        (Err(()), None)
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        inner.rejected_calls += 1;
                        (Err(()), None)
                    } else {
                        inner.trial_in_flight = true;
                        (Ok(true), None)
                    }
                }
            }
        };
        self.announce(transition);

        match result {
            Ok(trial) => Ok(Permit {
                breaker: self,
                trial,
                settled: false,
            }),
            Err(()) => Err(ServiceError::CircuitOpen {
                dependency: self.name.clone(),
            }),
        }
    }

    /// Run `op` under the breaker and record its outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let permit = self.try_acquire()?;
        let result = op().await;
        permit.record(&result);
        result
    }

    fn on_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::HalfOpen if trial => {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 1;
                    inner.trial_in_flight = false;
                    inner.next_attempt = None;
                    inner.window_start = Instant::now();
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                }
                CircuitState::Closed => {
                    inner.success_count = inner.success_count.saturating_add(1);
                    None
                }
                // Late result of a call admitted before the circuit opened.
                _ => None,
            }
        };
        self.announce(transition);
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.lock();
            inner.last_failure_at = Some(chrono::Utc::now());
            match inner.state {
                CircuitState::Closed => {
                    if now.duration_since(inner.window_start) >= self.config.window {
                        inner.window_start = now;
                        inner.failure_count = 0;
                        inner.success_count = 0;
                    }
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        self.open(&mut inner, now);
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if trial => {
                    self.open(&mut inner, now);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                _ => None,
            }
        };
        self.announce(transition);
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.next_attempt = Some(now + self.config.cooldown);
        inner.trial_in_flight = false;
        inner.times_opened += 1;
    }

    /// A trial permit dropped without an outcome frees the slot for the
    /// next caller; the circuit stays half-open.
    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.window_start = Instant::now();
            inner.next_attempt = None;
            inner.trial_in_flight = false;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        self.announce(transition);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        let next_attempt_in_ms = match inner.state {
            CircuitState::Open => inner
                .next_attempt
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            next_attempt_in_ms,
            times_opened: inner.times_opened,
            rejected_calls: inner.rejected_calls,
        }
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => tracing::warn!(
                dependency = %self.name,
                from = %from,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit opened",
            ),
            _ => tracing::info!(dependency = %self.name, from = %from, to = %to, "Circuit state changed"),
        }
        if let Some(bus) = &self.events {
            bus.emit(EventKind::CircuitStateChanged {
                dependency: self.name.clone(),
                from,
                to,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// Admission for one call. Report the outcome with [`Permit::record`].
#[derive(Debug)]
#[must_use = "record the call outcome on the permit"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    /// Whether this is the single half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record the outcome of the admitted call.
    ///
    /// Transient failures count against the dependency. Any other error means
    /// the dependency answered and is treated as healthy. Cancellation is
    /// neutral.
    pub fn record<T>(mut self, outcome: &Result<T, ServiceError>) {
        self.settled = true;
        match outcome {
            Ok(_) => self.breaker.on_success(self.trial),
            Err(ServiceError::Cancelled) => {
                if self.trial {
                    self.breaker.release_trial();
                }
            }
            Err(e) if e.counts_against_dependency() => self.breaker.on_failure(self.trial),
            Err(_) => self.breaker.on_success(self.trial),
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lazily created breakers keyed by dependency name.
pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Use `config` instead of the defaults for `name`.
    pub fn with_override(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Get the breaker for `name`, creating it on first use.
    pub async fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let config = self.overrides.get(name).copied().unwrap_or(self.defaults);
            let mut breaker = CircuitBreaker::new(name, config);
            if let Some(bus) = &self.events {
                breaker = breaker.with_events(Arc::clone(bus));
            }
            tracing::debug!(dependency = %name, "Circuit breaker created");
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    /// Snapshots of every breaker created so far, sorted by name.
    pub async fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .read()
            .await
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Names of breakers currently open.
    pub async fn open_circuits(&self) -> Vec<String> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.name)
            .collect()
    }

    /// Reset one breaker. Returns `false` if it was never created.
    pub async fn reset(&self, name: &str) -> bool {
        match self.breakers.read().await.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
