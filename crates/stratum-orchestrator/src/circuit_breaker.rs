use crate::config::CircuitBreakerConfig;
use parking_lot::Mutex;
use std::future::Future;
use std::time::SystemTime;
use stratum_common::error::{Result, StratumError};
use stratum_common::{CircuitState, DownstreamError};
use stratum_metrics::{CircuitBreakerMetrics, ResponseTimeWindow};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Mutable breaker bookkeeping, guarded by one lock.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition so permits from an older state are ignored
    generation: u64,
    failure_count: u32,
    success_count: u32,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    last_failure_time: Option<SystemTime>,
    last_success_time: Option<SystemTime>,
    state_changed_at: Instant,
    state_changed_wall: SystemTime,
    half_open_calls_in_flight: u32,
    response_times: ResponseTimeWindow,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            failure_count: 0,
            success_count: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            last_failure_time: None,
            last_success_time: None,
            state_changed_at: Instant::now(),
            state_changed_wall: SystemTime::now(),
            half_open_calls_in_flight: 0,
            response_times: ResponseTimeWindow::default(),
        }
    }
}

/// Outcome classes the state machine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

/// Admission ticket for one call.
///
/// Dropping a half-open permit without completing it (the caller's future was
/// cancelled) hands its trial slot back.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    completed: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.completed {
            let mut inner = self.breaker.inner.lock();
            if inner.generation == self.generation && inner.state == CircuitState::HalfOpen {
                inner.half_open_calls_in_flight = inner.half_open_calls_in_flight.saturating_sub(1);
            }
        }
    }
}

/// Failure-isolating state machine wrapping the call path of one instance.
///
/// ```text
///   CLOSED --(failure_threshold consecutive failures)--> OPEN
///   OPEN   --(recovery_timeout elapsed)----------------> HALF_OPEN
///   HALF_OPEN --(one success)--> CLOSED
///   HALF_OPEN --(one failure)--> OPEN
/// ```
///
/// The OPEN -> HALF_OPEN transition is applied lazily whenever the breaker is
/// consulted; no timer is involved.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    /// Breaker name, used in errors and log fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this breaker was built with.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after applying any due OPEN -> HALF_OPEN transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call issued now would be admitted.
    ///
    /// Does not reserve a half-open trial slot; [`CircuitBreaker::execute`]
    /// re-checks atomically when it admits the call.
    pub fn should_allow_execution(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_calls_in_flight < self.config.half_open_max_calls,
        }
    }

    /// Runs `operation` through the breaker.
    ///
    /// # Errors
    /// - [`StratumError::CircuitOpen`] when the call is refused; `operation` is never invoked
    /// - [`StratumError::Timeout`] when `operation` exceeds the configured timeout;
    ///   the operation future is dropped, which cancels it
    /// - [`StratumError::Downstream`] for errors matching the expected-error predicate
    /// - [`StratumError::CallFailed`] for every other downstream error
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, DownstreamError>>,
    {
        let mut permit = self.admit()?;
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout(), operation()).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        permit.completed = true;

        match outcome {
            Ok(Ok(value)) => {
                self.record(Outcome::Success, elapsed_ms, &permit);
                Ok(value)
            }
            Ok(Err(error)) if self.config.is_expected(&error) => {
                // The instance answered; business errors say nothing about its health
                self.record(Outcome::Success, elapsed_ms, &permit);
                Err(StratumError::Downstream(error))
            }
            Ok(Err(error)) => {
                self.record(Outcome::Failure, elapsed_ms, &permit);
                Err(StratumError::CallFailed {
                    breaker: self.name.clone(),
                    source: error,
                })
            }
            Err(_) => {
                self.record(Outcome::Failure, elapsed_ms, &permit);
                Err(StratumError::Timeout {
                    breaker: self.name.clone(),
                    timeout_ms: self.config.timeout_ms,
                })
            }
        }
    }

    /// Trips the breaker regardless of its counters.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            self.transition(&mut inner, CircuitState::Open);
        } else {
            inner.state_changed_at = Instant::now();
            inner.state_changed_wall = SystemTime::now();
        }
        warn!(breaker = %self.name, "Circuit forced open");
    }

    /// Returns the breaker to a fresh CLOSED state with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let generation = inner.generation + 1;
        *inner = BreakerState::new();
        inner.generation = generation;
        info!(breaker = %self.name, "Circuit reset");
    }

    /// Snapshot of counters and state. Failure rate is over completed calls.
    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        let completed = inner.total_failures + inner.total_successes;
        let failure_rate = if completed == 0 {
            0.0
        } else {
            inner.total_failures as f64 * 100.0 / completed as f64
        };
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            failure_rate,
            average_response_time_ms: inner.response_times.mean(),
            half_open_calls_in_flight: inner.half_open_calls_in_flight,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            state_changed_at: inner.state_changed_wall,
        }
    }

    /// Admits a call or rejects it with a circuit-open error.
    fn admit(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        let state = inner.state;
        let trial = match state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if inner.half_open_calls_in_flight < self.config.half_open_max_calls => {
                inner.half_open_calls_in_flight += 1;
                true
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.rejected_calls += 1;
                debug!(breaker = %self.name, %state, "Call rejected");
                return Err(StratumError::CircuitOpen {
                    breaker: self.name.clone(),
                });
            }
        };
        Ok(Permit {
            breaker: self,
            trial,
            generation: inner.generation,
            completed: false,
        })
    }

    fn record(&self, outcome: Outcome, elapsed_ms: f64, permit: &Permit<'_>) {
        let mut inner = self.inner.lock();
        inner.response_times.record(elapsed_ms);
        let current_generation = inner.generation == permit.generation;
        if permit.trial && current_generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_calls_in_flight = inner.half_open_calls_in_flight.saturating_sub(1);
        }

        let state = inner.state;
        match outcome {
            Outcome::Success => {
                inner.total_successes += 1;
                inner.last_success_time = Some(SystemTime::now());
                match state {
                    CircuitState::Closed => {
                        inner.failure_count = 0;
                        inner.success_count += 1;
                    }
                    CircuitState::HalfOpen => {
                        self.transition(&mut inner, CircuitState::Closed);
                        inner.success_count = 1;
                    }
                    // A call admitted before the circuit opened; it does not close it
                    CircuitState::Open => {}
                }
            }
            Outcome::Failure => {
                inner.total_failures += 1;
                inner.last_failure_time = Some(SystemTime::now());
                match state {
                    CircuitState::Closed => {
                        inner.failure_count += 1;
                        inner.success_count = 0;
                        if inner.failure_count >= self.config.failure_threshold {
                            self.transition(&mut inner, CircuitState::Open);
                        }
                    }
                    CircuitState::HalfOpen => {
                        inner.failure_count += 1;
                        self.transition(&mut inner, CircuitState::Open);
                    }
                    CircuitState::Open => {}
                }
            }
        }
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && inner.state_changed_at.elapsed() >= self.config.recovery_timeout()
        {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.state_changed_at = Instant::now();
        inner.state_changed_wall = SystemTime::now();
        inner.half_open_calls_in_flight = 0;
        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                %from,
                failures = inner.failure_count,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => info!(breaker = %self.name, %from, "Circuit half-open"),
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                info!(breaker = %self.name, %from, "Circuit closed");
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}
