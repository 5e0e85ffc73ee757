//! Circuit breaker implementation with lock-free atomics

use crate::clock::{Clock, MonotonicClock};
use crate::ResilienceError;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub max_failures: usize,
    /// How long the breaker stays open before admitting a probe.
    pub reset_timeout: Duration,
}

struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    probe_in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreakerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("state", &self.current_state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreakerPolicy {
    pub fn new(max_failures: usize, reset_timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig { max_failures, reset_timeout })
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                probe_in_flight: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests)
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Current breaker state, for observation only. Concurrent `execute`
    /// calls may transition the breaker at any moment.
    pub fn current_state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("Invalid circuit breaker state"),
        }
    }

    /// Force the breaker back to Closed with a zeroed failure count.
    /// Operator intervention and test setup only.
    ///
    /// The probe slot is left alone: a probe still in flight releases its own
    /// claim when it resolves, and storing over it would unbalance that
    /// accounting.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.failure_count.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        tracing::info!("circuit breaker reset -> closed");
    }

    /// Run `operation` if admission is granted, feeding its outcome back into
    /// the breaker. While Open, callers are rejected with `CircuitOpen` until
    /// the reset timeout has elapsed; exactly one probe is admitted at a time
    /// in Half-Open. A panic inside the operation is recorded as a failure
    /// before it resumes unwinding.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        // Check state and enforce policy
        let mut is_probe = false;
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);

            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed > self.config.reset_timeout.as_millis() as u64 {
                        // Claim the probe slot before publishing Half-Open, so
                        // no caller ever observes Half-Open with a free slot.
                        let claimed = self.state.probe_in_flight.fetch_add(1, Ordering::AcqRel);
                        if claimed > 0 {
                            // A prior probe has not fully resolved yet.
                            self.state.probe_in_flight.fetch_sub(1, Ordering::Release);
                            return Err(ResilienceError::CircuitOpen {
                                failure_count: self.state.failure_count.load(Ordering::Acquire),
                                open_duration: Duration::from_millis(elapsed),
                            });
                        }

                        // Try transition to half-open
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                // We won the race - we are the probe
                                tracing::info!("circuit breaker -> half-open");
                                is_probe = true;
                                break;
                            }
                            Err(STATE_HALF_OPEN) => {
                                // Someone else transitioned to half-open
                                // Re-check on next iteration
                                self.state.probe_in_flight.fetch_sub(1, Ordering::Release);
                                continue;
                            }
                            Err(STATE_CLOSED) => {
                                // Someone else closed it - we're good
                                self.state.probe_in_flight.fetch_sub(1, Ordering::Release);
                                break;
                            }
                            Err(_) => unreachable!("Invalid state transition"),
                        }
                    } else {
                        // Still in timeout period
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    // A single probe at a time; everyone else is rejected
                    let claimed = self.state.probe_in_flight.fetch_add(1, Ordering::AcqRel);
                    if claimed > 0 {
                        self.state.probe_in_flight.fetch_sub(1, Ordering::Release);
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(0),
                        });
                    }
                    tracing::debug!("circuit breaker: half-open probe admitted");
                    is_probe = true;
                    break;
                }
                STATE_CLOSED => {
                    break; // Normal operation
                }
                _ => unreachable!("Invalid circuit breaker state"),
            }
        }

        // Execute the operation; a panic must still release the probe slot and
        // count as a failure before resuming.
        let result = AssertUnwindSafe(operation()).catch_unwind().await;

        match &result {
            Ok(Ok(_)) => self.on_success(),
            Ok(Err(_)) | Err(_) => self.on_failure(),
        }

        // The slot is released only after the outcome's state CAS above, so no
        // caller can read HALF_OPEN with a free slot and run as a second probe
        // before this probe's result has been applied. Release is a decrement
        // to stay balanced against losing claimers' transient increments.
        if is_probe {
            self.state.probe_in_flight.fetch_sub(1, Ordering::Release);
        }

        match result {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn on_success(&self) {
        let current = self.state.state.load(Ordering::Acquire);

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("circuit breaker -> closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state
                        .opened_at_millis
                        .store(self.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: probe failed -> open");
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.max_failures {
                    if self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.state
                            .opened_at_millis
                            .store(self.now_millis(), Ordering::Release);
                        tracing::warn!(
                            failures,
                            threshold = self.config.max_failures,
                            "circuit breaker -> open"
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}
