//! Token-bucket rate limiting.
//!
//! [`TokenBucket`] is the admission primitive: it refills lazily at a fixed
//! interval up to a ceiling, and callers either poll ([`TokenBucket::try_acquire`])
//! or block until a token arrives or a deadline fires ([`TokenBucket::acquire`]).
//! [`TokenBucketRegistry`] keeps one bucket per caller key, created lazily.
//!
//! The bucket never fails an operation; it only denies admission.

use crate::clock::{Clock, MonotonicClock};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors returned when configuring a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// The refill interval must be at least one millisecond.
    ZeroRefillInterval,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitError::ZeroRefillInterval => {
                write!(f, "refill interval must be at least 1ms")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Errors returned by blocking acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// No token became available before the deadline.
    DeadlineExceeded { waited: Duration },
    /// The caller's cancellation signal fired while waiting.
    Cancelled,
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquireError::DeadlineExceeded { waited } => {
                write!(f, "no token available within deadline (waited {:?})", waited)
            }
            AcquireError::Cancelled => write!(f, "acquisition cancelled"),
        }
    }
}

impl std::error::Error for AcquireError {}

struct BucketState {
    tokens: u64,
    last_refill_millis: u64,
}

/// Token bucket with lazy refill.
///
/// One token is added per refill interval, up to `max_tokens`. The refill
/// bookkeeping advances `last_refill` by whole consumed intervals rather than
/// snapping it to `now`, so sub-interval credit is never discarded.
pub struct TokenBucket {
    max_tokens: u64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("max_tokens", &self.max_tokens)
            .field("refill_interval", &self.refill_interval)
            .finish()
    }
}

impl TokenBucket {
    /// Create a bucket holding up to `max_tokens`, refilling one token per
    /// `refill_interval`. New buckets start full.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::ZeroRefillInterval`] when the interval is
    /// below the millisecond granularity the clock provides.
    #[must_use = "the result must be checked for validation errors"]
    pub fn new(max_tokens: u64, refill_interval: Duration) -> Result<Self, RateLimitError> {
        if refill_interval.as_millis() == 0 {
            return Err(RateLimitError::ZeroRefillInterval);
        }
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis();
        Ok(Self {
            max_tokens,
            refill_interval,
            state: Mutex::new(BucketState { tokens: max_tokens, last_refill_millis: now }),
            clock,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Override the clock (useful for deterministic tests)
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        {
            let mut state = self.lock_state();
            state.last_refill_millis = clock.now_millis();
        }
        self.clock = clock;
        self
    }

    /// Override the sleeper used between acquisition polls.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Maximum number of tokens the bucket can hold.
    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// The configured refill interval.
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Non-blocking acquisition. Returns true iff a token was consumed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock_state();
        self.refill(&mut state);
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after a lazy refill.
    pub fn available(&self) -> u64 {
        let mut state = self.lock_state();
        self.refill(&mut state);
        state.tokens
    }

    /// Block until a token is available or `deadline` elapses.
    pub async fn acquire(&self, deadline: Duration) -> Result<(), AcquireError> {
        self.acquire_with_cancel(deadline, &CancellationToken::new()).await
    }

    /// Block until a token is available, `deadline` elapses, or `cancel`
    /// fires. Sleeps at most one refill interval between polls, so both the
    /// deadline and the cancellation are observed promptly.
    pub async fn acquire_with_cancel(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        let start = self.clock.now_millis();
        loop {
            if self.try_acquire() {
                return Ok(());
            }

            let waited = Duration::from_millis(self.clock.now_millis().saturating_sub(start));
            if waited >= deadline {
                return Err(AcquireError::DeadlineExceeded { waited });
            }

            let nap = self.refill_interval.min(deadline - waited);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                _ = self.sleeper.sleep(nap) => {}
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let interval_millis = self.refill_interval.as_millis() as u64;
        let now = self.clock.now_millis();
        let elapsed = now.saturating_sub(state.last_refill_millis);
        let tokens_to_add = elapsed / interval_millis;
        if tokens_to_add > 0 {
            state.tokens = state.tokens.saturating_add(tokens_to_add).min(self.max_tokens);
            // Advance by whole intervals, not to `now`: the remainder keeps
            // accruing toward the next token.
            state.last_refill_millis += tokens_to_add * interval_millis;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-key token buckets sharing one configuration, created lazily.
#[derive(Clone)]
pub struct TokenBucketRegistry {
    max_tokens: u64,
    refill_interval: Duration,
    inner: Arc<Mutex<HashMap<String, Arc<TokenBucket>>>>,
}

impl std::fmt::Debug for TokenBucketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketRegistry")
            .field("max_tokens", &self.max_tokens)
            .field("refill_interval", &self.refill_interval)
            .finish()
    }
}

impl TokenBucketRegistry {
    /// Create a registry whose buckets all hold `max_tokens` and refill one
    /// token per `refill_interval`.
    pub fn new(max_tokens: u64, refill_interval: Duration) -> Result<Self, RateLimitError> {
        // Validate once up front so lazy creation cannot fail later.
        TokenBucket::new(max_tokens, refill_interval)?;
        Ok(Self {
            max_tokens,
            refill_interval,
            inner: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The bucket for `key`, created on first use.
    pub fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(
                    TokenBucket::new(self.max_tokens, self.refill_interval)
                        .expect("configuration validated at registry construction"),
                )
            })
            .clone()
    }

    /// Non-blocking acquisition against `key`'s bucket.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.bucket(key).try_acquire()
    }

    /// Snapshot of all known keys and their available tokens.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<(String, u64)> =
            map.iter().map(|(k, v)| (k.clone(), v.available())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
