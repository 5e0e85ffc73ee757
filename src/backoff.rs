//! Backoff strategies for retry policies

use std::time::Duration;

/// Errors returned when configuring a backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffError {
    /// The multiplier must be ≥ 1 and finite.
    InvalidMultiplier(f64),
    /// The initial delay must not exceed the maximum delay.
    InitialExceedsMax { initial: Duration, max: Duration },
}

impl std::fmt::Display for BackoffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffError::InvalidMultiplier(m) => {
                write!(f, "backoff multiplier must be finite and >= 1 (got {})", m)
            }
            BackoffError::InitialExceedsMax { initial, max } => {
                write!(f, "initial delay {:?} exceeds maximum delay {:?}", initial, max)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Backoff strategy for retries
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries
    Constant { delay: Duration },
    /// Geometrically increasing delay, capped at `max`
    Exponential { initial: Duration, multiplier: f64, max: Duration },
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Create an exponential backoff strategy with the default doubling multiplier.
    pub fn exponential(initial: Duration, max: Duration) -> Result<Self, BackoffError> {
        Self::exponential_with_multiplier(initial, 2.0, max)
    }

    /// Create an exponential backoff strategy with an explicit multiplier.
    pub fn exponential_with_multiplier(
        initial: Duration,
        multiplier: f64,
        max: Duration,
    ) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        if initial > max {
            return Err(BackoffError::InitialExceedsMax { initial, max });
        }
        Ok(Backoff::Exponential { initial, multiplier, max })
    }

    /// Calculate the delay for a given attempt number (1-indexed)
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { initial, multiplier, max } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                let raw = initial.as_secs_f64() * multiplier.powi(exponent);
                if !raw.is_finite() {
                    return *max;
                }
                Duration::try_from_secs_f64(raw).unwrap_or(*max).min(*max)
            }
        }
    }

    /// The largest delay this strategy can produce.
    pub fn max_delay(&self) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { max, .. } => *max,
        }
    }
}
