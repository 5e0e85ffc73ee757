//! Deserializable configuration covering every tunable in the crate.
//!
//! Durations are plain millisecond integers so the struct drops cleanly out
//! of JSON/YAML/env-style config layers. Each section converts into the
//! corresponding policy type, running that type's own validation.

use crate::pool::PoolConfig;
use crate::rate_limit::RateLimitError;
use crate::timeout::TimeoutError;
use crate::{
    Backoff, BackoffError, BuildError, CircuitBreakerPolicy, Jitter, RetryPolicy, TimeoutPolicy,
    TokenBucket, TokenBucketRegistry,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the resilience core. Every field has the documented
/// default, so partial config objects deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Worker pool: executor count.
    pub worker_count: usize,
    /// Worker pool: bounded queue capacity.
    pub queue_size: usize,
    /// Worker pool: per-job execution deadline.
    pub handler_execution_deadline_ms: u64,

    /// Circuit breaker: consecutive failures that trip it.
    pub breaker_max_failures: usize,
    /// Circuit breaker: how long it stays open before probing.
    pub breaker_reset_timeout_ms: u64,

    /// Retry: attempt ceiling.
    pub retry_max_attempts: usize,
    /// Retry: first backoff delay.
    pub retry_initial_delay_ms: u64,
    /// Retry: backoff cap.
    pub retry_max_delay_ms: u64,
    /// Retry: backoff multiplier.
    pub retry_multiplier: f64,

    /// Token bucket: burst ceiling.
    pub bucket_max_tokens: u64,
    /// Token bucket: one token per this interval.
    pub bucket_refill_interval_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            queue_size: 100,
            handler_execution_deadline_ms: 5 * 60 * 1000,
            breaker_max_failures: 5,
            breaker_reset_timeout_ms: 30_000,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            retry_multiplier: 2.0,
            bucket_max_tokens: 100,
            bucket_refill_interval_ms: 100,
        }
    }
}

/// A configuration value that failed a policy's validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid retry configuration: {0}")]
    Retry(#[from] BuildError),
    #[error("invalid backoff configuration: {0}")]
    Backoff(#[from] BackoffError),
    #[error("invalid rate limit configuration: {0}")]
    RateLimit(#[from] RateLimitError),
    #[error("invalid timeout configuration: {0}")]
    Timeout(#[from] TimeoutError),
}

impl ResilienceConfig {
    /// Worker pool configuration (validated by `WorkerPool::new`).
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            worker_count: self.worker_count,
            queue_size: self.queue_size,
            handler_deadline: Duration::from_millis(self.handler_execution_deadline_ms),
        }
    }

    /// A circuit breaker with the configured threshold and reset timeout.
    pub fn circuit_breaker(&self) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy::new(
            self.breaker_max_failures,
            Duration::from_millis(self.breaker_reset_timeout_ms),
        )
    }

    /// A retry policy with exponential backoff and equal jitter.
    pub fn retry_policy<E>(&self) -> Result<RetryPolicy<E>, ConfigError>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let backoff = Backoff::exponential_with_multiplier(
            Duration::from_millis(self.retry_initial_delay_ms),
            self.retry_multiplier,
            Duration::from_millis(self.retry_max_delay_ms),
        )?;
        Ok(RetryPolicy::builder()
            .max_attempts(self.retry_max_attempts)?
            .backoff(backoff)
            .with_jitter(Jitter::equal())
            .build())
    }

    /// The global admission bucket.
    pub fn token_bucket(&self) -> Result<TokenBucket, ConfigError> {
        Ok(TokenBucket::new(
            self.bucket_max_tokens,
            Duration::from_millis(self.bucket_refill_interval_ms),
        )?)
    }

    /// Per-key admission buckets sharing the bucket configuration.
    pub fn token_bucket_registry(&self) -> Result<TokenBucketRegistry, ConfigError> {
        Ok(TokenBucketRegistry::new(
            self.bucket_max_tokens,
            Duration::from_millis(self.bucket_refill_interval_ms),
        )?)
    }

    /// A timeout policy matching the handler execution deadline.
    pub fn handler_timeout(&self) -> Result<TimeoutPolicy, ConfigError> {
        Ok(TimeoutPolicy::new(Duration::from_millis(self.handler_execution_deadline_ms))?)
    }
}
