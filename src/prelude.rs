//! Convenient re-exports for common Backstop types.
pub use crate::{
    backoff::{Backoff, BackoffError},
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState},
    clock::{Clock, ManualClock, MonotonicClock},
    config::{ConfigError, ResilienceConfig},
    jitter::Jitter,
    middleware::{CircuitBreakerLayer, KeyedRateLimitLayer, RateLimitLayer},
    pool::{
        BoxError, Job, JobError, JobHandle, JobHandler, JobStatus, PoolConfig, SubmitError,
        WorkerPool,
    },
    rate_limit::{AcquireError, RateLimitError, TokenBucket, TokenBucketRegistry},
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    stack::{ResilienceStack, ResilienceStackBuilder},
    timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT},
    ResilienceError,
};
