#![forbid(unsafe_code)]

//! # Backstop
//!
//! Resilience and background-execution primitives for async Rust: a bounded
//! worker pool, a three-state circuit breaker, an exponential-backoff retry
//! engine, token-bucket rate limiting (global and per-key), and a
//! deadline-bounded timeout wrapper.
//!
//! ## Features
//!
//! - **Worker pool** with a bounded queue, per-type handlers, graceful
//!   drain, and a panic-containing executor boundary
//! - **Circuit breakers** with single-probe half-open recovery, built on
//!   lock-free atomics
//! - **Retry policies** with exponential backoff, jitter, and cancellable
//!   sleeps
//! - **Token buckets** with lazy drift-free refill and per-key registries
//! - **Timeout policies** that cancel cooperatively and never kill the
//!   wrapped operation
//! - **Policy composition** via [`ResilienceStack`]; tower layers for the
//!   admission middlewares
//!
//! Every primitive is an explicitly constructed value owned by the caller:
//! no global state, no singletons. Time and sleeping are injectable
//! ([`Clock`], [`Sleeper`]) so everything is testable without real delays.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use backstop::{
//!     Backoff, CircuitBreakerPolicy, Jitter, ResilienceError, ResilienceStack, RetryPolicy,
//!     TimeoutPolicy, TokenBucket,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .expect("valid retry policy")
//!         .backoff(
//!             Backoff::exponential(Duration::from_millis(10), Duration::from_secs(1))
//!                 .expect("valid backoff"),
//!         )
//!         .with_jitter(Jitter::equal())
//!         .build();
//!
//!     // Compose Timeout → Retry → CircuitBreaker → TokenBucket → op.
//!     let stack: ResilienceStack<std::io::Error> = ResilienceStack::builder()
//!         .timeout(TimeoutPolicy::new(Duration::from_secs(2)).expect("valid timeout"))
//!         .retry(retry)
//!         .circuit_breaker(CircuitBreakerPolicy::new(5, Duration::from_secs(30)))
//!         .rate_limiter(TokenBucket::new(32, Duration::from_millis(10)).expect("valid bucket"))
//!         .build();
//!
//!     let attempts_in_op = attempts.clone();
//!     stack
//!         .execute(move || {
//!             let attempts = attempts_in_op.clone();
//!             async move {
//!                 let n = attempts.fetch_add(1, Ordering::Relaxed);
//!                 if n < 2 {
//!                     Err(ResilienceError::Inner(std::io::Error::new(
//!                         std::io::ErrorKind::Other,
//!                         "transient failure",
//!                     )))
//!                 } else {
//!                     Ok(())
//!                 }
//!             }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Deferred work
//!
//! ```rust
//! use async_trait::async_trait;
//! use std::time::Duration;
//! use backstop::pool::{BoxError, Job, JobHandler, JobStatus, PoolConfig, WorkerPool};
//! use tokio_util::sync::CancellationToken;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler for SendEmail {
//!     async fn handle(&self, job: &Job, _cancel: CancellationToken) -> Result<(), BoxError> {
//!         let recipient: String = job.decode()?;
//!         tracing::info!(%recipient, "sending email");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut pool = WorkerPool::new(PoolConfig::default()).expect("valid pool config");
//!     pool.register_handler("send_email", SendEmail);
//!     pool.start().expect("fresh pool starts");
//!
//!     let job = Job::with_json("job-1", "send_email", &"user@example.com").unwrap();
//!     let mut handle = pool.submit(job).expect("queue has room");
//!     assert_eq!(handle.wait().await, JobStatus::Completed);
//!
//!     pool.stop().await;
//! }
//! ```

mod backoff;
mod circuit_breaker;
mod clock;
mod config;
mod error;
mod jitter;
pub mod middleware;
pub mod pool;
mod rate_limit;
mod retry;
mod sleeper;
mod stack;
mod timeout;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, ResilienceConfig};
pub use error::{ResilienceError, MAX_RETRY_FAILURES};
pub use jitter::Jitter;
pub use pool::{Job, JobHandle, JobHandler, JobStatus, PoolConfig, SubmitError, WorkerPool};
pub use rate_limit::{AcquireError, RateLimitError, TokenBucket, TokenBucketRegistry};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};

pub mod prelude;
