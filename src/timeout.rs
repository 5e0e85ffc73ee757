//! Timeout policy for bounding async operation duration.
//!
//! Semantics
//! - Wraps an async operation and returns `ResilienceError::Timeout` when the deadline elapses.
//! - The operation runs as its own task and receives a `CancellationToken`. On timeout the
//!   token is cancelled and the task is left running detached; it is never aborted. The
//!   caller has no claim to the operation's eventual side effects after a timeout.
//! - Completion is delivered through the task's join cell, which never blocks the operation
//!   side; a late finish cannot leak or wedge anything.
//! - Elapsed is measured from just before spawning and can be slightly greater than the
//!   configured duration due to scheduling/timeout detection overhead.
//! - Requires a Tokio runtime.
//!
//! Invariants:
//! - Duration must be > 0 and ≤ configured maximum.
//! - Successful operations pass through untouched.
//! - Timeouts return `ResilienceError::Timeout` with elapsed ≥ configured timeout.

use crate::ResilienceError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Maximum allowed timeout duration (30 days) to avoid runaway timers while permitting long jobs.
/// Intended to guard accidental timeouts of `u64::MAX`; override via [`TimeoutPolicy::new_with_max`]
/// when longer horizons are required.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors returned when configuring timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    /// Duration must be greater than zero.
    ZeroDuration,
    /// Duration exceeded configured maximum.
    ExceedsMaximum {
        /// Duration requested by caller.
        requested: Duration,
        /// Maximum allowed duration for this construction.
        limit: Duration,
    },
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutError::ZeroDuration => write!(f, "timeout duration must be > 0"),
            TimeoutError::ExceedsMaximum { requested, limit } => write!(
                f,
                "timeout duration {:?} exceeds maximum allowed {:?}; use new_with_max to override",
                requested, limit
            ),
        }
    }
}

impl std::error::Error for TimeoutError {}

/// Policy that enforces a maximum duration on async operations.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Creates a timeout policy with the specified duration.
    ///
    /// # Errors
    ///
    /// Returns [`TimeoutError::ZeroDuration`] if `duration` is zero.
    /// Returns [`TimeoutError::ExceedsMaximum`] if `duration` exceeds [`MAX_TIMEOUT`].
    #[must_use = "the result must be checked for validation errors"]
    pub fn new(duration: Duration) -> Result<Self, TimeoutError> {
        Self::new_with_max(duration, MAX_TIMEOUT)
    }

    /// Construct with a caller-specified maximum allowed timeout.
    pub fn new_with_max(duration: Duration, max: Duration) -> Result<Self, TimeoutError> {
        if duration.is_zero() {
            return Err(TimeoutError::ZeroDuration);
        }
        if duration > max {
            return Err(TimeoutError::ExceedsMaximum { requested: duration, limit: max });
        }
        Ok(Self { duration })
    }

    /// Returns the configured timeout duration.
    #[must_use]
    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Execute an operation under this policy's deadline.
    ///
    /// The operation is spawned as its own task and handed a
    /// [`CancellationToken`]:
    ///
    /// - Returns `Ok(T)` when the operation finishes before the deadline.
    /// - Returns `Err(ResilienceError::Timeout { elapsed, timeout })` when the
    ///   deadline elapses first. The token is cancelled so a cooperative
    ///   operation can wind down, but the task is never aborted; an
    ///   operation that ignores the token runs to completion in the
    ///   background and its result is discarded.
    /// - A panic inside the operation resumes unwinding on the caller.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        Op: FnOnce(CancellationToken) -> Fut,
    {
        let start = Instant::now();
        let cancel = CancellationToken::new();
        let mut task = tokio::spawn(operation(cancel.clone()));

        match tokio::time::timeout(self.duration, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                // The task is never aborted, so a join error is always a panic.
                std::panic::resume_unwind(join_error.into_panic())
            }
            Err(_) => {
                cancel.cancel();
                let elapsed = start.elapsed();
                Err(ResilienceError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn test_completes_before_timeout() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(100)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = timeout
            .execute(|_cancel| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_times_out_long_operation() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(50)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = timeout
            .execute(|_cancel| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;

        assert!(result.is_err());
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(counter.load(Ordering::SeqCst), 1, "Should have started execution");
    }

    #[tokio::test]
    async fn test_timed_out_operation_keeps_running() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(50)).unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        let start = std::time::Instant::now();
        let result = timeout
            .execute(|_cancel| {
                let flag = flag_clone.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(())
                }
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert!(start.elapsed() < Duration::from_millis(150), "Caller got control back early");
        assert!(!flag.load(Ordering::SeqCst), "Operation has not finished yet");

        // The wrapper must not have killed the operation.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(flag.load(Ordering::SeqCst), "Operation ran to completion in the background");
    }

    #[tokio::test]
    async fn test_cooperative_operation_observes_cancellation() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(50)).unwrap();
        let observed = Arc::new(AtomicBool::new(false));
        let observed_clone = observed.clone();

        let result = timeout
            .execute(|cancel| {
                let observed = observed_clone.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            observed.store(true, Ordering::SeqCst);
                        }
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                    }
                    Ok::<_, ResilienceError<TestError>>(())
                }
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(observed.load(Ordering::SeqCst), "Operation saw the cancellation signal");
    }

    #[tokio::test]
    async fn test_propagates_operation_errors() {
        let timeout = TimeoutPolicy::new(Duration::from_secs(1)).unwrap();

        let result = timeout
            .execute(|_cancel| async {
                Err::<(), _>(ResilienceError::Inner(TestError("operation failed".to_string())))
            })
            .await;

        assert!(result.is_err());
        match result.unwrap_err() {
            ResilienceError::Inner(e) => assert_eq!(e.0, "operation failed"),
            e => panic!("Expected Inner error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_operation_panic_resumes_on_caller() {
        let timeout = TimeoutPolicy::new(Duration::from_secs(1)).unwrap();

        let caught = AssertUnwindSafe(timeout.execute(|_cancel| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, ResilienceError<TestError>>(())
        }))
        .catch_unwind()
        .await;

        assert!(caught.is_err(), "Panic should propagate to the caller");
    }

    #[tokio::test]
    async fn test_very_long_timeout_doesnt_interfere() {
        let timeout = TimeoutPolicy::new(Duration::from_secs(3600)).unwrap(); // 1 hour

        let result = timeout
            .execute(|_cancel| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, ResilienceError<TestError>>(99)
            })
            .await;

        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn test_timeout_error_includes_durations() {
        let timeout_duration = Duration::from_millis(50);
        let timeout = TimeoutPolicy::new(timeout_duration).unwrap();

        let result = timeout
            .execute(|_cancel| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), ResilienceError<TestError>>(())
            })
            .await;

        assert!(result.is_err());
        match result.unwrap_err() {
            ResilienceError::Timeout { elapsed, timeout } => {
                assert_eq!(timeout, timeout_duration);
                assert!(elapsed >= timeout_duration, "Elapsed time should be at least the timeout");
            }
            e => panic!("Expected Timeout error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_instant_operation() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(100)).unwrap();

        let result = timeout
            .execute(|_cancel| async { Ok::<_, ResilienceError<TestError>>(42) })
            .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn rejects_zero_duration() {
        let err = TimeoutPolicy::new(Duration::ZERO).unwrap_err();
        assert!(matches!(err, TimeoutError::ZeroDuration));
    }

    #[test]
    fn rejects_excessive_duration() {
        let too_big = MAX_TIMEOUT + Duration::from_secs(1);
        let err = TimeoutPolicy::new(too_big).unwrap_err();
        assert!(
            matches!(err, TimeoutError::ExceedsMaximum { requested, limit } if requested == too_big && limit == MAX_TIMEOUT)
        );
    }

    #[test]
    fn accepts_max_timeout() {
        let policy = TimeoutPolicy::new(MAX_TIMEOUT).expect("should accept max boundary");
        assert_eq!(policy.duration(), MAX_TIMEOUT);
    }

    #[test]
    fn new_with_max_respects_custom_boundaries() {
        let custom_max = Duration::from_secs(5);
        let ok = TimeoutPolicy::new_with_max(Duration::from_secs(5), custom_max).unwrap();
        assert_eq!(ok.duration(), custom_max);

        let err = TimeoutPolicy::new_with_max(Duration::from_secs(6), custom_max).unwrap_err();
        assert!(
            matches!(err, TimeoutError::ExceedsMaximum { requested, limit } if requested == Duration::from_secs(6) && limit == custom_max)
        );
    }
}
