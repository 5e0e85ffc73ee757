use backstop::{
    Backoff, CircuitBreakerPolicy, CircuitState, Jitter, ResilienceError, ResilienceStack,
    RetryPolicy, TimeoutPolicy, TokenBucket,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError(&'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

#[tokio::test]
async fn breaker_opens_on_burst_failure_and_recovers() {
    // Threshold 3, reset timeout 1s: three failures execute, the fourth call
    // is rejected without running, and after the timeout one success closes
    // the breaker again.
    let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(1));
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let result = breaker
            .execute(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResilienceError::Inner(TestError("dependency down")))
            })
            .await;
        assert!(result.unwrap_err().is_inner());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let calls_fourth = calls.clone();
    let result = breaker
        .execute(|| async move {
            calls_fourth.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ResilienceError::Inner(TestError("dependency down")))
        })
        .await;
    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3, "fourth call must not reach the op");

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let result = breaker
        .execute(|| async { Ok::<_, ResilienceError<TestError>>("recovered") })
        .await;
    assert_eq!(result.unwrap(), "recovered");
    assert_eq!(breaker.current_state(), CircuitState::Closed);
}

#[tokio::test]
async fn retry_on_flaky_op_pays_the_backoff_schedule() {
    // attempts=3, D0=10ms, beta=2, Dmax=1s; failing twice costs 10ms + 20ms.
    let retry: RetryPolicy<TestError> = RetryPolicy::builder()
        .max_attempts(3)
        .expect("max_attempts > 0")
        .backoff(Backoff::exponential(Duration::from_millis(10), Duration::from_secs(1)).unwrap())
        .with_jitter(Jitter::None)
        .build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let start = std::time::Instant::now();
    let result = retry
        .execute(move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ResilienceError::Inner(TestError("flaky")))
                } else {
                    Ok("made it")
                }
            }
        })
        .await;
    let elapsed = start.elapsed();

    assert_eq!(result.unwrap(), "made it");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(elapsed >= Duration::from_millis(30), "two backoff sleeps: 10ms + 20ms");
    assert!(elapsed < Duration::from_millis(500), "overhead should be small");
}

#[tokio::test]
async fn timeout_returns_promptly_and_lets_the_op_finish() {
    let timeout = TimeoutPolicy::new(Duration::from_millis(50)).unwrap();
    let flag = Arc::new(AtomicBool::new(false));
    let flag_clone = flag.clone();

    let start = std::time::Instant::now();
    let result = timeout
        .execute(move |_cancel| {
            let flag = flag_clone.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(())
            }
        })
        .await;

    assert!(result.unwrap_err().is_timeout());
    assert!(start.elapsed() < Duration::from_millis(150), "timeout must bound the wait");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(flag.load(Ordering::SeqCst), "the operation was not killed by the wrapper");
}

#[tokio::test]
async fn stacked_retry_stops_at_the_open_breaker() {
    // The breaker opens inside the retry loop; the retry engine does not
    // retry circuit-open errors, so the stack surfaces them immediately.
    let retry: RetryPolicy<TestError> = RetryPolicy::builder()
        .max_attempts(10)
        .expect("max_attempts > 0")
        .backoff(Backoff::constant(Duration::from_millis(1)))
        .with_jitter(Jitter::None)
        .build();
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .retry(retry)
        .circuit_breaker(CircuitBreakerPolicy::new(2, Duration::from_secs(60)))
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    let result = stack
        .execute(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResilienceError::Inner(TestError("still down")))
            }
        })
        .await;

    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(
        calls.load(Ordering::SeqCst),
        2,
        "two attempts trip the breaker; the third is rejected without running"
    );
}

#[tokio::test]
async fn stacked_timeout_bounds_rate_limited_retries() {
    // One token, hour-long refill: the first attempt consumes the token, the
    // retry's second attempt parks in admission, and the timeout cuts it off.
    let retry: RetryPolicy<TestError> = RetryPolicy::builder()
        .max_attempts(5)
        .expect("max_attempts > 0")
        .backoff(Backoff::constant(Duration::from_millis(1)))
        .with_jitter(Jitter::None)
        .build();
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .timeout(TimeoutPolicy::new(Duration::from_millis(100)).unwrap())
        .retry(retry)
        .rate_limiter(TokenBucket::new(1, Duration::from_secs(3600)).unwrap())
        .build();

    let start = std::time::Instant::now();
    let result = stack
        .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("flaky"))) })
        .await;

    assert!(result.unwrap_err().is_timeout());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn stack_composes_all_four_layers_on_the_happy_path() {
    let retry: RetryPolicy<TestError> = RetryPolicy::builder()
        .max_attempts(3)
        .expect("max_attempts > 0")
        .backoff(Backoff::exponential(Duration::from_millis(5), Duration::from_millis(100)).unwrap())
        .with_jitter(Jitter::equal())
        .build();
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .timeout(TimeoutPolicy::new(Duration::from_secs(5)).unwrap())
        .retry(retry)
        .circuit_breaker(CircuitBreakerPolicy::new(5, Duration::from_secs(30)))
        .rate_limiter(TokenBucket::new(4, Duration::from_millis(50)).unwrap())
        .build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let result = stack
        .execute(move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(ResilienceError::Inner(TestError("cold start")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
