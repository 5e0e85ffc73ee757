//! Resilience stack builder for composing policies
//!
//! Composition order is Timeout → Retry → CircuitBreaker → TokenBucket →
//! operation: the timeout bounds the whole retry loop, and its cancellation
//! token propagates down through the retry sleeps into the admission wait.
//! Every layer is optional; an empty stack just runs the operation.

use crate::rate_limit::AcquireError;
use crate::{
    CircuitBreakerPolicy, ResilienceError, RetryPolicy, TimeoutPolicy, TokenBucket,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ResilienceStack<E> {
    timeout: Option<TimeoutPolicy>,
    retry: Option<RetryPolicy<E>>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
    rate_limiter: Option<Arc<TokenBucket>>,
}

// Manual impl to avoid an E: Clone bound from a derive.
impl<E> Clone for ResilienceStack<E> {
    fn clone(&self) -> Self {
        Self {
            timeout: self.timeout,
            retry: self.retry.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

impl<E> ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> ResilienceStackBuilder<E> {
        ResilienceStackBuilder::new()
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        Op: FnMut() -> Fut + Send + 'static,
    {
        // Each layer wraps the next, building from inside out. The operation
        // sits in a cell so every retry attempt can call it again.
        let op_cell = Arc::new(Mutex::new(operation));
        let retry = self.retry.clone();
        let breaker = self.circuit_breaker.clone();
        let limiter = self.rate_limiter.clone();

        let run_inner = move |cancel: CancellationToken| {
            let op_cell = op_cell.clone();
            let breaker = breaker.clone();
            let limiter = limiter.clone();
            let retry = retry.clone();
            async move {
                let attempt_cancel = cancel.clone();
                let attempt = move || {
                    let op_cell = op_cell.clone();
                    let breaker = breaker.clone();
                    let limiter = limiter.clone();
                    let cancel = attempt_cancel.clone();
                    async move {
                        // Admission-then-op is one unit gated by the breaker:
                        // an Open breaker rejects before a token is spent, and
                        // an admission denial feeds its failure accounting.
                        match &breaker {
                            Some(breaker) => {
                                breaker
                                    .execute(move || async move {
                                        admit(&limiter, &cancel).await?;
                                        let fut = {
                                            let mut op = op_cell.lock().unwrap();
                                            op()
                                        };
                                        fut.await
                                    })
                                    .await
                            }
                            None => {
                                admit(&limiter, &cancel).await?;
                                let fut = {
                                    let mut op = op_cell.lock().unwrap();
                                    op()
                                };
                                fut.await
                            }
                        }
                    }
                };

                match &retry {
                    Some(retry) => retry.execute_with_cancel(&cancel, attempt).await,
                    None => attempt().await,
                }
            }
        };

        match &self.timeout {
            Some(timeout) => timeout.execute(run_inner).await,
            None => run_inner(CancellationToken::new()).await,
        }
    }
}

// Token-bucket admission for one attempt, innermost in the stack order.
async fn admit<E>(
    limiter: &Option<Arc<TokenBucket>>,
    cancel: &CancellationToken,
) -> Result<(), ResilienceError<E>> {
    if let Some(limiter) = limiter {
        limiter
            .acquire_with_cancel(Duration::MAX, cancel)
            .await
            .map_err(|e| match e {
                AcquireError::Cancelled => ResilienceError::Cancelled,
                AcquireError::DeadlineExceeded { .. } => ResilienceError::RateLimited {
                    retry_after: limiter.refill_interval(),
                },
            })?;
    }
    Ok(())
}

impl<E> Default for ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        ResilienceStackBuilder::new().build()
    }
}

pub struct ResilienceStackBuilder<E> {
    timeout: Option<TimeoutPolicy>,
    retry: Option<RetryPolicy<E>>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
    rate_limiter: Option<Arc<TokenBucket>>,
}

impl<E> ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { timeout: None, retry: None, circuit_breaker: None, rate_limiter: None }
    }

    /// Bound the whole stacked call, retries included.
    pub fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Gate every attempt on token-bucket admission. The stacked call waits
    /// for a token (cancel-aware) instead of failing fast; compose
    /// `try_acquire` at the edge when fail-fast is wanted.
    pub fn rate_limiter(mut self, bucket: TokenBucket) -> Self {
        self.rate_limiter = Some(Arc::new(bucket));
        self
    }

    /// Share an existing bucket between stacks.
    pub fn rate_limiter_shared(mut self, bucket: Arc<TokenBucket>) -> Self {
        self.rate_limiter = Some(bucket);
        self
    }

    pub fn build(self) -> ResilienceStack<E> {
        ResilienceStack {
            timeout: self.timeout,
            retry: self.retry,
            circuit_breaker: self.circuit_breaker,
            rate_limiter: self.rate_limiter,
        }
    }
}

impl<E> Default for ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
