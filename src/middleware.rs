//! Tower middleware over the admission primitives.
//!
//! These layers are the surface a serving stack mounts in front of its
//! handlers: [`RateLimitLayer`] polls a shared [`TokenBucket`] per request,
//! [`KeyedRateLimitLayer`] keeps one bucket per caller key (created lazily),
//! and [`CircuitBreakerLayer`] feeds every wrapped call's outcome back into a
//! [`CircuitBreakerPolicy`]. Denials surface as `ResilienceError` values in
//! the service's error channel; mapping them onto wire responses (429/503,
//! `Retry-After`) is the server's concern.

use crate::{CircuitBreakerPolicy, ResilienceError, TokenBucket, TokenBucketRegistry};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Layer enforcing a single shared token bucket.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    bucket: Arc<TokenBucket>,
}

impl RateLimitLayer {
    pub fn new(bucket: TokenBucket) -> Self {
        Self { bucket: Arc::new(bucket) }
    }

    /// Share a bucket that other parts of the system also draw from.
    pub fn shared(bucket: Arc<TokenBucket>) -> Self {
        Self { bucket }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, bucket: self.bucket.clone() }
    }
}

/// Middleware service that enforces the shared bucket.
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    bucket: Arc<TokenBucket>,
}

impl<S, Req> Service<Req> for RateLimitService<S>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Admission is a synchronous poll; deny before touching the inner
        // service so a rejected request does no work at all.
        if !self.bucket.try_acquire() {
            let retry_after = self.bucket.refill_interval();
            return Box::pin(async move { Err(ResilienceError::RateLimited { retry_after }) });
        }

        let fut = self.inner.call(req);
        Box::pin(async move { fut.await.map_err(ResilienceError::Inner) })
    }
}

/// Layer enforcing one bucket per caller key, created lazily.
pub struct KeyedRateLimitLayer<F> {
    registry: TokenBucketRegistry,
    key_fn: Arc<F>,
}

impl<F> KeyedRateLimitLayer<F> {
    pub fn new(registry: TokenBucketRegistry, key_fn: F) -> Self {
        Self { registry, key_fn: Arc::new(key_fn) }
    }
}

impl<F> Clone for KeyedRateLimitLayer<F> {
    fn clone(&self) -> Self {
        Self { registry: self.registry.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<S, F> Layer<S> for KeyedRateLimitLayer<F> {
    type Service = KeyedRateLimitService<S, F>;

    fn layer(&self, service: S) -> Self::Service {
        KeyedRateLimitService {
            inner: service,
            registry: self.registry.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service enforcing per-key buckets.
pub struct KeyedRateLimitService<S, F> {
    inner: S,
    registry: TokenBucketRegistry,
    key_fn: Arc<F>,
}

impl<S: Clone, F> Clone for KeyedRateLimitService<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            registry: self.registry.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<S, F, Req> Service<Req> for KeyedRateLimitService<S, F>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    F: Fn(&Req) -> String,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        let bucket = self.registry.bucket(&key);
        if !bucket.try_acquire() {
            let retry_after = bucket.refill_interval();
            return Box::pin(async move { Err(ResilienceError::RateLimited { retry_after }) });
        }

        let fut = self.inner.call(req);
        Box::pin(async move { fut.await.map_err(ResilienceError::Inner) })
    }
}

/// Layer feeding every call's outcome through a circuit breaker.
#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    breaker: CircuitBreakerPolicy,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreakerPolicy) -> Self {
        Self { breaker }
    }

    /// The breaker backing this layer, for observation and operator resets.
    pub fn breaker(&self) -> &CircuitBreakerPolicy {
        &self.breaker
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CircuitBreakerService { inner: service, breaker: self.breaker.clone() }
    }
}

/// Middleware service gated by a circuit breaker.
#[derive(Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: CircuitBreakerPolicy,
}

impl<S, Req> Service<Req> for CircuitBreakerService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let breaker = self.breaker.clone();
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            breaker
                .execute(move || {
                    let fut = inner.call(req);
                    async move { fut.await.map_err(ResilienceError::Inner) }
                })
                .await
        })
    }
}
