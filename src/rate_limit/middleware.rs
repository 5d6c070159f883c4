use crate::adaptive::DynamicConfig;
use crate::error::InvalidArgument;
use crate::rate_limit::{LimitSpec, RateLimiter};
use crate::store::KvScriptClient;
use crate::telemetry::{NullSink, TelemetrySink};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Error returned by [`RateLimitService`].
#[derive(thiserror::Error, Debug)]
pub enum GuardError<E> {
    /// The request key is over its budget (or the store could not be asked).
    #[error("rate limited: {key}")]
    RateLimited {
        /// Caller key extracted from the request.
        key: String,
    },
    /// The configured [`LimitSpec`] is unusable.
    #[error(transparent)]
    InvalidLimit(InvalidArgument),
    /// The wrapped service failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> GuardError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// A layer that admits each request through a [`RateLimiter`], keyed per request.
///
/// The [`LimitSpec`] sits behind a [`DynamicConfig`] so limits can be changed at
/// runtime through [`RateLimitLayer::spec_handle`] without rebuilding the stack.
pub struct RateLimitLayer<C, K, S = NullSink> {
    limiter: Arc<RateLimiter<C, S>>,
    spec: DynamicConfig<LimitSpec>,
    key_fn: Arc<K>,
}

impl<C, K, S> RateLimitLayer<C, K, S> {
    /// Create a new rate limit layer.
    ///
    /// `key_fn` maps a request to the caller key, e.g. `"api:login:<client ip>"`.
    pub fn new(limiter: RateLimiter<C, S>, spec: LimitSpec, key_fn: K) -> Self {
        Self::with_dynamic_spec(limiter, DynamicConfig::new(spec), key_fn)
    }

    /// Create a layer reading its limit from an existing live handle.
    pub fn with_dynamic_spec(
        limiter: RateLimiter<C, S>,
        spec: DynamicConfig<LimitSpec>,
        key_fn: K,
    ) -> Self {
        Self { limiter: Arc::new(limiter), spec, key_fn: Arc::new(key_fn) }
    }

    /// Live handle to the limit; updates apply to the next request.
    pub fn spec_handle(&self) -> DynamicConfig<LimitSpec> {
        self.spec.clone()
    }
}

impl<C, K, S> Clone for RateLimitLayer<C, K, S> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), spec: self.spec.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<C, K, S> fmt::Debug for RateLimitLayer<C, K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("spec", &self.spec).finish_non_exhaustive()
    }
}

impl<Svc, C, K, S> Layer<Svc> for RateLimitLayer<C, K, S> {
    type Service = RateLimitService<Svc, C, K, S>;

    fn layer(&self, service: Svc) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            spec: self.spec.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<Svc, C, K, S = NullSink> {
    inner: Svc,
    limiter: Arc<RateLimiter<C, S>>,
    spec: DynamicConfig<LimitSpec>,
    key_fn: Arc<K>,
}

impl<Svc: Clone, C, K, S> Clone for RateLimitService<Svc, C, K, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            spec: self.spec.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<Svc: fmt::Debug, C, K, S> fmt::Debug for RateLimitService<Svc, C, K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl<Svc, C, K, S, Req> Service<Req> for RateLimitService<Svc, C, K, S>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Error: Send + Sync + std::error::Error + 'static,
    C: KvScriptClient + 'static,
    K: Fn(&Req) -> String + Send + Sync + 'static,
    S: TelemetrySink + Sync,
    S::Future: Send,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = GuardError<Svc::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let spec = self.spec.get();
        let key = (self.key_fn)(&req);
        // Drive the clone that was polled ready; leave a fresh clone in `self`.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.check(&key, &spec).await {
                Ok(true) => inner.call(req).await.map_err(GuardError::Inner),
                Ok(false) => Err(GuardError::RateLimited { key }),
                Err(e) => Err(GuardError::InvalidLimit(e)),
            }
        })
    }
}
