//! Telemetry for the coordination primitives.
//!
//! The limiter and the lock describe what they decided as [`CoordinationEvent`]s.
//! Events flow into a [`TelemetrySink`], which is a `tower::Service<CoordinationEvent>`,
//! so sinks compose with ordinary tower combinators.
//!
//! # Event Types
//!
//! - **Rate limiting**: `Admitted`, `Denied`, `FailedClosed`
//! - **Locking**: `Acquired`, `Contended`, `Renewed`, `Released`, `OwnershipLost`, `StoreFailure`
//!
//! ```rust
//! use gatekeep::telemetry::{CoordinationEvent, LockEvent};
//!
//! let event = CoordinationEvent::Lock(LockEvent::Contended { key: "lock:invoice:42".into() });
//! assert_eq!(event.to_string(), "Lock::Contended(lock:invoice:42)");
//! ```

use crate::rate_limit::Algorithm;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A telemetry sink that consumes coordination events.
///
/// # Implementing a Custom Sink
///
/// ```rust
/// use gatekeep::telemetry::{TelemetrySink, CoordinationEvent};
/// use tower::Service;
/// use std::task::{Context, Poll};
/// use std::pin::Pin;
/// use std::future::Future;
///
/// #[derive(Clone)]
/// struct PrintSink;
///
/// impl Service<CoordinationEvent> for PrintSink {
///     type Response = ();
///     type Error = std::convert::Infallible;
///     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
///
///     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
///         Poll::Ready(Ok(()))
///     }
///
///     fn call(&mut self, event: CoordinationEvent) -> Self::Future {
///         println!("{}", event);
///         Box::pin(async { Ok(()) })
///     }
/// }
///
/// impl TelemetrySink for PrintSink {
///     type SinkError = std::convert::Infallible;
/// }
/// ```
pub trait TelemetrySink:
    tower::Service<CoordinationEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// A sink that is not ready or fails never changes an admission or lock outcome.
pub async fn emit_best_effort<S>(sink: S, event: CoordinationEvent)
where
    S: tower::Service<CoordinationEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted by the coordination primitives.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinationEvent {
    /// Rate limiter events
    RateLimit(RateLimitEvent),
    /// Distributed lock events
    Lock(LockEvent),
}

/// Events emitted by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// The request fit the budget.
    Admitted {
        /// Store key of the limiter state
        key: String,
        algorithm: Algorithm,
    },
    /// The budget was exhausted.
    Denied {
        /// Store key of the limiter state
        key: String,
        algorithm: Algorithm,
    },
    /// The store failed and the request was denied without a decision.
    FailedClosed {
        /// Store key of the limiter state
        key: String,
        algorithm: Algorithm,
    },
}

/// Events emitted by the distributed lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// A new owner token was stored.
    Acquired { key: String },
    /// Someone else holds the lock.
    Contended { key: String },
    /// The owner extended the TTL.
    Renewed { key: String },
    /// The owner deleted the lock.
    Released { key: String },
    /// Renew or unlock found a different (or no) owner: the lock expired under us.
    OwnershipLost { key: String },
    /// The store failed; ownership is unknown.
    StoreFailure { key: String },
}

impl fmt::Display for CoordinationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            CoordinationEvent::Lock(event) => write!(f, "Lock::{}", event),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Admitted { key, algorithm } => {
                write!(f, "Admitted({}, {})", algorithm, key)
            }
            RateLimitEvent::Denied { key, algorithm } => write!(f, "Denied({}, {})", algorithm, key),
            RateLimitEvent::FailedClosed { key, algorithm } => {
                write!(f, "FailedClosed({}, {})", algorithm, key)
            }
        }
    }
}

impl fmt::Display for LockEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockEvent::Acquired { key } => write!(f, "Acquired({})", key),
            LockEvent::Contended { key } => write!(f, "Contended({})", key),
            LockEvent::Renewed { key } => write!(f, "Renewed({})", key),
            LockEvent::Released { key } => write!(f, "Released({})", key),
            LockEvent::OwnershipLost { key } => write!(f, "OwnershipLost({})", key),
            LockEvent::StoreFailure { key } => write!(f, "StoreFailure({})", key),
        }
    }
}

#[cfg(feature = "telemetry-json")]
impl CoordinationEvent {
    /// Flat JSON rendering, for shipping events to log pipelines.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            CoordinationEvent::RateLimit(r) => {
                let (kind, key, algorithm) = match r {
                    RateLimitEvent::Admitted { key, algorithm } => ("rate_limit_admitted", key, algorithm),
                    RateLimitEvent::Denied { key, algorithm } => ("rate_limit_denied", key, algorithm),
                    RateLimitEvent::FailedClosed { key, algorithm } => {
                        ("rate_limit_failed_closed", key, algorithm)
                    }
                };
                json!({ "kind": kind, "key": key, "algorithm": algorithm.name() })
            }
            CoordinationEvent::Lock(l) => {
                let (kind, key) = match l {
                    LockEvent::Acquired { key } => ("lock_acquired", key),
                    LockEvent::Contended { key } => ("lock_contended", key),
                    LockEvent::Renewed { key } => ("lock_renewed", key),
                    LockEvent::Released { key } => ("lock_released", key),
                    LockEvent::OwnershipLost { key } => ("lock_ownership_lost", key),
                    LockEvent::StoreFailure { key } => ("lock_store_failure", key),
                };
                json!({ "kind": kind, "key": key })
            }
        }
    }
}

// ============================================================================
// Built-in Telemetry Sinks
// ============================================================================

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<CoordinationEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: CoordinationEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate at INFO level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<CoordinationEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoordinationEvent) -> Self::Future {
        tracing::info!(event = %event, "coordination_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Useful for testing. Bounded; the oldest events are evicted first.
///
/// ```rust
/// use gatekeep::telemetry::{MemorySink, CoordinationEvent, LockEvent};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::new();
/// let event = CoordinationEvent::Lock(LockEvent::Released { key: "lock:a".into() });
/// sink.call(event.clone()).await.unwrap();
/// assert_eq!(sink.events(), vec![event]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<CoordinationEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<CoordinationEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<CoordinationEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoordinationEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
