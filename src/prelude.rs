//! Convenient re-exports for common gatekeep types.
pub use crate::{
    adaptive::DynamicConfig,
    clock::{Clock, ManualClock, SystemClock},
    config::CoordinationConfig,
    error::{CoordinationError, InvalidArgument, StoreError},
    lock::{DistributedLock, LockHandle},
    rate_limit::{
        Algorithm, GuardError, LimitSpec, RateLimitInfo, RateLimitLayer, RateLimitService,
        RateLimiter,
    },
    store::{InMemoryStore, KvScriptClient},
    telemetry::{LogSink, MemorySink, NullSink, TelemetrySink},
};
