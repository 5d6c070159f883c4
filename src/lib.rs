#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # gatekeep
//!
//! Rate limiting and distributed locking for services that share one
//! script-capable key-value store (Redis or compatible).
//!
//! ## Features
//!
//! - **Token bucket**, **sliding window** and **fixed window** admission, each
//!   decided by one atomic server-side script
//! - **Distributed lock** with owner tokens: renew and unlock never touch a lock
//!   that was taken over by someone else
//! - **Fail-closed** admission when the store is unreachable
//! - **Tower middleware** enforcing a live-updatable limit per request key
//! - **In-memory store** with an injectable clock for deterministic tests
//!
//! The crate keeps no state between calls. Any number of processes can share
//! a store; the store's atomic script execution is the only synchronization.
//! The Redis client lives in the companion `gatekeep-redis` crate.
//!
//! ## Quick Start
//!
//! ```rust
//! use gatekeep::{DistributedLock, InMemoryStore, RateLimiter};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryStore::new();
//!
//!     let limiter = RateLimiter::new(store.clone());
//!     if limiter.sliding_window_limit("api:search:user-17", Duration::from_secs(60), 100).await? {
//!         // serve the request
//!     }
//!
//!     let lock = DistributedLock::new(store);
//!     if let Some(handle) = lock.acquire("invoice:42", Duration::from_secs(30)).await? {
//!         // exclusive work
//!         lock.unlock(&handle).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod prelude;
pub mod rate_limit;
pub mod scripts;
pub mod store;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoordinationConfig;
pub use error::{CoordinationError, InvalidArgument, StoreError};
pub use lock::{DistributedLock, LockHandle};
pub use rate_limit::{
    Algorithm, GuardError, LimitSpec, RateLimitInfo, RateLimitLayer, RateLimitService, RateLimiter,
};
pub use store::{InMemoryStore, KeyTtl, KvScriptClient, Script, ScriptKind, ScriptValue};
pub use telemetry::{CoordinationEvent, LockEvent, RateLimitEvent, TelemetrySink};
