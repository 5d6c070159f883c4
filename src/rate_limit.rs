//! Store-backed rate limiting.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimiter`]: stateless facade running one atomic script per decision.
//! - [`LimitSpec`]: an algorithm together with its parameters.
//! - [`RateLimitInfo`]: read-only occupancy snapshot.
//! - [`RateLimitLayer`]: Tower middleware that enforces a limit per request key.
//!
//! # Algorithms
//!
//! - **Token bucket**: `capacity` permits refilled at `refill_per_second`. Allows
//!   bursts up to the capacity.
//! - **Sliding window**: exact count of admissions over the trailing window. No
//!   boundary bursts; costs one sorted-set member per admitted request.
//! - **Fixed window**: one counter per discrete window. Cheapest; a client can
//!   get up to `2 × limit` requests through across a window boundary.
//!
//! # Failure policy
//!
//! Admission is fail-closed: if the store cannot be reached the request is
//! denied and the failure is logged. Callers cannot bypass limiting by taking
//! the store down. The library imposes no timeout on the store round trip;
//! wrap calls in `tokio::time::timeout` and treat expiry as a denial.

use crate::error::InvalidArgument;
use std::fmt;
use std::time::Duration;

pub mod limiter;
pub mod middleware;
pub mod strategies;
pub use limiter::RateLimiter;
pub use middleware::{GuardError, RateLimitLayer, RateLimitService};

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An algorithm and the parameters it runs with.
///
/// Fields are public so a spec can be built from configuration; every limiter
/// operation re-validates it before touching the store.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "algorithm", rename_all = "snake_case"))]
pub enum LimitSpec {
    /// `capacity` permits, refilled at `refill_per_second`.
    ///
    /// A refill rate of `0` never refills: the bucket is a fixed budget of
    /// `capacity` permits that only [`RateLimiter::reset_rate_limit`] restores.
    TokenBucket { capacity: u32, refill_per_second: f64 },
    /// At most `limit` admissions in any trailing `window`.
    SlidingWindow { window: Duration, limit: u32 },
    /// At most `limit` admissions per aligned `window`.
    FixedWindow { window: Duration, limit: u32 },
}

impl LimitSpec {
    /// Validated token bucket spec.
    pub fn token_bucket(capacity: u32, refill_per_second: f64) -> Result<Self, InvalidArgument> {
        let spec = LimitSpec::TokenBucket { capacity, refill_per_second };
        spec.validate()?;
        Ok(spec)
    }

    /// Validated sliding window spec.
    pub fn sliding_window(window: Duration, limit: u32) -> Result<Self, InvalidArgument> {
        let spec = LimitSpec::SlidingWindow { window, limit };
        spec.validate()?;
        Ok(spec)
    }

    /// Validated fixed window spec.
    pub fn fixed_window(window: Duration, limit: u32) -> Result<Self, InvalidArgument> {
        let spec = LimitSpec::FixedWindow { window, limit };
        spec.validate()?;
        Ok(spec)
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            LimitSpec::TokenBucket { .. } => Algorithm::TokenBucket,
            LimitSpec::SlidingWindow { .. } => Algorithm::SlidingWindow,
            LimitSpec::FixedWindow { .. } => Algorithm::FixedWindow,
        }
    }

    /// Capacity (token bucket) or per-window limit.
    pub fn limit(&self) -> u32 {
        match self {
            LimitSpec::TokenBucket { capacity, .. } => *capacity,
            LimitSpec::SlidingWindow { limit, .. } | LimitSpec::FixedWindow { limit, .. } => *limit,
        }
    }

    /// Reject parameters that can never be served.
    pub fn validate(&self) -> Result<(), InvalidArgument> {
        match self {
            LimitSpec::TokenBucket { capacity, refill_per_second } => {
                strategies::validate_capacity(*capacity)?;
                strategies::validate_refill_rate(*refill_per_second)?;
                strategies::validate_bucket_expiry(*capacity, *refill_per_second)
            }
            LimitSpec::SlidingWindow { window, limit } | LimitSpec::FixedWindow { window, limit } => {
                strategies::validate_window(*window)?;
                strategies::validate_limit(*limit)
            }
        }
    }
}

/// Read-only occupancy snapshot of one limiter key.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RateLimitInfo {
    /// Caller key (without the store prefix).
    pub key: String,
    pub algorithm: Algorithm,
    /// Capacity or per-window limit.
    pub limit: u32,
    /// Permits in use: consumed tokens, requests in the trailing window, or the
    /// current window's counter.
    pub current: u32,
    /// Sliding/fixed: the window. Token bucket: time to refill an empty bucket
    /// (`Duration::MAX` when the refill rate is zero).
    pub window_size: Duration,
    /// Time until `current` drains back to zero (`Duration::MAX` if it never will).
    pub remaining_time: Duration,
}

impl RateLimitInfo {
    /// Zeroed snapshot, used for unknown keys and when the store is unreachable.
    pub fn empty(key: &str, spec: &LimitSpec) -> Self {
        Self {
            key: key.to_string(),
            algorithm: spec.algorithm(),
            limit: spec.limit(),
            current: 0,
            window_size: strategies::window_size(spec),
            remaining_time: Duration::ZERO,
        }
    }

    /// Permits still available.
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.current)
    }
}
