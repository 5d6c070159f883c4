//! Per-algorithm arithmetic shared by the limiter: parameter validation, script
//! argument layout, key shapes and reply decoding.
//!
//! Nothing here talks to the store.

use crate::error::{InvalidArgument, StoreError};
use crate::rate_limit::LimitSpec;
use crate::store::{Script, ScriptValue};
use std::time::Duration;

/// Shortest window the store can express (`PEXPIRE` granularity).
pub const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Longest expiry handed to the store. Script arguments pass through Lua
/// numbers, which stay exact integers well past this.
pub const MAX_EXPIRY: Duration = Duration::from_millis(1_000_000_000_000_000);

pub(crate) fn validate_key(key: &str) -> Result<(), InvalidArgument> {
    if key.is_empty() {
        return Err(InvalidArgument::new("key", "must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(capacity: u32) -> Result<(), InvalidArgument> {
    if capacity == 0 {
        return Err(InvalidArgument::new("capacity", "must be > 0 (got 0)"));
    }
    Ok(())
}

pub(crate) fn validate_refill_rate(rate: f64) -> Result<(), InvalidArgument> {
    if !rate.is_finite() || rate < 0.0 {
        return Err(InvalidArgument::new(
            "refill_per_second",
            format!("must be finite and >= 0 (got {})", rate),
        ));
    }
    Ok(())
}

pub(crate) fn validate_window(window: Duration) -> Result<(), InvalidArgument> {
    if window < MIN_WINDOW {
        return Err(InvalidArgument::new("window", format!("must be >= 1ms (got {:?})", window)));
    }
    if window > MAX_EXPIRY {
        return Err(InvalidArgument::new(
            "window",
            format!("must be <= {:?} (got {:?})", MAX_EXPIRY, window),
        ));
    }
    Ok(())
}

/// The bucket's full-refill time becomes its expiry, so it must fit the store too.
pub(crate) fn validate_bucket_expiry(capacity: u32, rate: f64) -> Result<(), InvalidArgument> {
    match token_bucket_ttl(capacity, rate) {
        Some(ttl) if ttl > MAX_EXPIRY => Err(InvalidArgument::new(
            "refill_per_second",
            format!("refilling {} tokens at {}/s takes longer than {:?}", capacity, rate, MAX_EXPIRY),
        )),
        _ => Ok(()),
    }
}

pub(crate) fn validate_limit(limit: u32) -> Result<(), InvalidArgument> {
    if limit == 0 {
        return Err(InvalidArgument::new("limit", "must be > 0 (got 0)"));
    }
    Ok(())
}

pub(crate) fn validate_tokens_requested(requested: u32) -> Result<(), InvalidArgument> {
    if requested == 0 {
        return Err(InvalidArgument::new("tokens_requested", "must be > 0 (got 0)"));
    }
    Ok(())
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Expiry of a token bucket: the time an empty bucket needs to refill completely.
///
/// Once that much idle time has passed, a missing bucket and a full one are the
/// same thing, so the key may vanish. A zero rate never refills and never expires.
pub fn token_bucket_ttl(capacity: u32, refill_per_second: f64) -> Option<Duration> {
    if refill_per_second <= 0.0 {
        return None;
    }
    let secs = (f64::from(capacity) / refill_per_second).ceil().max(1.0);
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

/// Start (epoch ms) of the fixed window containing `now`.
pub fn fixed_window_start(now_millis: u64, window: Duration) -> u64 {
    let w = millis(window).max(1);
    (now_millis / w) * w
}

/// `<base>:<window_start>`
pub fn fixed_window_key(base: &str, window_start: u64) -> String {
    format!("{}:{}", base, window_start)
}

/// Sorted-set member for one admitted request: unique even within a millisecond.
pub fn sliding_window_member(now_millis: u64, nonce: u64) -> String {
    format!("{}:{:016x}", now_millis, nonce)
}

/// `window_size` reported by [`RateLimitInfo`](crate::rate_limit::RateLimitInfo).
pub fn window_size(spec: &LimitSpec) -> Duration {
    match spec {
        LimitSpec::TokenBucket { capacity, refill_per_second } => {
            token_bucket_ttl(*capacity, *refill_per_second).unwrap_or(Duration::MAX)
        }
        LimitSpec::SlidingWindow { window, .. } | LimitSpec::FixedWindow { window, .. } => *window,
    }
}

/// `ARGV` for [`TOKEN_BUCKET_ADMIT`](crate::scripts::TOKEN_BUCKET_ADMIT).
pub fn token_bucket_args(
    capacity: u32,
    refill_per_second: f64,
    requested: u32,
    now_millis: u64,
) -> Vec<String> {
    let ttl = token_bucket_ttl(capacity, refill_per_second).map(millis).unwrap_or(0);
    vec![
        capacity.to_string(),
        refill_per_second.to_string(),
        requested.to_string(),
        now_millis.to_string(),
        ttl.to_string(),
    ]
}

/// Decoded `{admitted, level}` reply of an admission script.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub admitted: bool,
    /// Tokens left (token bucket) or occupancy after the call (windows).
    pub level: f64,
}

pub fn decode_admission(script: &Script, reply: ScriptValue) -> Result<Admission, StoreError> {
    let shape = || StoreError::unexpected_reply(script.name(), &reply);
    let items = reply.clone().into_array().ok_or_else(shape)?;
    match items.as_slice() {
        [flag, level] => {
            let admitted = flag.as_bool().ok_or_else(shape)?;
            let level = level.as_f64().ok_or_else(shape)?;
            Ok(Admission { admitted, level })
        }
        _ => Err(shape()),
    }
}

/// Decode a `{first, second}` numeric pair reply.
pub fn decode_pair(script: &Script, reply: ScriptValue) -> Result<(f64, f64), StoreError> {
    let shape = || StoreError::unexpected_reply(script.name(), &reply);
    let items = reply.clone().into_array().ok_or_else(shape)?;
    match items.as_slice() {
        [a, b] => Ok((a.as_f64().ok_or_else(shape)?, b.as_f64().ok_or_else(shape)?)),
        _ => Err(shape()),
    }
}

/// `(current, remaining_time)` of a token bucket holding `tokens`, last refilled at `last_refill`.
pub fn token_bucket_occupancy(
    capacity: u32,
    refill_per_second: f64,
    tokens: f64,
    last_refill: f64,
    now_millis: u64,
) -> (u32, Duration) {
    let capacity = f64::from(capacity);
    let tokens = tokens.clamp(0.0, capacity);
    let current = (capacity - tokens.floor()).max(0.0) as u32;
    if tokens >= capacity {
        return (current, Duration::ZERO);
    }
    if refill_per_second <= 0.0 {
        return (current, Duration::MAX);
    }
    let full_at = last_refill + ((capacity - tokens) * 1000.0 / refill_per_second).ceil();
    let remaining = (full_at - now_millis as f64).max(0.0);
    (current, Duration::from_millis(remaining as u64))
}

/// `remaining_time` of a sliding window whose oldest in-window entry is scored `oldest`.
pub fn sliding_window_remaining(oldest: Option<u64>, window: Duration, now_millis: u64) -> Duration {
    match oldest {
        Some(score) => {
            let leaves_at = score.saturating_add(millis(window));
            Duration::from_millis(leaves_at.saturating_sub(now_millis))
        }
        None => Duration::ZERO,
    }
}

/// `remaining_time` of the fixed window starting at `window_start`.
pub fn fixed_window_remaining(window_start: u64, window: Duration, now_millis: u64) -> Duration {
    let ends_at = window_start.saturating_add(millis(window));
    Duration::from_millis(ends_at.saturating_sub(now_millis))
}
