//! The key-value capability the coordination layer is built on.
//!
//! [`KvScriptClient`] is the only seam between this crate and the outside world.
//! Implementations must guarantee that [`KvScriptClient::eval`] runs a script
//! without interleaving other clients' commands on the same keys; every
//! check-then-act sequence in this crate relies on that.
//!
//! Two implementations exist:
//! - [`InMemoryStore`]: in-process fake that runs the native equivalent of
//!   each [`ScriptKind`] under a single lock.
//! - `gatekeep-redis`: Redis adapter that runs the Lua bodies from [`crate::scripts`].

use crate::error::StoreError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

pub mod memory;
pub use memory::InMemoryStore;

/// Stable identifier of a server-side script.
///
/// Fakes dispatch on this instead of interpreting the script body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    TokenBucketAdmit,
    TokenBucketInfo,
    SlidingWindowAdmit,
    SlidingWindowInfo,
    FixedWindowAdmit,
    LockRenew,
    LockUnlock,
}

impl ScriptKind {
    /// Short name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            ScriptKind::TokenBucketAdmit => "token_bucket_admit",
            ScriptKind::TokenBucketInfo => "token_bucket_info",
            ScriptKind::SlidingWindowAdmit => "sliding_window_admit",
            ScriptKind::SlidingWindowInfo => "sliding_window_info",
            ScriptKind::FixedWindowAdmit => "fixed_window_admit",
            ScriptKind::LockRenew => "lock_renew",
            ScriptKind::LockUnlock => "lock_unlock",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A server-side script: a stable kind plus the Lua source executed by real stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Script {
    kind: ScriptKind,
    body: &'static str,
}

impl Script {
    pub(crate) const fn new(kind: ScriptKind, body: &'static str) -> Self {
        Self { kind, body }
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    /// Lua source.
    pub fn body(&self) -> &'static str {
        self.body
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Reply of a script, mirroring the Lua-to-RESP conversion rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    /// `nil` / `false`.
    Nil,
    /// Lua numbers are truncated to integers on the way out.
    Int(i64),
    /// Strings (fractional numbers are returned as `tostring(...)`).
    Text(String),
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    /// Interpret as an integer, accepting numeric text.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(v) => Some(*v),
            ScriptValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Interpret as a float, accepting integers and numeric text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Int(v) => Some(*v as f64),
            ScriptValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Lua truthiness as seen by callers: non-zero integers are true.
    pub fn as_bool(&self) -> Option<bool> {
        self.as_int().map(|v| v != 0)
    }

    pub fn into_array(self) -> Option<Vec<ScriptValue>> {
        match self {
            ScriptValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Remaining lifetime of a key, as reported by `PTTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or already expired).
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Decode a raw `PTTL` reply (`-2` missing, `-1` persistent).
    pub fn from_pttl(raw: i64) -> Result<Self, StoreError> {
        match raw {
            -2 => Ok(KeyTtl::Missing),
            -1 => Ok(KeyTtl::Persistent),
            ms if ms >= 0 => Ok(KeyTtl::Expires(Duration::from_millis(ms as u64))),
            other => Err(StoreError::unexpected_reply("pttl", other)),
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, KeyTtl::Missing)
    }
}

/// Abstract key-value store with atomic server-side scripting.
///
/// All methods are single round trips. Durations are applied with millisecond
/// precision (`PX` / `PEXPIRE`).
#[async_trait]
pub trait KvScriptClient: Send + Sync {
    /// Fetch a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally write a string value, optionally with an expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically write `value` with expiry `ttl` only if `key` is absent.
    ///
    /// Returns `Ok(true)` if the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete a key. Returns `Ok(true)` if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Set a key's expiry. Returns `Ok(false)` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Query a key's remaining lifetime.
    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// Run `script` atomically against `keys` with `args`.
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue, StoreError>;
}

#[async_trait]
impl<T> KvScriptClient for std::sync::Arc<T>
where
    T: KvScriptClient + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        (**self).ttl(key).await
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue, StoreError> {
        (**self).eval(script, keys, args).await
    }
}
