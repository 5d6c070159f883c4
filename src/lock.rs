//! Distributed mutual exclusion over a shared [`KvScriptClient`].
//!
//! A lock is a single key holding the owner token of the current holder:
//!
//! ```text
//! UNACQUIRED --acquire--> HELD --renew--> HELD ... --unlock--> RELEASED
//!                           \----------- ttl elapses ---------> EXPIRED
//! ```
//!
//! Acquire is an atomic set-if-absent. Renew and unlock are each one script
//! that compares the stored token with the handle's before touching the key,
//! so a holder whose lock expired and was taken over can never extend or
//! delete the new holder's lock.
//!
//! There is no built-in waiting or retry; combine [`DistributedLock::acquire`]
//! with the caller's own backoff. Store failures propagate as
//! [`CoordinationError::Store`]: ownership is then unknown and should be
//! treated as lost.

use crate::config::CoordinationConfig;
use crate::error::{CoordinationError, InvalidArgument, StoreError};
use crate::rate_limit::strategies::{millis, validate_key, MAX_EXPIRY};
use crate::scripts;
use crate::store::{KeyTtl, KvScriptClient, Script};
use crate::telemetry::{emit_best_effort, CoordinationEvent, LockEvent, NullSink, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Shortest lock lifetime the store can express.
pub const MIN_LOCK_TTL: Duration = Duration::from_millis(1);

/// Longest lock lifetime accepted.
pub const MAX_LOCK_TTL: Duration = MAX_EXPIRY;

/// Proof of one successful acquisition.
///
/// The owner token is the capability: whoever holds the handle may renew or
/// release, and nobody else can.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: String,
    ttl: Duration,
}

impl LockHandle {
    /// Store key, including the lock prefix.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token written at acquisition.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// TTL of the most recent successful acquire or renew.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Acquire/renew/release on top of a shared store. Clones share the client.
#[derive(Debug, Clone)]
pub struct DistributedLock<C, S = NullSink> {
    client: Arc<C>,
    config: CoordinationConfig,
    sink: S,
}

impl<C> DistributedLock<C, NullSink>
where
    C: KvScriptClient,
{
    pub fn new(client: C) -> Self {
        Self::from_arc(Arc::new(client))
    }

    pub fn from_arc(client: Arc<C>) -> Self {
        Self { client, config: CoordinationConfig::default(), sink: NullSink }
    }
}

impl<C, S> DistributedLock<C, S> {
    /// Override key prefixes.
    pub fn with_config(mut self, config: CoordinationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_telemetry<T: TelemetrySink>(self, sink: T) -> DistributedLock<C, T> {
        DistributedLock { client: self.client, config: self.config, sink }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }
}

impl<C, S> DistributedLock<C, S>
where
    C: KvScriptClient,
    S: TelemetrySink + Sync,
    S::Future: Send,
{
    /// Try once to take `lock_key` for `ttl`.
    ///
    /// Returns `Ok(None)` if someone else holds it.
    pub async fn acquire(
        &self,
        lock_key: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, CoordinationError> {
        validate_key(lock_key)?;
        validate_ttl(ttl)?;

        let key = self.config.lock_key(lock_key);
        let token = Uuid::new_v4().to_string();
        match self.client.set_if_absent(&key, &token, ttl).await {
            Ok(true) => {
                tracing::debug!(key = %key, ttl_ms = millis(ttl), "lock acquired");
                self.emit(LockEvent::Acquired { key: key.clone() }).await;
                Ok(Some(LockHandle { key, token, ttl }))
            }
            Ok(false) => {
                tracing::debug!(key = %key, "lock contended");
                self.emit(LockEvent::Contended { key }).await;
                Ok(None)
            }
            Err(e) => Err(self.store_failure("acquire", key, e).await),
        }
    }

    /// Extend the lock to `ttl` from now, if `handle` still owns it.
    ///
    /// `Ok(false)` means ownership was lost (expired, possibly re-acquired).
    pub async fn renew(&self, handle: &mut LockHandle, ttl: Duration) -> Result<bool, CoordinationError> {
        validate_ttl(ttl)?;
        let args = [handle.token.clone(), millis(ttl).to_string()];
        let renewed = self.guarded("renew", &scripts::LOCK_RENEW, handle, &args).await?;
        if renewed {
            handle.ttl = ttl;
            tracing::debug!(key = %handle.key, ttl_ms = millis(ttl), "lock renewed");
            self.emit(LockEvent::Renewed { key: handle.key.clone() }).await;
        }
        Ok(renewed)
    }

    /// Release the lock if `handle` still owns it.
    ///
    /// `Ok(false)` is the normal outcome when the lock already expired; another
    /// holder's lock is never deleted.
    pub async fn unlock(&self, handle: &LockHandle) -> Result<bool, CoordinationError> {
        let args = [handle.token.clone()];
        let released = self.guarded("unlock", &scripts::LOCK_UNLOCK, handle, &args).await?;
        if released {
            tracing::debug!(key = %handle.key, "lock released");
            self.emit(LockEvent::Released { key: handle.key.clone() }).await;
        }
        Ok(released)
    }

    /// Whether the store still holds this handle's token.
    ///
    /// Advisory only: the answer can be stale by the time it is used. Never a
    /// substitute for the result of [`renew`](Self::renew) or [`unlock`](Self::unlock).
    pub async fn is_valid(&self, handle: &LockHandle) -> Result<bool, CoordinationError> {
        match self.client.get(&handle.key).await {
            Ok(current) => Ok(current.as_deref() == Some(handle.token.as_str())),
            Err(e) => Err(self.store_failure("is_valid", handle.key.clone(), e).await),
        }
    }

    /// Time left on the lock key, `None` once it is gone.
    ///
    /// Reads the key, not the owner: pair with [`is_valid`](Self::is_valid) if
    /// the holder matters.
    pub async fn remaining_ttl(&self, handle: &LockHandle) -> Result<Option<Duration>, CoordinationError> {
        match self.client.ttl(&handle.key).await {
            Ok(ttl) => Ok(match ttl {
                KeyTtl::Expires(left) => Some(left),
                KeyTtl::Persistent => Some(Duration::MAX),
                KeyTtl::Missing => None,
            }),
            Err(e) => Err(self.store_failure("remaining_ttl", handle.key.clone(), e).await),
        }
    }

    /// Run an ownership-guarded script and decode its `0`/`1` reply.
    async fn guarded(
        &self,
        operation: &'static str,
        script: &Script,
        handle: &LockHandle,
        args: &[String],
    ) -> Result<bool, CoordinationError> {
        let keys = [handle.key.clone()];
        let reply = match self.client.eval(script, &keys, args).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.store_failure(operation, handle.key.clone(), e).await),
        };
        let done = match reply.as_int() {
            Some(1) => true,
            Some(0) => false,
            _ => {
                let e = StoreError::unexpected_reply(script.name(), &reply);
                return Err(self.store_failure(operation, handle.key.clone(), e).await);
            }
        };
        if !done {
            tracing::warn!(key = %handle.key, operation, "lock ownership lost");
            self.emit(LockEvent::OwnershipLost { key: handle.key.clone() }).await;
        }
        Ok(done)
    }

    async fn store_failure(&self, operation: &'static str, key: String, e: StoreError) -> CoordinationError {
        tracing::error!(key = %key, operation, error = %e, "lock store failure; ownership unknown");
        self.emit(LockEvent::StoreFailure { key }).await;
        CoordinationError::Store(e)
    }

    async fn emit(&self, event: LockEvent) {
        emit_best_effort(self.sink.clone(), CoordinationEvent::Lock(event)).await;
    }
}

fn validate_ttl(ttl: Duration) -> Result<(), InvalidArgument> {
    if ttl < MIN_LOCK_TTL {
        return Err(InvalidArgument::new("ttl", format!("must be >= 1ms (got {:?})", ttl)));
    }
    if ttl > MAX_LOCK_TTL {
        return Err(InvalidArgument::new(
            "ttl",
            format!("must be <= {:?} (got {:?})", MAX_LOCK_TTL, ttl),
        ));
    }
    Ok(())
}
