//! Redis client for `gatekeep` (companion crate).
//! Bring your own `redis::aio::ConnectionManager`, or let [`RedisStore::connect`] open one.
//!
//! Scripts run through `EVALSHA`; on `NOSCRIPT` the body is loaded and the
//! call retried, so a flushed script cache heals itself.

use async_trait::async_trait;
use gatekeep::store::{KeyTtl, KvScriptClient, Script, ScriptKind, ScriptValue};
use gatekeep::{scripts, StoreError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    scripts: Arc<HashMap<ScriptKind, redis::Script>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("conn", &"<redis::aio::ConnectionManager>")
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        let scripts = scripts::ALL
            .iter()
            .map(|s| (s.kind(), redis::Script::new(s.body())))
            .collect();
        Self { conn, scripts: Arc::new(scripts) }
    }

    /// Open a connection manager for `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            tracing::warn!(target: "gatekeep::redis", error = %e, "redis connection failed");
            StoreError::unavailable(e)
        })?;
        tracing::debug!(target: "gatekeep::redis", "redis connection established");
        Ok(Self::new(conn))
    }

    /// `SCRIPT LOAD` every script up front so the first admission skips the
    /// `NOSCRIPT` fallback.
    pub async fn preload_scripts(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        for script in scripts::ALL {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(script.body())
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("script load", e))?;
            tracing::debug!(target: "gatekeep::redis", script = script.name(), sha = %sha, "script loaded");
        }
        Ok(())
    }
}

#[async_trait]
impl KvScriptClient for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| command_error("get", e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(|e| command_error("set", e))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("set nx", e))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(|e| command_error("del", e))?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ms = i64::try_from(millis(ttl)).unwrap_or(i64::MAX);
        let set: i64 = conn.pexpire(key, ms).await.map_err(|e| command_error("pexpire", e))?;
        Ok(set == 1)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let mut conn = self.conn.clone();
        let raw: i64 = conn.pttl(key).await.map_err(|e| command_error("pttl", e))?;
        KeyTtl::from_pttl(raw)
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue, StoreError> {
        let compiled = self.scripts.get(&script.kind()).ok_or_else(|| StoreError::Script {
            script: script.name(),
            message: "script not registered with this client".into(),
        })?;
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let mut conn = self.conn.clone();
        let reply: Value = invocation.invoke_async(&mut conn).await.map_err(|e| {
            if is_transport(&e) {
                StoreError::unavailable(e)
            } else {
                StoreError::Script { script: script.name(), message: e.to_string() }
            }
        })?;
        script_value(script.name(), reply)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn is_transport(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn command_error(command: &'static str, e: RedisError) -> StoreError {
    if is_transport(&e) {
        StoreError::unavailable(e)
    } else {
        StoreError::unexpected_reply(command, e.to_string())
    }
}

/// Convert a RESP reply into the crate-neutral script value.
fn script_value(context: &'static str, value: Value) -> Result<ScriptValue, StoreError> {
    match value {
        Value::Nil => Ok(ScriptValue::Nil),
        Value::Int(v) => Ok(ScriptValue::Int(v)),
        Value::BulkString(bytes) => String::from_utf8(bytes)
            .map(ScriptValue::Text)
            .map_err(|e| StoreError::unexpected_reply(context, e.into_bytes())),
        Value::SimpleString(s) => Ok(ScriptValue::Text(s)),
        Value::Okay => Ok(ScriptValue::Text("OK".into())),
        Value::Boolean(b) => Ok(if b { ScriptValue::Int(1) } else { ScriptValue::Nil }),
        Value::Array(items) => items
            .into_iter()
            .map(|item| script_value(context, item))
            .collect::<Result<Vec<_>, _>>()
            .map(ScriptValue::Array),
        other => Err(StoreError::unexpected_reply(context, other)),
    }
}
