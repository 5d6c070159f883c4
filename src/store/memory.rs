use super::{KeyTtl, KvScriptClient, Script, ScriptKind, ScriptValue};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    /// Ordered by `(score, member)`; members are unique by construction.
    SortedSet(BTreeSet<(u64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

type Data = HashMap<String, Entry>;

/// In-memory, script-capable key-value store.
///
/// Every operation, scripts included, runs while holding one mutex, which gives
/// the same no-interleaving guarantee a real store gives its scripts. Key
/// expiry is evaluated lazily against the injected [`Clock`].
///
/// Clones share state.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    data: Arc<Mutex<Data>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
    round_trips: Arc<AtomicU64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Store that expires keys against the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Store that expires keys against `clock`.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(clock),
            unavailable: Arc::new(AtomicBool::new(false)),
            round_trips: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Simulate an outage: while set, every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of calls served (or refused) so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        guard.values().filter(|e| !is_expired(e, now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw view of a hash field, for assertions on stored state.
    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let mut guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        match live(&mut guard, key, now).map(|e| &e.value) {
            Some(Value::Hash(h)) => h.get(field).cloned(),
            _ => None,
        }
    }

    /// Number of members in a sorted set (expired keys count as empty).
    pub fn sorted_set_len(&self, key: &str) -> usize {
        let now = self.clock.now_millis();
        let mut guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        match live(&mut guard, key, now).map(|e| &e.value) {
            Some(Value::SortedSet(z)) => z.len(),
            _ => 0,
        }
    }

    fn begin(&self) -> Result<(MutexGuard<'_, Data>, u64), StoreError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory store marked unavailable"));
        }
        let guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        Ok((guard, self.clock.now_millis()))
    }
}

fn is_expired(entry: &Entry, now: u64) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

/// Look up a key, dropping it first if it has expired.
fn live<'a>(data: &'a mut Data, key: &str, now: u64) -> Option<&'a mut Entry> {
    if data.get(key).is_some_and(|e| is_expired(e, now)) {
        data.remove(key);
    }
    data.get_mut(key)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn wrong_type(script: &'static str) -> StoreError {
    StoreError::Script {
        script,
        message: "WRONGTYPE Operation against a key holding the wrong kind of value".into(),
    }
}

/// Format a number the way Lua's `tostring` does for the values these scripts produce.
fn lua_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

struct Args<'a> {
    script: &'static str,
    keys: &'a [String],
    args: &'a [String],
}

impl<'a> Args<'a> {
    fn key(&self, i: usize) -> Result<&'a str, StoreError> {
        self.keys.get(i).map(String::as_str).ok_or_else(|| StoreError::Script {
            script: self.script,
            message: format!("missing KEYS[{}]", i + 1),
        })
    }

    fn text(&self, i: usize) -> Result<&'a str, StoreError> {
        self.args.get(i).map(String::as_str).ok_or_else(|| StoreError::Script {
            script: self.script,
            message: format!("missing ARGV[{}]", i + 1),
        })
    }

    fn num(&self, i: usize) -> Result<f64, StoreError> {
        let raw = self.text(i)?;
        raw.parse::<f64>().map_err(|_| StoreError::Script {
            script: self.script,
            message: format!("ARGV[{}] is not a number: {:?}", i + 1, raw),
        })
    }
}

/// Shared refill step of both token bucket scripts.
fn refill(tokens: f64, last_refill: f64, capacity: f64, rate: f64, now: f64) -> (f64, f64) {
    let (mut tokens, mut last_refill) = (tokens, last_refill);
    if rate > 0.0 && now > last_refill {
        let added = ((now - last_refill) * rate / 1000.0).floor();
        if added > 0.0 {
            tokens += added;
            last_refill += (added * 1000.0 / rate).ceil();
        }
    }
    if tokens >= capacity {
        tokens = capacity;
        last_refill = now;
    }
    (tokens, last_refill)
}

fn bucket_state(
    data: &mut Data,
    key: &str,
    now: u64,
    script: &'static str,
) -> Result<Option<(f64, f64)>, StoreError> {
    match live(data, key, now).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::Hash(h)) => {
            let tokens = h.get("tokens").and_then(|v| v.parse::<f64>().ok());
            let last = h.get("last_refill").and_then(|v| v.parse::<f64>().ok());
            Ok(tokens.zip(last))
        }
        Some(_) => Err(wrong_type(script)),
    }
}

fn token_bucket_admit(data: &mut Data, a: &Args<'_>, now_store: u64) -> Result<ScriptValue, StoreError> {
    let key = a.key(0)?;
    let capacity = a.num(0)?;
    let rate = a.num(1)?;
    let requested = a.num(2)?;
    let now = a.num(3)?;
    let ttl = a.num(4)?;

    let (tokens, last_refill) =
        bucket_state(data, key, now_store, a.script)?.unwrap_or((capacity, now));
    let (mut tokens, last_refill) = refill(tokens, last_refill, capacity, rate, now);

    let mut admitted = 0;
    if tokens >= requested {
        tokens -= requested;
        admitted = 1;
    }

    let mut hash = HashMap::new();
    hash.insert("tokens".to_string(), lua_number(tokens));
    hash.insert("last_refill".to_string(), lua_number(last_refill));
    let expires_at = (ttl > 0.0).then(|| now_store.saturating_add(ttl as u64));
    data.insert(key.to_string(), Entry { value: Value::Hash(hash), expires_at });

    Ok(ScriptValue::Array(vec![ScriptValue::Int(admitted), ScriptValue::Text(lua_number(tokens))]))
}

fn token_bucket_info(data: &mut Data, a: &Args<'_>, now_store: u64) -> Result<ScriptValue, StoreError> {
    let key = a.key(0)?;
    let capacity = a.num(0)?;
    let rate = a.num(1)?;
    let now = a.num(2)?;

    let (tokens, last_refill) = match bucket_state(data, key, now_store, a.script)? {
        None => (capacity, now),
        Some((tokens, last)) => refill(tokens, last, capacity, rate, now),
    };
    Ok(ScriptValue::Array(vec![
        ScriptValue::Text(lua_number(tokens)),
        ScriptValue::Text(lua_number(last_refill)),
    ]))
}

fn sliding_window_admit(
    data: &mut Data,
    a: &Args<'_>,
    now_store: u64,
) -> Result<ScriptValue, StoreError> {
    let key = a.key(0)?;
    let window = a.num(0)?;
    let limit = a.num(1)?;
    let now = a.num(2)?;
    let member = a.text(3)?;
    let floor = now - window;

    let count = match live(data, key, now_store) {
        None => 0,
        Some(Entry { value: Value::SortedSet(z), .. }) => {
            z.retain(|(score, _)| (*score as f64) > floor);
            z.len()
        }
        Some(_) => return Err(wrong_type(a.script)),
    };
    // ZREMRANGEBYSCORE deletes the key once the set is empty.
    if count == 0 {
        data.remove(key);
    }

    if (count as f64) < limit {
        let expires_at = Some(now_store.saturating_add(window as u64));
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::SortedSet(BTreeSet::new()), expires_at });
        if let Value::SortedSet(z) = &mut entry.value {
            z.insert((now as u64, member.to_string()));
        }
        entry.expires_at = expires_at;
        return Ok(ScriptValue::Array(vec![ScriptValue::Int(1), ScriptValue::Int(count as i64 + 1)]));
    }
    Ok(ScriptValue::Array(vec![ScriptValue::Int(0), ScriptValue::Int(count as i64)]))
}

fn sliding_window_info(
    data: &mut Data,
    a: &Args<'_>,
    now_store: u64,
) -> Result<ScriptValue, StoreError> {
    let key = a.key(0)?;
    let window = a.num(0)?;
    let now = a.num(1)?;
    let floor = now - window;

    let (count, oldest) = match live(data, key, now_store).map(|e| &e.value) {
        None => (0, -1),
        Some(Value::SortedSet(z)) => {
            let mut in_window = z.iter().filter(|(score, _)| (*score as f64) > floor);
            let oldest = in_window.next().map(|(score, _)| *score as i64);
            let count = oldest.map(|_| 1 + in_window.count()).unwrap_or(0);
            (count as i64, oldest.unwrap_or(-1))
        }
        Some(_) => return Err(wrong_type(a.script)),
    };
    Ok(ScriptValue::Array(vec![ScriptValue::Int(count), ScriptValue::Int(oldest)]))
}

fn fixed_window_admit(
    data: &mut Data,
    a: &Args<'_>,
    now_store: u64,
) -> Result<ScriptValue, StoreError> {
    let key = a.key(0)?;
    let limit = a.num(0)?;
    let window = a.num(1)?;

    let current = match live(data, key, now_store).map(|e| &e.value) {
        None => 0,
        Some(Value::Str(s)) => s.parse::<i64>().map_err(|_| StoreError::Script {
            script: a.script,
            message: "ERR value is not an integer or out of range".into(),
        })?,
        Some(_) => return Err(wrong_type(a.script)),
    };

    if (current as f64) < limit {
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str((current + 1).to_string()),
                expires_at: Some(now_store.saturating_add(window as u64)),
            },
        );
        return Ok(ScriptValue::Array(vec![ScriptValue::Int(1), ScriptValue::Int(current + 1)]));
    }
    Ok(ScriptValue::Array(vec![ScriptValue::Int(0), ScriptValue::Int(current)]))
}

fn owner_matches(data: &mut Data, key: &str, token: &str, now: u64) -> bool {
    matches!(live(data, key, now).map(|e| &e.value), Some(Value::Str(v)) if v == token)
}

fn lock_renew(data: &mut Data, a: &Args<'_>, now_store: u64) -> Result<ScriptValue, StoreError> {
    let key = a.key(0)?;
    let token = a.text(0)?;
    let ttl = a.num(1)?;
    if owner_matches(data, key, token, now_store) {
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at = Some(now_store.saturating_add(ttl as u64));
        }
        return Ok(ScriptValue::Int(1));
    }
    Ok(ScriptValue::Int(0))
}

fn lock_unlock(data: &mut Data, a: &Args<'_>, now_store: u64) -> Result<ScriptValue, StoreError> {
    let key = a.key(0)?;
    let token = a.text(0)?;
    if owner_matches(data, key, token, now_store) {
        data.remove(key);
        return Ok(ScriptValue::Int(1));
    }
    Ok(ScriptValue::Int(0))
}

#[async_trait]
impl KvScriptClient for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (mut data, now) = self.begin()?;
        match live(&mut data, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type("get")),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (mut data, now) = self.begin()?;
        let expires_at = ttl.map(|t| now.saturating_add(millis(t)));
        data.insert(key.to_string(), Entry { value: Value::Str(value.to_string()), expires_at });
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let (mut data, now) = self.begin()?;
        if live(&mut data, key, now).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now.saturating_add(millis(ttl))),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let (mut data, now) = self.begin()?;
        if live(&mut data, key, now).is_none() {
            return Ok(false);
        }
        Ok(data.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let (mut data, now) = self.begin()?;
        match live(&mut data, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now.saturating_add(millis(ttl)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let (mut data, now) = self.begin()?;
        Ok(match live(&mut data, key, now) {
            None => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Entry { expires_at: Some(at), .. }) => {
                KeyTtl::Expires(Duration::from_millis(at.saturating_sub(now)))
            }
        })
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue, StoreError> {
        let (mut data, now) = self.begin()?;
        let a = Args { script: script.name(), keys, args };
        match script.kind() {
            ScriptKind::TokenBucketAdmit => token_bucket_admit(&mut data, &a, now),
            ScriptKind::TokenBucketInfo => token_bucket_info(&mut data, &a, now),
            ScriptKind::SlidingWindowAdmit => sliding_window_admit(&mut data, &a, now),
            ScriptKind::SlidingWindowInfo => sliding_window_info(&mut data, &a, now),
            ScriptKind::FixedWindowAdmit => fixed_window_admit(&mut data, &a, now),
            ScriptKind::LockRenew => lock_renew(&mut data, &a, now),
            ScriptKind::LockUnlock => lock_unlock(&mut data, &a, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scripts;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn store() -> (InMemoryStore, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (InMemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn set_if_absent_respects_expiry() {
        let (store, clock) = store();
        assert!(store.set_if_absent("k", "a", Duration::from_millis(100)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_millis(100)).await.unwrap());
        clock.advance(Duration::from_millis(100));
        assert!(store.set_if_absent("k", "b", Duration::from_millis(100)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn ttl_reports_all_states() {
        let (store, clock) = store();
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Missing);
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Persistent);
        assert!(store.expire("k", Duration::from_secs(2)).await.unwrap());
        clock.advance(Duration::from_millis(500));
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Expires(Duration::from_millis(1500)));
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let (store, _) = store();
        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let (store, _) = store();
        store.set_unavailable(true);
        assert!(store.get("k").await.unwrap_err().is_unavailable());
        let err = store
            .eval(&scripts::LOCK_UNLOCK, &strings(&["k"]), &strings(&["t"]))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(store.round_trips(), 2);
        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_on_hash_is_wrong_type() {
        let (store, _) = store();
        store
            .eval(&scripts::TOKEN_BUCKET_ADMIT, &strings(&["b"]), &strings(&["5", "1", "1", "1000", "0"]))
            .await
            .unwrap();
        let err = store.get("b").await.unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
    }

    #[tokio::test]
    async fn token_bucket_script_keeps_fractional_progress() {
        let (store, _) = store();
        let keys = strings(&["b"]);
        // capacity 2, 1 token/s: drain at t=0.
        for _ in 0..2 {
            store
                .eval(&scripts::TOKEN_BUCKET_ADMIT, &keys, &strings(&["2", "1", "1", "0", "0"]))
                .await
                .unwrap();
        }
        // Two half-second steps add up to one token even though each alone floors to zero.
        let r = store
            .eval(&scripts::TOKEN_BUCKET_ADMIT, &keys, &strings(&["2", "1", "1", "500", "0"]))
            .await
            .unwrap();
        assert_eq!(r.into_array().unwrap()[0], ScriptValue::Int(0));
        let r = store
            .eval(&scripts::TOKEN_BUCKET_ADMIT, &keys, &strings(&["2", "1", "1", "1000", "0"]))
            .await
            .unwrap();
        assert_eq!(r.into_array().unwrap()[0], ScriptValue::Int(1));
        assert_eq!(store.hash_field("b", "last_refill").as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn token_bucket_script_charges_whole_milliseconds_per_token() {
        let (store, _) = store();
        let keys = strings(&["b"]);
        // capacity 2, 7 tokens/s: one token costs 142.857ms, charged as 143.
        store
            .eval(&scripts::TOKEN_BUCKET_ADMIT, &keys, &strings(&["2", "7", "2", "0", "0"]))
            .await
            .unwrap();
        let r = store
            .eval(&scripts::TOKEN_BUCKET_ADMIT, &keys, &strings(&["2", "7", "1", "150", "0"]))
            .await
            .unwrap();
        assert_eq!(r.into_array().unwrap()[0], ScriptValue::Int(1));
        assert_eq!(store.hash_field("b", "last_refill").as_deref(), Some("143"));
    }

    #[tokio::test]
    async fn sliding_window_script_prunes_and_counts() {
        let (store, _) = store();
        let keys = strings(&["z"]);
        for (now, member) in [("0", "0:a"), ("10", "10:b")] {
            store
                .eval(&scripts::SLIDING_WINDOW_ADMIT, &keys, &strings(&["100", "2", now, member]))
                .await
                .unwrap();
        }
        let denied = store
            .eval(&scripts::SLIDING_WINDOW_ADMIT, &keys, &strings(&["100", "2", "50", "50:c"]))
            .await
            .unwrap();
        assert_eq!(denied, ScriptValue::Array(vec![ScriptValue::Int(0), ScriptValue::Int(2)]));
        // At t=100 the member scored 0 sits exactly on the boundary and is pruned.
        let info = store
            .eval(&scripts::SLIDING_WINDOW_INFO, &keys, &strings(&["100", "100"]))
            .await
            .unwrap();
        assert_eq!(info, ScriptValue::Array(vec![ScriptValue::Int(1), ScriptValue::Int(10)]));
        assert_eq!(store.sorted_set_len("z"), 2, "info must not prune");
    }

    #[tokio::test]
    async fn lock_scripts_check_owner() {
        let (store, _) = store();
        store.set_if_absent("l", "owner", Duration::from_secs(1)).await.unwrap();
        let keys = strings(&["l"]);
        let stranger = store.eval(&scripts::LOCK_UNLOCK, &keys, &strings(&["other"])).await.unwrap();
        assert_eq!(stranger, ScriptValue::Int(0));
        let renewed =
            store.eval(&scripts::LOCK_RENEW, &keys, &strings(&["owner", "5000"])).await.unwrap();
        assert_eq!(renewed, ScriptValue::Int(1));
        assert_eq!(store.ttl("l").await.unwrap(), KeyTtl::Expires(Duration::from_secs(5)));
        let released = store.eval(&scripts::LOCK_UNLOCK, &keys, &strings(&["owner"])).await.unwrap();
        assert_eq!(released, ScriptValue::Int(1));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn missing_arguments_are_script_errors() {
        let (store, _) = store();
        let err = store.eval(&scripts::LOCK_RENEW, &strings(&["l"]), &[]).await.unwrap_err();
        assert!(err.to_string().contains("ARGV[1]"));
    }
}
