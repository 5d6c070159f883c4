//! Server-side scripts.
//!
//! Each script touches only the keys passed in `KEYS`, takes `now` (epoch ms)
//! and all parameters through `ARGV`, and returns integers or `tostring`'d
//! numbers so nothing is lost in the Lua-to-RESP number truncation.
//!
//! [`InMemoryStore`](crate::store::InMemoryStore) mirrors these bodies natively;
//! the two must change together.

use crate::store::{Script, ScriptKind};

/// `KEYS[1]` bucket hash. `ARGV`: capacity, refill rate (tokens/s), requested,
/// now, ttl ms (`0` = no expiry).
///
/// Returns `{admitted (0|1), tostring(tokens_left)}`.
pub const TOKEN_BUCKET_ADMIT: Script = Script::new(
    ScriptKind::TokenBucketAdmit,
    r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

if rate > 0 and now > last_refill then
  local added = math.floor((now - last_refill) * rate / 1000)
  if added > 0 then
    tokens = tokens + added
    last_refill = last_refill + math.ceil(added * 1000 / rate)
  end
end
if tokens >= capacity then
  tokens = capacity
  last_refill = now
end

local admitted = 0
if tokens >= requested then
  tokens = tokens - requested
  admitted = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', tostring(last_refill))
if ttl > 0 then
  redis.call('PEXPIRE', key, ttl)
else
  redis.call('PERSIST', key)
end
return {admitted, tostring(tokens)}
"#,
);

/// `KEYS[1]` bucket hash. `ARGV`: capacity, refill rate, now.
///
/// Read-only. Returns `{tostring(tokens), tostring(last_refill)}` after a
/// virtual refill; an absent bucket reads as `{capacity, now}`.
pub const TOKEN_BUCKET_INFO: Script = Script::new(
    ScriptKind::TokenBucketInfo,
    r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  return {tostring(capacity), tostring(now)}
end

if rate > 0 and now > last_refill then
  local added = math.floor((now - last_refill) * rate / 1000)
  if added > 0 then
    tokens = tokens + added
    last_refill = last_refill + math.ceil(added * 1000 / rate)
  end
end
if tokens >= capacity then
  tokens = capacity
  last_refill = now
end
return {tostring(tokens), tostring(last_refill)}
"#,
);

/// `KEYS[1]` sorted set. `ARGV`: window ms, limit, now, member.
///
/// Returns `{admitted (0|1), count_in_window}`.
pub const SLIDING_WINDOW_ADMIT: Script = Script::new(
    ScriptKind::SlidingWindowAdmit,
    r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, window)
  return {1, count + 1}
end
return {0, count}
"#,
);

/// `KEYS[1]` sorted set. `ARGV`: window ms, now.
///
/// Read-only. Returns `{count_in_window, oldest_score or -1}`.
pub const SLIDING_WINDOW_INFO: Script = Script::new(
    ScriptKind::SlidingWindowInfo,
    r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local floor = '(' .. tostring(now - window)

local count = redis.call('ZCOUNT', key, floor, '+inf')
local oldest = redis.call('ZRANGEBYSCORE', key, floor, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
local oldest_score = -1
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {count, oldest_score}
"#,
);

/// `KEYS[1]` window counter (`<key>:<window_start>`). `ARGV`: limit, window ms.
///
/// Returns `{admitted (0|1), counter}`.
pub const FIXED_WINDOW_ADMIT: Script = Script::new(
    ScriptKind::FixedWindowAdmit,
    r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local current = tonumber(redis.call('GET', key) or '0')
if current < limit then
  redis.call('INCR', key)
  redis.call('PEXPIRE', key, window)
  return {1, current + 1}
end
return {0, current}
"#,
);

/// `KEYS[1]` lock key. `ARGV`: owner token, ttl ms. Returns `1` if extended.
pub const LOCK_RENEW: Script = Script::new(
    ScriptKind::LockRenew,
    r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#,
);

/// `KEYS[1]` lock key. `ARGV`: owner token. Returns `1` if deleted.
pub const LOCK_UNLOCK: Script = Script::new(
    ScriptKind::LockUnlock,
    r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#,
);

/// Every script, e.g. for preloading with `SCRIPT LOAD`.
pub const ALL: [Script; 7] = [
    TOKEN_BUCKET_ADMIT,
    TOKEN_BUCKET_INFO,
    SLIDING_WINDOW_ADMIT,
    SLIDING_WINDOW_INFO,
    FIXED_WINDOW_ADMIT,
    LOCK_RENEW,
    LOCK_UNLOCK,
];
