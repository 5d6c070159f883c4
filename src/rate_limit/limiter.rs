use crate::clock::{Clock, SystemClock};
use crate::config::CoordinationConfig;
use crate::error::{InvalidArgument, StoreError};
use crate::rate_limit::strategies::{self, Admission};
use crate::rate_limit::{Algorithm, LimitSpec, RateLimitInfo};
use crate::scripts;
use crate::store::{KvScriptClient, Script};
use crate::telemetry::{emit_best_effort, CoordinationEvent, NullSink, RateLimitEvent, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;

/// Stateless rate-limiting facade over a [`KvScriptClient`].
///
/// Every admission is exactly one atomic script execution; nothing is cached
/// in-process, so any number of limiter instances (in any number of processes)
/// can share one store. Clones share the client.
///
/// Admission methods return `Err` only for invalid arguments. Store failures are
/// logged and reported as a denial.
///
/// ```rust
/// use gatekeep::{InMemoryStore, RateLimiter};
///
/// # #[tokio::main]
/// # async fn main() {
/// let limiter = RateLimiter::new(InMemoryStore::new());
/// for _ in 0..5 {
///     assert!(limiter.token_bucket_limit("api:login:203.0.113.5", 5, 1.0, 1).await.unwrap());
/// }
/// assert!(!limiter.token_bucket_limit("api:login:203.0.113.5", 5, 1.0, 1).await.unwrap());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiter<C, S = NullSink> {
    client: Arc<C>,
    config: CoordinationConfig,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl<C> RateLimiter<C, NullSink>
where
    C: KvScriptClient,
{
    /// Limiter with default key prefixes and the system clock.
    pub fn new(client: C) -> Self {
        Self::from_arc(Arc::new(client))
    }

    /// Limiter over an already shared client.
    pub fn from_arc(client: Arc<C>) -> Self {
        Self {
            client,
            config: CoordinationConfig::default(),
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl<C, S> RateLimiter<C, S> {
    /// Override key prefixes.
    pub fn with_config(mut self, config: CoordinationConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<K: Clock + 'static>(mut self, clock: K) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Route decisions to a telemetry sink.
    pub fn with_telemetry<T: TelemetrySink>(self, sink: T) -> RateLimiter<C, T> {
        RateLimiter { client: self.client, config: self.config, clock: self.clock, sink }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }
}

impl<C, S> RateLimiter<C, S>
where
    C: KvScriptClient,
    S: TelemetrySink + Sync,
    S::Future: Send,
{
    /// Token bucket admission of `tokens_requested` permits.
    ///
    /// The bucket starts full, refills `floor(elapsed × rate)` whole tokens, and
    /// never holds more than `capacity`. A denied call still persists the refill.
    ///
    /// A request for more than `capacity` tokens can never succeed and is denied
    /// without a store round trip; it is not an error.
    pub async fn token_bucket_limit(
        &self,
        key: &str,
        capacity: u32,
        refill_per_second: f64,
        tokens_requested: u32,
    ) -> Result<bool, InvalidArgument> {
        strategies::validate_key(key)?;
        LimitSpec::TokenBucket { capacity, refill_per_second }.validate()?;
        strategies::validate_tokens_requested(tokens_requested)?;

        let store_key = self.config.rate_limit_key(key);
        if tokens_requested > capacity {
            tracing::debug!(
                key = %store_key,
                tokens_requested,
                capacity,
                "token bucket request exceeds capacity; denied"
            );
            self.emit(RateLimitEvent::Denied { key: store_key, algorithm: Algorithm::TokenBucket })
                .await;
            return Ok(false);
        }

        let now = self.clock.now_millis();
        let args = strategies::token_bucket_args(capacity, refill_per_second, tokens_requested, now);
        Ok(self.admit(Algorithm::TokenBucket, &scripts::TOKEN_BUCKET_ADMIT, store_key, args).await)
    }

    /// Sliding window admission: at most `limit` admissions in any trailing `window`.
    pub async fn sliding_window_limit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<bool, InvalidArgument> {
        strategies::validate_key(key)?;
        LimitSpec::SlidingWindow { window, limit }.validate()?;

        let now = self.clock.now_millis();
        let member = strategies::sliding_window_member(now, rand::random::<u64>());
        let args = vec![
            strategies::millis(window).to_string(),
            limit.to_string(),
            now.to_string(),
            member,
        ];
        let store_key = self.config.rate_limit_key(key);
        Ok(self.admit(Algorithm::SlidingWindow, &scripts::SLIDING_WINDOW_ADMIT, store_key, args).await)
    }

    /// Fixed window admission: at most `limit` admissions per aligned `window`.
    ///
    /// Windows are aligned to the epoch, so up to `2 × limit` requests can pass
    /// in a short span straddling a boundary.
    pub async fn fixed_window_limit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<bool, InvalidArgument> {
        strategies::validate_key(key)?;
        LimitSpec::FixedWindow { window, limit }.validate()?;

        let now = self.clock.now_millis();
        let base = self.config.rate_limit_key(key);
        let store_key = strategies::fixed_window_key(&base, strategies::fixed_window_start(now, window));
        let args = vec![limit.to_string(), strategies::millis(window).to_string()];
        Ok(self.admit(Algorithm::FixedWindow, &scripts::FIXED_WINDOW_ADMIT, store_key, args).await)
    }

    /// Admit one request under `spec`.
    pub async fn check(&self, key: &str, spec: &LimitSpec) -> Result<bool, InvalidArgument> {
        match spec {
            LimitSpec::TokenBucket { capacity, refill_per_second } => {
                self.token_bucket_limit(key, *capacity, *refill_per_second, 1).await
            }
            LimitSpec::SlidingWindow { window, limit } => {
                self.sliding_window_limit(key, *window, *limit).await
            }
            LimitSpec::FixedWindow { window, limit } => {
                self.fixed_window_limit(key, *window, *limit).await
            }
        }
    }

    /// Current occupancy of `key` under `spec`, without mutating anything.
    ///
    /// Unknown keys, and any store failure, yield [`RateLimitInfo::empty`].
    pub async fn rate_limit_info(
        &self,
        key: &str,
        spec: &LimitSpec,
    ) -> Result<RateLimitInfo, InvalidArgument> {
        strategies::validate_key(key)?;
        spec.validate()?;

        let now = self.clock.now_millis();
        let base = self.config.rate_limit_key(key);
        match self.read_occupancy(&base, spec, now).await {
            Ok((current, remaining_time)) => {
                Ok(RateLimitInfo { current, remaining_time, ..RateLimitInfo::empty(key, spec) })
            }
            Err(e) => {
                tracing::warn!(
                    key = %base,
                    algorithm = %spec.algorithm(),
                    error = %e,
                    "rate limit info unavailable; reporting empty"
                );
                Ok(RateLimitInfo::empty(key, spec))
            }
        }
    }

    /// Drop all state for `key` so the next call behaves as if it never existed.
    ///
    /// Idempotent. Returns `Ok(false)` only if the store could not be reached.
    pub async fn reset_rate_limit(&self, key: &str, spec: &LimitSpec) -> Result<bool, InvalidArgument> {
        strategies::validate_key(key)?;
        spec.validate()?;

        let base = self.config.rate_limit_key(key);
        let mut targets = vec![base.clone()];
        if let LimitSpec::FixedWindow { window, .. } = spec {
            let start = strategies::fixed_window_start(self.clock.now_millis(), *window);
            targets.push(strategies::fixed_window_key(&base, start));
        }

        for target in &targets {
            if let Err(e) = self.client.delete(target).await {
                tracing::warn!(
                    key = %target,
                    algorithm = %spec.algorithm(),
                    error = %e,
                    "rate limit reset failed"
                );
                return Ok(false);
            }
        }
        tracing::debug!(key = %base, algorithm = %spec.algorithm(), "rate limit reset");
        Ok(true)
    }

    async fn read_occupancy(
        &self,
        base: &str,
        spec: &LimitSpec,
        now: u64,
    ) -> Result<(u32, Duration), StoreError> {
        match spec {
            LimitSpec::TokenBucket { capacity, refill_per_second } => {
                let script = scripts::TOKEN_BUCKET_INFO;
                let args = vec![capacity.to_string(), refill_per_second.to_string(), now.to_string()];
                let reply = self.client.eval(&script, &[base.to_string()], &args).await?;
                let (tokens, last_refill) = strategies::decode_pair(&script, reply)?;
                Ok(strategies::token_bucket_occupancy(
                    *capacity,
                    *refill_per_second,
                    tokens,
                    last_refill,
                    now,
                ))
            }
            LimitSpec::SlidingWindow { window, .. } => {
                let script = scripts::SLIDING_WINDOW_INFO;
                let args = vec![strategies::millis(*window).to_string(), now.to_string()];
                let reply = self.client.eval(&script, &[base.to_string()], &args).await?;
                let (count, oldest) = strategies::decode_pair(&script, reply)?;
                let oldest = (oldest >= 0.0).then_some(oldest as u64);
                Ok((count as u32, strategies::sliding_window_remaining(oldest, *window, now)))
            }
            LimitSpec::FixedWindow { window, .. } => {
                let start = strategies::fixed_window_start(now, *window);
                let sub_key = strategies::fixed_window_key(base, start);
                let current = match self.client.get(&sub_key).await? {
                    Some(raw) => raw
                        .parse::<u32>()
                        .map_err(|_| StoreError::unexpected_reply("fixed window counter", raw))?,
                    None => 0,
                };
                Ok((current, strategies::fixed_window_remaining(start, *window, now)))
            }
        }
    }

    /// Run one admission script; any failure is a denial.
    async fn admit(
        &self,
        algorithm: Algorithm,
        script: &Script,
        store_key: String,
        args: Vec<String>,
    ) -> bool {
        let keys = [store_key];
        let outcome = match self.client.eval(script, &keys, &args).await {
            Ok(reply) => strategies::decode_admission(script, reply),
            Err(e) => Err(e),
        };
        let [store_key] = keys;

        match outcome {
            Ok(Admission { admitted, level }) => {
                tracing::debug!(key = %store_key, %algorithm, admitted, level, "rate limit decision");
                let event = if admitted {
                    RateLimitEvent::Admitted { key: store_key, algorithm }
                } else {
                    RateLimitEvent::Denied { key: store_key, algorithm }
                };
                self.emit(event).await;
                admitted
            }
            Err(e) => {
                tracing::warn!(
                    key = %store_key,
                    %algorithm,
                    error = %e,
                    "rate limit store failure; denying request"
                );
                self.emit(RateLimitEvent::FailedClosed { key: store_key, algorithm }).await;
                false
            }
        }
    }

    async fn emit(&self, event: RateLimitEvent) {
        emit_best_effort(self.sink.clone(), CoordinationEvent::RateLimit(event)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use crate::telemetry::MemorySink;

    fn limiter() -> (RateLimiter<InMemoryStore, MemorySink>, InMemoryStore, ManualClock, MemorySink) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = InMemoryStore::with_clock(clock.clone());
        let sink = MemorySink::new();
        let limiter = RateLimiter::new(store.clone())
            .with_clock(clock.clone())
            .with_telemetry(sink.clone());
        (limiter, store, clock, sink)
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_store() {
        let (limiter, store, _, _) = limiter();
        assert_eq!(limiter.token_bucket_limit("k", 0, 1.0, 1).await.unwrap_err().name, "capacity");
        assert_eq!(limiter.token_bucket_limit("k", 5, 1.0, 0).await.unwrap_err().name, "tokens_requested");
        assert_eq!(limiter.token_bucket_limit("", 5, 1.0, 1).await.unwrap_err().name, "key");
        assert_eq!(
            limiter.sliding_window_limit("k", Duration::ZERO, 1).await.unwrap_err().name,
            "window"
        );
        assert_eq!(
            limiter.fixed_window_limit("k", Duration::from_secs(1), 0).await.unwrap_err().name,
            "limit"
        );
        let bad = LimitSpec::TokenBucket { capacity: 3, refill_per_second: -2.0 };
        assert!(limiter.rate_limit_info("k", &bad).await.is_err());
        assert!(limiter.reset_rate_limit("k", &bad).await.is_err());
        assert_eq!(store.round_trips(), 0);
    }

    #[tokio::test]
    async fn oversized_request_is_denied_without_round_trip() {
        let (limiter, store, _, sink) = limiter();
        assert!(!limiter.token_bucket_limit("k", 3, 1.0, 4).await.unwrap());
        assert_eq!(store.round_trips(), 0);
        assert_eq!(
            sink.events(),
            vec![CoordinationEvent::RateLimit(RateLimitEvent::Denied {
                key: "ratelimit:k".into(),
                algorithm: Algorithm::TokenBucket,
            })]
        );
    }

    #[tokio::test]
    async fn each_admission_is_one_round_trip() {
        let (limiter, store, _, _) = limiter();
        limiter.token_bucket_limit("a", 5, 1.0, 1).await.unwrap();
        limiter.sliding_window_limit("b", Duration::from_secs(1), 5).await.unwrap();
        limiter.fixed_window_limit("c", Duration::from_secs(1), 5).await.unwrap();
        assert_eq!(store.round_trips(), 3);
    }

    #[tokio::test]
    async fn bucket_state_is_stored_under_prefix_with_refill_ttl() {
        let (limiter, store, _, _) = limiter();
        limiter.token_bucket_limit("user:7", 4, 2.0, 3).await.unwrap();
        assert_eq!(store.hash_field("ratelimit:user:7", "tokens").as_deref(), Some("1"));
        assert_eq!(
            store.ttl("ratelimit:user:7").await.unwrap(),
            crate::store::KeyTtl::Expires(Duration::from_secs(2))
        );
    }

    #[tokio::test]
    async fn zero_rate_bucket_never_expires() {
        let (limiter, store, clock, _) = limiter();
        assert!(limiter.token_bucket_limit("gate", 2, 0.0, 2).await.unwrap());
        assert_eq!(store.ttl("ratelimit:gate").await.unwrap(), crate::store::KeyTtl::Persistent);
        clock.advance(Duration::from_secs(3_600));
        assert!(!limiter.token_bucket_limit("gate", 2, 0.0, 1).await.unwrap());
    }

    #[tokio::test]
    async fn decisions_are_reported_to_the_sink() {
        let (limiter, _, _, sink) = limiter();
        let w = Duration::from_secs(10);
        assert!(limiter.fixed_window_limit("f", w, 1).await.unwrap());
        assert!(!limiter.fixed_window_limit("f", w, 1).await.unwrap());
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            CoordinationEvent::RateLimit(RateLimitEvent::Admitted { algorithm: Algorithm::FixedWindow, .. })
        ));
        assert!(matches!(&events[1], CoordinationEvent::RateLimit(RateLimitEvent::Denied { .. })));
    }

    #[tokio::test]
    async fn custom_prefix_is_used() {
        let (limiter, store, _, _) = limiter();
        let limiter = limiter.with_config(CoordinationConfig::new("rl", "lk").unwrap());
        limiter.token_bucket_limit("x", 2, 1.0, 1).await.unwrap();
        assert!(store.hash_field("rl:x", "tokens").is_some());
        assert!(store.hash_field("ratelimit:x", "tokens").is_none());
    }
}
