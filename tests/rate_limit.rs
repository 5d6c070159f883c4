mod common;

use common::test_helpers::{fixture, T0};
use gatekeep::prelude::*;
use std::time::Duration;

#[tokio::test]
async fn token_bucket_burst_then_refill() {
    let f = fixture();
    for i in 0..5 {
        assert!(f.limiter.token_bucket_limit("k", 5, 1.0, 1).await.unwrap(), "call {}", i);
    }
    assert!(!f.limiter.token_bucket_limit("k", 5, 1.0, 1).await.unwrap());

    f.clock.advance(Duration::from_secs(2));
    assert!(f.limiter.token_bucket_limit("k", 5, 1.0, 1).await.unwrap());
    assert!(f.limiter.token_bucket_limit("k", 5, 1.0, 1).await.unwrap());
    assert!(!f.limiter.token_bucket_limit("k", 5, 1.0, 1).await.unwrap());
}

#[tokio::test]
async fn token_bucket_stays_within_bounds() {
    let f = fixture();
    let capacity = 4;
    // Uneven gaps and request sizes, including idle stretches longer than a full refill.
    let steps: [(u64, u32); 12] = [
        (0, 3),
        (100, 2),
        (700, 1),
        (0, 4),
        (2_500, 2),
        (10_000, 1),
        (0, 4),
        (333, 1),
        (333, 1),
        (334, 1),
        (0, 2),
        (1_999, 3),
    ];
    for (gap, requested) in steps {
        f.clock.advance(Duration::from_millis(gap));
        f.limiter.token_bucket_limit("bounded", capacity, 1.5, requested).await.unwrap();
        let tokens: f64 = f.store.hash_field("ratelimit:bounded", "tokens").unwrap().parse().unwrap();
        assert!((0.0..=f64::from(capacity)).contains(&tokens), "tokens = {}", tokens);
    }
}

#[tokio::test]
async fn token_bucket_throughput_is_bounded() {
    let f = fixture();
    let (capacity, rate) = (10u32, 4.0);
    let mut admitted = 0u32;
    // 30s of hammering, one request every 50ms.
    for _ in 0..600 {
        if f.limiter.token_bucket_limit("hot", capacity, rate, 1).await.unwrap() {
            admitted += 1;
        }
        f.clock.advance(Duration::from_millis(50));
    }
    let bound = f64::from(capacity) + rate * 30.0;
    assert!(f64::from(admitted) <= bound, "admitted {} > {}", admitted, bound);
    // The limiter should not be wildly stricter than the bound either.
    assert!(f64::from(admitted) >= bound - 2.0, "admitted only {}", admitted);
}

#[tokio::test]
async fn token_bucket_throughput_is_bounded_for_uneven_rates() {
    let f = fixture();
    // 1000ms / 7 is not a whole number of milliseconds per token.
    let (capacity, rate) = (10u32, 7.0);
    let steps = 100_000u32;
    let mut admitted = 0u32;
    for _ in 0..steps {
        if f.limiter.token_bucket_limit("uneven", capacity, rate, 1).await.unwrap() {
            admitted += 1;
        }
        f.clock.advance(Duration::from_millis(10));
    }
    let elapsed_secs = f64::from(steps) * 0.010;
    let bound = f64::from(capacity) + rate * elapsed_secs;
    assert!(f64::from(admitted) <= bound, "admitted {} > {}", admitted, bound);
    assert!(f64::from(admitted) >= bound * 0.99, "admitted only {}", admitted);
}

#[tokio::test]
async fn oversized_durations_are_rejected_before_the_store() {
    let f = fixture();
    let err = f.limiter.fixed_window_limit("w", Duration::MAX, 1).await.unwrap_err();
    assert_eq!(err.name, "window");
    let err = f.limiter.sliding_window_limit("w", Duration::MAX, 1).await.unwrap_err();
    assert_eq!(err.name, "window");
    let err = f.limiter.token_bucket_limit("b", u32::MAX, 1e-12, 1).await.unwrap_err();
    assert_eq!(err.name, "refill_per_second");
    assert_eq!(f.store.round_trips(), 0);
}

#[tokio::test]
async fn sliding_window_admits_exactly_the_limit() {
    let f = fixture();
    let window = Duration::from_secs(10);
    let mut admitted = 0;
    for _ in 0..(7 + 5) {
        if f.limiter.sliding_window_limit("sw", window, 7).await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 7);
    assert_eq!(f.store.sorted_set_len("ratelimit:sw"), 7);

    f.clock.advance(window);
    assert!(f.limiter.sliding_window_limit("sw", window, 7).await.unwrap());
}

#[tokio::test]
async fn sliding_window_has_no_boundary_burst() {
    let f = fixture();
    let window = Duration::from_secs(1);
    // Fill the window late, then probe just after where a fixed window would reset.
    f.clock.advance(Duration::from_millis(900));
    for _ in 0..3 {
        assert!(f.limiter.sliding_window_limit("edge", window, 3).await.unwrap());
    }
    f.clock.advance(Duration::from_millis(200));
    assert!(!f.limiter.sliding_window_limit("edge", window, 3).await.unwrap());
    f.clock.advance(Duration::from_millis(800));
    assert!(f.limiter.sliding_window_limit("edge", window, 3).await.unwrap());
}

#[tokio::test]
async fn fixed_window_resets_at_boundary() {
    let f = fixture();
    let window = Duration::from_secs(60);
    for _ in 0..3 {
        assert!(f.limiter.fixed_window_limit("fw", window, 3).await.unwrap());
    }
    f.clock.advance(Duration::from_secs(59));
    assert!(!f.limiter.fixed_window_limit("fw", window, 3).await.unwrap());

    f.clock.advance(Duration::from_secs(1));
    assert!(f.limiter.fixed_window_limit("fw", window, 3).await.unwrap());
    let key = format!("ratelimit:fw:{}", T0 + 60_000);
    assert_eq!(f.store.get(&key).await.unwrap().as_deref(), Some("1"));
}

#[tokio::test]
async fn fixed_window_allows_double_limit_across_boundary() {
    let f = fixture();
    let window = Duration::from_secs(60);
    f.clock.advance(Duration::from_millis(59_990));
    for _ in 0..3 {
        assert!(f.limiter.fixed_window_limit("burst", window, 3).await.unwrap());
    }
    f.clock.advance(Duration::from_millis(20));
    for _ in 0..3 {
        assert!(f.limiter.fixed_window_limit("burst", window, 3).await.unwrap());
    }
}

#[tokio::test]
async fn reset_is_idempotent_and_forgets_state() {
    let f = fixture();
    let specs = [
        LimitSpec::token_bucket(2, 0.0).unwrap(),
        LimitSpec::sliding_window(Duration::from_secs(60), 2).unwrap(),
        LimitSpec::fixed_window(Duration::from_secs(60), 2).unwrap(),
    ];
    for spec in &specs {
        let key = format!("reset:{}", spec.algorithm());
        while f.limiter.check(&key, spec).await.unwrap() {}

        assert!(f.limiter.reset_rate_limit(&key, spec).await.unwrap());
        assert!(f.limiter.reset_rate_limit(&key, spec).await.unwrap());

        assert_eq!(f.limiter.rate_limit_info(&key, spec).await.unwrap().current, 0);
        assert!(f.limiter.check(&key, spec).await.unwrap());
        assert!(f.limiter.check(&key, spec).await.unwrap());
        assert!(!f.limiter.check(&key, spec).await.unwrap());
    }
    assert!(f.limiter.reset_rate_limit("never-used", &specs[0]).await.unwrap());
}

#[tokio::test]
async fn info_reports_occupancy_without_consuming() {
    let f = fixture();
    let bucket = LimitSpec::token_bucket(5, 1.0).unwrap();
    for _ in 0..3 {
        f.limiter.check("info", &bucket).await.unwrap();
    }
    let info = f.limiter.rate_limit_info("info", &bucket).await.unwrap();
    assert_eq!(info.algorithm, Algorithm::TokenBucket);
    assert_eq!((info.limit, info.current, info.remaining()), (5, 3, 2));
    assert_eq!(info.window_size, Duration::from_secs(5));
    assert_eq!(info.remaining_time, Duration::from_secs(3));

    f.clock.advance(Duration::from_millis(1_500));
    let info = f.limiter.rate_limit_info("info", &bucket).await.unwrap();
    assert_eq!(info.current, 2);
    assert_eq!(info.remaining_time, Duration::from_millis(1_500));
    // Reading twice changes nothing.
    assert_eq!(f.limiter.rate_limit_info("info", &bucket).await.unwrap(), info);

    let sliding = LimitSpec::sliding_window(Duration::from_secs(10), 4).unwrap();
    f.limiter.check("info-sw", &sliding).await.unwrap();
    f.clock.advance(Duration::from_secs(4));
    f.limiter.check("info-sw", &sliding).await.unwrap();
    let info = f.limiter.rate_limit_info("info-sw", &sliding).await.unwrap();
    assert_eq!((info.current, info.remaining()), (2, 2));
    assert_eq!(info.remaining_time, Duration::from_secs(6));

    let fixed = LimitSpec::fixed_window(Duration::from_secs(60), 10).unwrap();
    f.limiter.check("info-fw", &fixed).await.unwrap();
    let info = f.limiter.rate_limit_info("info-fw", &fixed).await.unwrap();
    assert_eq!(info.current, 1);
    assert_eq!(info.window_size, Duration::from_secs(60));
    // T0 + 1.5s + 4s into a minute that started at T0.
    assert_eq!(info.remaining_time, Duration::from_millis(54_500));
}

#[tokio::test]
async fn unknown_key_info_is_empty() {
    let f = fixture();
    let spec = LimitSpec::sliding_window(Duration::from_secs(1), 9).unwrap();
    let info = f.limiter.rate_limit_info("nobody", &spec).await.unwrap();
    assert_eq!(info, RateLimitInfo::empty("nobody", &spec));
    assert!(f.store.is_empty());
}

#[tokio::test]
async fn keys_are_independent() {
    let f = fixture();
    let spec = LimitSpec::fixed_window(Duration::from_secs(1), 1).unwrap();
    assert!(f.limiter.check("a", &spec).await.unwrap());
    assert!(!f.limiter.check("a", &spec).await.unwrap());
    assert!(f.limiter.check("b", &spec).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_limit() {
    let f = fixture();
    let limiter = std::sync::Arc::new(f.limiter);
    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.sliding_window_limit("shared", Duration::from_secs(60), 10).await.unwrap()
            })
        })
        .collect();
    let admitted = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count();
    assert_eq!(admitted, 10);
}
