//! RateLimitLayer inside a tower stack.
mod common;

use common::test_helpers::fixture;
use gatekeep::prelude::*;
use std::time::Duration;
use tower::{service_fn, ServiceBuilder, ServiceExt};

#[derive(Debug, Clone)]
struct Login {
    client_ip: &'static str,
}

#[tokio::test]
async fn limits_per_extracted_key() {
    let f = fixture();
    let spec = LimitSpec::token_bucket(2, 1.0).unwrap();
    let layer = RateLimitLayer::new(f.limiter, spec, |req: &Login| format!("login:{}", req.client_ip));
    let svc = ServiceBuilder::new()
        .layer(layer)
        .service(service_fn(|req: Login| async move { Ok::<_, std::io::Error>(req.client_ip) }));

    let a = Login { client_ip: "203.0.113.5" };
    let b = Login { client_ip: "198.51.100.7" };
    assert!(svc.clone().oneshot(a.clone()).await.is_ok());
    assert!(svc.clone().oneshot(a.clone()).await.is_ok());
    let err = svc.clone().oneshot(a.clone()).await.unwrap_err();
    assert!(matches!(err, GuardError::RateLimited { ref key } if key == "login:203.0.113.5"));
    assert!(svc.clone().oneshot(b).await.is_ok());

    f.clock.advance(Duration::from_secs(1));
    assert!(svc.oneshot(a).await.is_ok());
}

#[tokio::test]
async fn live_spec_change_takes_effect() {
    let f = fixture();
    let handle = DynamicConfig::new(LimitSpec::fixed_window(Duration::from_secs(60), 1).unwrap());
    let layer = RateLimitLayer::with_dynamic_spec(f.limiter, handle.clone(), |_: &()| "global".to_string());
    let svc = ServiceBuilder::new()
        .layer(layer)
        .service(service_fn(|()| async { Ok::<_, std::io::Error>("ok") }));

    assert!(svc.clone().oneshot(()).await.is_ok());
    assert!(svc.clone().oneshot(()).await.unwrap_err().is_rate_limited());

    handle.update(|spec| match spec {
        LimitSpec::FixedWindow { window, .. } => LimitSpec::FixedWindow { window: *window, limit: 2 },
        other => other.clone(),
    });
    assert!(svc.clone().oneshot(()).await.is_ok());
    assert!(svc.oneshot(()).await.unwrap_err().is_rate_limited());
}

#[tokio::test]
async fn outage_rejects_requests() {
    let f = fixture();
    let spec = LimitSpec::sliding_window(Duration::from_secs(1), 100).unwrap();
    let layer = RateLimitLayer::new(f.limiter, spec, |_: &u32| "k".to_string());
    let svc = ServiceBuilder::new()
        .layer(layer)
        .service(service_fn(|n: u32| async move { Ok::<_, std::io::Error>(n * 2) }));

    f.store.set_unavailable(true);
    assert!(svc.clone().oneshot(1).await.unwrap_err().is_rate_limited());
    f.store.set_unavailable(false);
    assert_eq!(svc.oneshot(21).await.unwrap(), 42);
}
