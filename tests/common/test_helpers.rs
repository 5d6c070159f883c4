#![allow(dead_code)]

use gatekeep::prelude::*;

/// Start of a whole minute, so fixed windows up to 60s begin exactly here.
pub const T0: u64 = 1_700_000_040_000;

/// Limiter, lock and store sharing one manual clock.
pub struct Fixture {
    pub store: InMemoryStore,
    pub clock: ManualClock,
    pub limiter: RateLimiter<InMemoryStore>,
    pub lock: DistributedLock<InMemoryStore>,
}

pub fn fixture() -> Fixture {
    let clock = ManualClock::new(T0);
    let store = InMemoryStore::with_clock(clock.clone());
    let limiter = RateLimiter::new(store.clone()).with_clock(clock.clone());
    let lock = DistributedLock::new(store.clone());
    Fixture { store, clock, limiter, lock }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
