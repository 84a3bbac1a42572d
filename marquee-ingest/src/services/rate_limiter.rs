//! Shared rate limiter for one external source
//!
//! A `governor` token bucket sits behind a `tokio::sync::Mutex` ticket gate.
//! The mutex queues waiters in arrival order, so a burst of concurrent
//! resolutions is admitted first-come first-served instead of racing for
//! each freed token. One instance is shared (via `Arc`) by every worker that
//! calls the same source.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct SourceRateLimiter {
    name: String,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    gate: Mutex<()>,
}

impl SourceRateLimiter {
    /// `requests_per_second` and `burst` are clamped to at least 1
    pub fn new(name: impl Into<String>, requests_per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            name: name.into(),
            limiter: RateLimiter::direct(quota),
            gate: Mutex::new(()),
        }
    }

    /// Block until this caller may issue one request
    pub async fn acquire(&self) {
        let started = Instant::now();
        let _ticket = self.gate.lock().await;
        self.limiter.until_ready().await;

        let waited = started.elapsed();
        if waited > Duration::from_millis(500) {
            tracing::debug!(
                source = %self.name,
                waited_ms = waited.as_millis() as u64,
                "Rate limiter delayed request"
            );
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
