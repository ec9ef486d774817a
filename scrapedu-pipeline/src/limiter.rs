//! Per-host rate limiter shared by every worker.
//!
//! Each host owns an async mutex holding the instant of its last grant. The
//! host table lock is only held to look the entry up, so hosts never wait on
//! each other. Callers for the same host queue on the host mutex and are
//! spaced by `min_interval(host) + U[0, jitter]`. The first request for a
//! host is granted immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

type HostSlot = Arc<tokio::sync::Mutex<Option<Instant>>>;

#[derive(Debug)]
pub struct RateLimiter {
    default_interval: Duration,
    jitter: Duration,
    overrides: Mutex<HashMap<String, Duration>>,
    slots: Mutex<HashMap<String, HostSlot>>,
    grants: AtomicU64,
}

impl RateLimiter {
    pub fn new(default_interval: Duration, jitter: Duration) -> Self {
        Self {
            default_interval,
            jitter,
            overrides: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            grants: AtomicU64::new(0),
        }
    }

    /// Limiter with configured per-host overrides.
    pub fn with_hosts<I>(default_interval: Duration, jitter: Duration, hosts: I) -> Self
    where
        I: IntoIterator<Item = (String, Duration)>,
    {
        let limiter = Self::new(default_interval, jitter);
        for (host, interval) in hosts {
            limiter.set_min_interval(&host, interval);
        }
        limiter
    }

    /// Wait until `host` may be contacted again, then record the grant.
    pub async fn acquire(&self, host: &str) {
        let host = host.to_ascii_lowercase();
        let slot = self.slot(&host);
        let mut last = slot.lock().await;
        if let Some(prev) = *last {
            let gap = self.min_interval(&host) + self.sample_jitter();
            let ready = prev + gap;
            if ready > Instant::now() {
                tracing::trace!(%host, wait_ms = (ready - Instant::now()).as_millis() as u64, "rate limited");
                tokio::time::sleep_until(ready).await;
            }
        }
        *last = Some(Instant::now());
        self.grants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn min_interval(&self, host: &str) -> Duration {
        self.overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Override the interval for `host`, e.g. from a robots `Crawl-delay`.
    pub fn set_min_interval(&self, host: &str, interval: Duration) {
        let host = host.to_ascii_lowercase();
        tracing::debug!(%host, interval_ms = interval.as_millis() as u64, "host interval set");
        self.overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host, interval);
    }

    /// Total grants since creation.
    pub fn grants(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    fn slot(&self, host: &str) -> HostSlot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(host.to_string()).or_default())
    }

    fn sample_jitter(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random_range(0..=max))
        }
    }
}
