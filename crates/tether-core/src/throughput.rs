//! Throughput accounting — a sliding-window counter of processed units.
//!
//! The hot path (`add`) is a single atomic add. A sampler task swaps the
//! accumulator to zero once per interval and publishes
//!
//!   rate = units_in_last_interval / interval_seconds
//!
//! so `rate()` always trails the live traffic by up to one interval. It
//! only feeds the pool's load-balancing heuristic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

/// Sampling interval used when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Counts {
    current: AtomicU64,
    rate: AtomicU64,
    total: AtomicU64,
    stopped: AtomicBool,
    interval: Duration,
}

impl Counts {
    fn sample(&self) -> u64 {
        if self.stopped.load(Ordering::Acquire) {
            return self.rate.load(Ordering::Relaxed);
        }
        let units = self.current.swap(0, Ordering::AcqRel);
        let millis = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX).max(1);
        let rate = units.saturating_mul(1000) / millis;
        self.rate.store(rate, Ordering::Relaxed);
        self.total.fetch_add(units, Ordering::Relaxed);
        rate
    }
}

#[derive(Debug)]
pub struct ThroughputCounter {
    counts: Arc<Counts>,
    stop: Arc<Notify>,
}

impl ThroughputCounter {
    /// A counter without a sampler. Rates only change through `sample()`.
    pub fn new(interval: Duration) -> Self {
        let interval = if interval.is_zero() { DEFAULT_INTERVAL } else { interval };
        Self {
            counts: Arc::new(Counts {
                current: AtomicU64::new(0),
                rate: AtomicU64::new(0),
                total: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                interval,
            }),
            stop: Arc::new(Notify::new()),
        }
    }

    /// A counter with a background sampler ticking every `interval`.
    /// Must be called from within a tokio runtime.
    pub fn start(interval: Duration) -> Self {
        let counter = Self::new(interval);
        tokio::spawn(run_sampler(counter.counts.clone(), counter.stop.clone()));
        counter
    }

    /// Add `n` units to the current interval. Returns the post-add value.
    pub fn add(&self, n: u64) -> u64 {
        self.counts.current.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Close the current interval now and return the resulting rate.
    /// After `stop()` this leaves every figure untouched.
    pub fn sample(&self) -> u64 {
        self.counts.sample()
    }

    /// Units per second over the last completed interval.
    pub fn rate(&self) -> u64 {
        self.counts.rate.load(Ordering::Relaxed)
    }

    /// Units accounted to completed intervals since the counter was created.
    pub fn total(&self) -> u64 {
        self.counts.total.load(Ordering::Relaxed)
    }

    /// Units accumulated in the interval still in progress.
    pub fn pending(&self) -> u64 {
        self.counts.current.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.counts.interval
    }

    /// Stop sampling. `add` keeps accumulating but the rate is frozen.
    /// Returns false if the counter was already stopped.
    pub fn stop(&self) -> bool {
        if self.counts.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        // notify_one stores a permit, so a sampler that is mid-tick still sees it.
        self.stop.notify_one();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.counts.stopped.load(Ordering::Acquire)
    }
}

impl Drop for ThroughputCounter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_sampler(counts: Arc<Counts>, stop: Arc<Notify>) {
    let period = counts.interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.notified() => {
                tracing::trace!("throughput sampler stopped");
                return;
            }
            _ = ticker.tick() => {
                counts.sample();
            }
        }
    }
}
