use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic time source, in nanoseconds since an arbitrary origin.
pub trait Clock: Send + Sync + 'static {
    fn now_ns(&self) -> u64;
}

/// Host monotonic time (`CLOCK_MONOTONIC`), relative to the instant the clock was created.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock. Clones share the same timeline.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now_ns: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now_ns: u64) -> Self {
        Self {
            now_ns: Arc::new(AtomicU64::new(now_ns)),
        }
    }

    /// Advances the clock by `ns` nanoseconds.
    ///
    /// # Panics
    ///
    /// Panics if advancing would overflow `u64`. (`u64` nanoseconds is ~584 years.)
    pub fn advance(&self, ns: u64) {
        let prev = self.now_ns.fetch_add(ns, Ordering::SeqCst);
        assert!(prev.checked_add(ns).is_some(), "manual clock overflowed u64::MAX");
    }

    /// Sets the current time. May move time backwards.
    pub fn set_now_ns(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}
