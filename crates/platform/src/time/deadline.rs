use super::Clock;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Default)]
struct TimerState {
    deadline_ns: Option<u64>,
    /// Bumped by every `arm`/`disarm` so a callback's returned deadline cannot clobber a newer
    /// one armed while the callback was running.
    generation: u64,
    /// Bumped by every `kick`; a clock sample taken before a kick is discarded.
    kicks: u64,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One-shot deadline timer with a dedicated expiration thread.
///
/// When the clock reaches the armed deadline the timer disarms itself and invokes the callback
/// with the observed time; if the callback returns `Some(next)`, `next` becomes the new deadline.
/// The callback runs without the timer's internal lock held.
///
/// Dropping the timer cancels it and joins the thread, so once `drop` returns no callback is
/// running or will run again.
pub struct DeadlineTimer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    pub fn spawn<C, F>(name: &str, clock: C, mut on_expire: F) -> Result<Self, TimerError>
    where
        C: Clock,
        F: FnMut(u64) -> Option<u64> + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&thread_shared, &clock, &mut on_expire))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Arms (or re-arms) the timer for the absolute clock time `deadline_ns`.
    pub fn arm(&self, deadline_ns: u64) {
        let mut state = self.shared.lock();
        state.deadline_ns = Some(deadline_ns);
        state.generation = state.generation.wrapping_add(1);
        self.shared.cond.notify_all();
    }

    pub fn disarm(&self) {
        let mut state = self.shared.lock();
        state.deadline_ns = None;
        state.generation = state.generation.wrapping_add(1);
        self.shared.cond.notify_all();
    }

    pub fn deadline_ns(&self) -> Option<u64> {
        self.shared.lock().deadline_ns
    }

    /// Makes the timer thread re-sample its clock now.
    ///
    /// The thread sleeps for the host-time distance to the deadline; a clock that jumps (e.g.
    /// [`super::ManualClock`]) needs a kick for the jump to be observed immediately.
    pub fn kick(&self) {
        let mut state = self.shared.lock();
        state.kicks = state.kicks.wrapping_add(1);
        self.shared.cond.notify_all();
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.cancelled = true;
            state.deadline_ns = None;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("deadline timer thread panicked");
            }
        }
    }
}

fn run<C: Clock>(shared: &Shared, clock: &C, on_expire: &mut dyn FnMut(u64) -> Option<u64>) {
    let mut state = shared.lock();
    loop {
        if state.cancelled {
            return;
        }

        let Some(deadline) = state.deadline_ns else {
            state = shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        };

        // Sampled unlocked so `kick` never waits on a clock read. A sample that raced with a state
        // change is stale.
        let (generation, kicks) = (state.generation, state.kicks);
        drop(state);
        let now = clock.now_ns();
        state = shared.lock();
        if state.cancelled || state.generation != generation || state.kicks != kicks {
            continue;
        }

        if now < deadline {
            let wait = Duration::from_nanos(deadline - now);
            state = shared
                .cond
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }

        state.deadline_ns = None;
        drop(state);

        let next = on_expire(now);

        state = shared.lock();
        if state.generation == generation && !state.cancelled {
            state.deadline_ns = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ManualClock, MonotonicClock};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Manual clock whose next read can be held after the time has been sampled.
    #[derive(Clone, Default)]
    struct GatedClock {
        inner: ManualClock,
        gate: Arc<(Mutex<Gate>, Condvar)>,
    }

    #[derive(Default)]
    struct Gate {
        hold: bool,
        parked: bool,
    }

    impl GatedClock {
        fn hold_next_read(&self) {
            self.gate.0.lock().unwrap().hold = true;
        }

        fn wait_parked(&self) -> bool {
            let (lock, cond) = &*self.gate;
            let gate = lock.lock().unwrap();
            let (gate, _) = cond
                .wait_timeout_while(gate, Duration::from_secs(5), |g| !g.parked)
                .unwrap();
            gate.parked
        }

        fn release(&self) {
            let (lock, cond) = &*self.gate;
            let mut gate = lock.lock().unwrap();
            gate.hold = false;
            gate.parked = false;
            cond.notify_all();
        }
    }

    impl Clock for GatedClock {
        fn now_ns(&self) -> u64 {
            let now = self.inner.now_ns();
            let (lock, cond) = &*self.gate;
            let mut gate = lock.lock().unwrap();
            if gate.hold {
                gate.parked = true;
                cond.notify_all();
                while gate.hold {
                    gate = cond.wait(gate).unwrap();
                }
            }
            now
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn fires_once_per_armed_deadline() {
        let clock = MonotonicClock::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = DeadlineTimer::spawn("test-timer", clock, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

        timer.arm(clock.now_ns() + 2_000_000);
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1));
        assert_eq!(timer.deadline_ns(), None);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_return_value_rearms() {
        let clock = MonotonicClock::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = DeadlineTimer::spawn("test-timer", clock, move |now| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            (n < 3).then_some(now + 1_000_000)
        })
        .unwrap();

        timer.arm(clock.now_ns());
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 3));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn kick_observes_manual_clock_jumps() {
        let clock = ManualClock::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = DeadlineTimer::spawn("test-timer", clock.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

        // An hour away in manual time; nothing happens until the clock gets there.
        timer.arm(3_600_000_000_000);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.advance(3_600_000_000_000);
        timer.kick();
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn kick_between_clock_sample_and_sleep_is_not_lost() {
        let clock = GatedClock::default();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = DeadlineTimer::spawn("test-timer", clock.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

        // The thread samples `0` and is held before it can go to sleep for 600 s.
        clock.hold_next_read();
        timer.arm(600_000_000_000);
        assert!(clock.wait_parked());

        clock.inner.advance(600_000_000_000);
        timer.kick();
        clock.release();

        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn drop_joins_and_cancels_pending_deadline() {
        let clock = MonotonicClock::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = DeadlineTimer::spawn("test-timer", clock, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

        timer.arm(clock.now_ns() + 50_000_000);
        drop(timer);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disarm_prevents_expiration() {
        let clock = MonotonicClock::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = DeadlineTimer::spawn("test-timer", clock, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

        timer.arm(clock.now_ns() + 30_000_000);
        timer.disarm();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
