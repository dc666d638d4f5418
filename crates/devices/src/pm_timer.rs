//! ACPI PM timer (`PM_TMR`).
//!
//! The counter runs at 3.579545 MHz and is never stored as a live integer. What is stored is the
//! monotonic instant at which the counter's lower bits next wrap (and the carry bit flips), plus
//! the current carry bit. A read converts the time left until that instant back into counts.
//!
//! A [`DeadlineTimer`] fires at each wrap instant; the expiration handler toggles the carry bit
//! and arms the next wrap one full period later. Reads and the expiration handler serialize on
//! the counter's lock, so every read sees either the pre- or post-wrap state, never a mix.
//!
//! If the expiration thread runs late, reads in the window between the wrap instant and the
//! handler observe the counter saturated at its maximum with the old carry bit. The window is
//! bounded by the host's timer latency.

use crate::DeviceError;
use dm_platform::io::{IoPortBus, PortIoDevice};
use dm_platform::time::{Clock, DeadlineTimer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const PM_TIMER_PORT: u16 = 0x408;
pub const PM_TIMER_PORT_LEN: u16 = 4;

pub const PM_TIMER_FREQUENCY_HZ: u64 = 3_579_545;
const NS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PmTimerWidth {
    #[default]
    Bits32,
    /// Legacy `TMR_VAL_EXT = 0` timer.
    Bits24,
}

impl PmTimerWidth {
    pub const fn carry_mask(self) -> u32 {
        match self {
            Self::Bits32 => 0x8000_0000,
            Self::Bits24 => 0x0080_0000,
        }
    }

    /// Mask of the bits below the carry bit; also the number of counts in one carry period.
    pub const fn no_carry_mask(self) -> u32 {
        self.carry_mask() - 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PmTimerConfig {
    pub port: u16,
    pub width: PmTimerWidth,
}

impl Default for PmTimerConfig {
    fn default() -> Self {
        Self {
            port: PM_TIMER_PORT,
            width: PmTimerWidth::Bits32,
        }
    }
}

/// Time the counter needs to advance by `counts`, rounded up to the next nanosecond.
///
/// Whole seconds are split off first so the intermediate product stays small. Rounding up makes
/// [`ns_to_counts`] an exact inverse: `ns_to_counts(counts_to_ns(c)) == c`.
pub fn counts_to_ns(counts: u32) -> u64 {
    let counts = u64::from(counts);
    let secs = counts / PM_TIMER_FREQUENCY_HZ;
    let rem = counts % PM_TIMER_FREQUENCY_HZ;
    secs * NS_PER_SEC + (rem * NS_PER_SEC).div_ceil(PM_TIMER_FREQUENCY_HZ)
}

/// Whole counts elapsed in `ns` nanoseconds.
pub fn ns_to_counts(ns: u64) -> u64 {
    (u128::from(ns) * u128::from(PM_TIMER_FREQUENCY_HZ) / u128::from(NS_PER_SEC)) as u64
}

#[derive(Debug)]
struct CounterState {
    /// Clock time at which the lower bits wrap and the carry bit flips.
    deadline_ns: u64,
    carry: bool,
}

/// The virtual counter: value derived from `(deadline, carry)` and the clock.
pub struct PmTimerCounter<C: Clock> {
    clock: C,
    width: PmTimerWidth,
    state: Mutex<CounterState>,
}

impl<C: Clock> PmTimerCounter<C> {
    /// Creates a counter reading 0 now. (ACPI leaves the boot value unspecified.)
    pub fn new(clock: C, width: PmTimerWidth) -> Self {
        let counter = Self {
            clock,
            width,
            state: Mutex::new(CounterState {
                deadline_ns: 0,
                carry: false,
            }),
        };
        counter.set(0);
        counter
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn width(&self) -> PmTimerWidth {
        self.width
    }

    /// Length of one carry period.
    pub fn period_ns(&self) -> u64 {
        counts_to_ns(self.width.no_carry_mask())
    }

    /// Loads `value` into the counter and returns the new wrap deadline.
    ///
    /// The caller is responsible for re-arming the expiration timer with the returned deadline.
    pub fn set(&self, value: u32) -> u64 {
        let mask = self.width.no_carry_mask();
        let counts_to_carry = mask - (value & mask);

        let mut state = self.lock();
        state.carry = value & self.width.carry_mask() != 0;
        state.deadline_ns = self
            .clock
            .now_ns()
            .saturating_add(counts_to_ns(counts_to_carry));
        state.deadline_ns
    }

    pub fn get(&self) -> u32 {
        let state = self.lock();
        let remaining = state.deadline_ns.saturating_sub(self.clock.now_ns());
        self.value_at(&state, remaining)
    }

    fn value_at(&self, state: &CounterState, remaining_ns: u64) -> u32 {
        let mask = self.width.no_carry_mask();
        let counts_to_carry = (ns_to_counts(remaining_ns) & u64::from(mask)) as u32;
        let value = mask - counts_to_carry;
        if state.carry {
            value | self.width.carry_mask()
        } else {
            value
        }
    }

    pub fn deadline_ns(&self) -> u64 {
        self.lock().deadline_ns
    }

    pub fn carry(&self) -> bool {
        self.lock().carry
    }

    /// Expiration handler: flips the carry bit and starts the next period from now.
    ///
    /// Returns the deadline to arm next. A call before the current deadline (spurious wake-up)
    /// changes nothing, so the carry bit flips at most once per deadline.
    pub fn expire(&self) -> u64 {
        let mut state = self.lock();
        let now = self.clock.now_ns();
        if now < state.deadline_ns {
            return state.deadline_ns;
        }

        let late_ns = now - state.deadline_ns;
        state.carry = !state.carry;
        state.deadline_ns = now.saturating_add(self.period_ns());
        tracing::debug!(
            carry = state.carry,
            late_ns,
            deadline_ns = state.deadline_ns,
            "PM timer wrapped"
        );
        state.deadline_ns
    }
}

/// A running PM timer: the counter plus the thread that services its wrap deadlines.
///
/// Dropping it stops and joins the expiration thread before the counter can be freed.
pub struct PmTimer<C: Clock> {
    counter: Arc<PmTimerCounter<C>>,
    timer: DeadlineTimer,
}

impl<C: Clock + Clone> PmTimer<C> {
    pub fn start(clock: C, width: PmTimerWidth) -> Result<Self, DeviceError> {
        let counter = Arc::new(PmTimerCounter::new(clock.clone(), width));

        let handler_counter = Arc::clone(&counter);
        let timer = DeadlineTimer::spawn("pm-timer", clock, move |_now| {
            Some(handler_counter.expire())
        })?;
        timer.arm(counter.deadline_ns());

        tracing::info!(?width, period_ns = counter.period_ns(), "PM timer started");
        Ok(Self { counter, timer })
    }
}

impl<C: Clock> PmTimer<C> {
    pub fn counter(&self) -> &Arc<PmTimerCounter<C>> {
        &self.counter
    }

    pub fn read(&self) -> u32 {
        self.counter.get()
    }

    /// Reloads the counter and re-arms the wrap deadline.
    pub fn set(&self, value: u32) {
        let deadline = self.counter.set(value);
        self.timer.arm(deadline);
    }

    /// Makes the expiration thread re-check the clock (for clocks that jump).
    pub fn kick(&self) {
        self.timer.kick();
    }
}

/// `PM_TMR` port binding. Read-only: guest writes are logged and dropped.
pub struct PmTimerPort<C: Clock> {
    counter: Arc<PmTimerCounter<C>>,
    base: u16,
}

impl<C: Clock> PmTimerPort<C> {
    pub fn new(counter: Arc<PmTimerCounter<C>>, base: u16) -> Self {
        Self { counter, base }
    }
}

impl<C: Clock> PortIoDevice for PmTimerPort<C> {
    /// Bytes past the end of the register float high.
    fn read(&self, port: u16, size: u8) -> u32 {
        let offset = usize::from(port.wrapping_sub(self.base));
        let size = usize::from(size).min(4);
        if offset + size > usize::from(PM_TIMER_PORT_LEN) {
            tracing::warn!(port, size, "PM timer read runs past the end of the port");
        }

        let counter = self.counter.get().to_le_bytes();
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().take(size).enumerate() {
            *byte = counter.get(offset + i).copied().unwrap_or(0xFF);
        }
        u32::from_le_bytes(bytes)
    }

    fn write(&self, port: u16, size: u8, value: u32) {
        tracing::warn!(port, size, value, "write to read-only PM timer port ignored");
    }
}

/// Exposes `timer` on the port bus at `cfg.port`.
pub fn register_pm_timer<C: Clock>(
    bus: &mut IoPortBus,
    cfg: &PmTimerConfig,
    timer: &PmTimer<C>,
) -> Result<(), DeviceError> {
    bus.register_range(
        cfg.port,
        PM_TIMER_PORT_LEN,
        Box::new(PmTimerPort::new(Arc::clone(timer.counter()), cfg.port)),
    )?;
    Ok(())
}
