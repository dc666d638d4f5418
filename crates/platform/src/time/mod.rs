//! Time sources and deadline timers used by emulated devices.
//!
//! # Design
//!
//! Devices never simulate time continuously. A device derives its guest-visible state from
//! [`Clock::now_ns`] at access time, and arms a [`DeadlineTimer`] for the next instant at which
//! that derivation changes discontinuously (e.g. a counter carry). The timer fires on its own
//! thread; its callback returns the next deadline, so periodic behavior is a chain of one-shot
//! deadlines.
//!
//! [`MonotonicClock`] follows host monotonic time. [`ManualClock`] only moves when told to, which
//! lets tests cover minutes of guest time instantly.

mod clock;
mod deadline;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use deadline::{DeadlineTimer, TimerError};
