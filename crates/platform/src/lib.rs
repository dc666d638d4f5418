#![forbid(unsafe_code)]

//! Platform seams shared by the emulated devices: port I/O routing, host-backed guest memory
//! mappings, and time (clocks plus a one-shot deadline timer).

pub mod io;
pub mod memory;
pub mod time;
