//! Virtual device emulation for a hypervisor device model.
//!
//! PCI devices are created by name from configuration lines and owned by a
//! [`pci::DeviceRegistry`], which also routes guest config-space, MMIO and port accesses to them.
//! The crate ships a chipset host bridge, a linear framebuffer (`fbuf`) and the ACPI PM timer.
//! [`vm::DeviceModel`] wires all of it together for one VM.

#![forbid(unsafe_code)]

pub mod display;
pub mod error;
pub mod fbuf;
pub mod opts;
pub mod pci;
pub mod pm_timer;
pub mod vm;

pub use error::{DeviceError, RegisterAccessError};
