//! PCI core: configuration space, BAR resources and the device registry.

pub mod capabilities;
pub mod config;
pub mod hostbridge;
pub mod registry;

mod bar_table;
mod resources;

pub use bar_table::{BarEntry, BarSpace, BarTable};
pub use capabilities::{MsiCapability, PcieCapability, PcieDeviceType};
pub use config::{PciBarDefinition, PciBarKind, PciBarRange, PciConfigSpace};
pub use registry::{DeviceRegistry, PciDeviceClass, PciDeviceModel, PciInitContext};
pub use resources::{PciResourceAllocator, PciResourceAllocatorConfig, PciResourceError};

use std::fmt;

/// PCI bus/device/function identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    pub const MAX_DEVICES: u8 = 32;

    /// The caller keeps `device < 32` and `function < 8`.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}
