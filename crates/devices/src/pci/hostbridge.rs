//! Chipset host bridge at 00:00.0: config space only, no BARs.

use super::capabilities::{PcieCapability, PcieDeviceType};
use super::config::PciConfigSpace;
use super::registry::{PciDeviceClass, PciDeviceModel, PciInitContext};
use crate::DeviceError;
use std::any::Any;

pub const PCI_CLASS_BRIDGE: u8 = 0x06;
pub const PCI_SUBCLASS_BRIDGE_HOST: u8 = 0x00;

const HOSTBRIDGE_REVISION: u8 = 0x0b;

pub struct HostBridgeClass {
    name: &'static str,
    vendor_id: u16,
    device_id: u16,
}

impl HostBridgeClass {
    pub const fn netapp() -> Self {
        Self {
            name: "hostbridge",
            vendor_id: 0x1275,
            device_id: 0x1275,
        }
    }

    pub const fn amd() -> Self {
        Self {
            name: "amd_hostbridge",
            vendor_id: 0x1022,
            device_id: 0x7432,
        }
    }
}

impl PciDeviceClass for HostBridgeClass {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(
        &self,
        ctx: &mut PciInitContext<'_>,
        options: &str,
    ) -> Result<Box<dyn PciDeviceModel>, DeviceError> {
        if !options.is_empty() {
            tracing::warn!(class = self.name, options, "host bridge options ignored");
        }

        let cfg = ctx.config();
        cfg.set_vendor_device_id(self.vendor_id, self.device_id);
        cfg.set_header_type(PciConfigSpace::HEADER_TYPE_NORMAL);
        cfg.set_class_code(
            PCI_CLASS_BRIDGE,
            PCI_SUBCLASS_BRIDGE_HOST,
            0,
            HOSTBRIDGE_REVISION,
        );
        cfg.set_subsystem_ids(0, 0);
        cfg.add_capability(Box::new(PcieCapability::new(PcieDeviceType::RootPort)));

        Ok(Box::new(HostBridge { name: self.name }))
    }
}

#[derive(Debug)]
pub struct HostBridge {
    name: &'static str,
}

impl HostBridge {
    pub fn class_name(&self) -> &'static str {
        self.name
    }
}

impl PciDeviceModel for HostBridge {
    fn as_any(&self) -> &dyn Any {
        self
    }
}
