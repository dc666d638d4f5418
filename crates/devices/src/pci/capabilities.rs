use bitflags::bitflags;
use std::any::Any;

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;
pub const PCI_STATUS_OFFSET: usize = 0x06;
pub const PCI_CAP_PTR_OFFSET: usize = 0x34;
pub const PCI_STATUS_CAPABILITIES_LIST: u16 = 1 << 4;

pub const PCI_CAP_ID_MSI: u8 = 0x05;
pub const PCI_CAP_ID_EXPRESS: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciCapabilityInfo {
    pub id: u8,
    pub offset: u8,
}

/// A capability structure living in the config-space capability chain.
///
/// The config space owns the two header bytes (ID, next pointer). The capability owns the body:
/// `sync_from_config` picks up guest writes to the writable fields, and `sync_to_config` rewrites
/// the whole body, which restores any read-only bits the guest tried to change.
pub trait PciCapability: Any + Send {
    fn id(&self) -> u8;
    fn offset(&self) -> u8;
    fn set_offset(&mut self, offset: u8);
    fn len(&self) -> u8;

    fn sync_to_config(&self, config: &mut [u8; PCI_CONFIG_SPACE_SIZE]);
    fn sync_from_config(&mut self, config: &[u8; PCI_CONFIG_SPACE_SIZE]);

    fn as_any(&self) -> &dyn Any;
}

fn read_u16(config: &[u8; PCI_CONFIG_SPACE_SIZE], off: usize) -> u16 {
    u16::from_le_bytes([config[off], config[off + 1]])
}

fn read_u32(config: &[u8; PCI_CONFIG_SPACE_SIZE], off: usize) -> u32 {
    u32::from_le_bytes([
        config[off],
        config[off + 1],
        config[off + 2],
        config[off + 3],
    ])
}

fn write_u16(config: &mut [u8; PCI_CONFIG_SPACE_SIZE], off: usize, v: u16) {
    config[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn write_u32(config: &mut [u8; PCI_CONFIG_SPACE_SIZE], off: usize, v: u32) {
    config[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

bitflags! {
    /// MSI Message Control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsiControl: u16 {
        const ENABLE = 1 << 0;
        const MULTI_MSG_CAPABLE = 0b111 << 1;
        const MULTI_MSG_ENABLE = 0b111 << 4;
        const ADDR_64BIT = 1 << 7;
    }
}

const MSI_CTRL: usize = 0x02;
const MSI_ADDR_LO: usize = 0x04;
const MSI_ADDR_HI: usize = 0x08;
const MSI_DATA: usize = 0x0C;

/// 64-bit MSI capability without per-vector masking.
///
/// Only the declaration is modeled: the guest can program and enable it, but message delivery is
/// up to the interrupt controller emulation.
#[derive(Debug, Clone)]
pub struct MsiCapability {
    offset: u8,
    /// log2 of the number of vectors the device requests.
    mmc: u8,
    mme: u8,
    enabled: bool,
    address: u64,
    data: u16,
}

impl MsiCapability {
    /// `messages` is rounded up to a power of two and capped at 32.
    pub fn new(messages: u8) -> Self {
        let mmc = u32::from(messages.max(1))
            .next_power_of_two()
            .trailing_zeros()
            .min(5) as u8;
        Self {
            offset: 0,
            mmc,
            mme: 0,
            enabled: false,
            address: 0,
            data: 0,
        }
    }

    pub fn requested_vectors(&self) -> u8 {
        1 << self.mmc
    }

    pub fn enabled_vectors(&self) -> u8 {
        1 << self.mme
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn message_address(&self) -> u64 {
        self.address
    }

    pub fn message_data(&self) -> u16 {
        self.data
    }

    fn control(&self) -> MsiControl {
        let mut ctrl = MsiControl::ADDR_64BIT
            | MsiControl::from_bits_retain(u16::from(self.mmc) << 1)
            | MsiControl::from_bits_retain(u16::from(self.mme) << 4);
        ctrl.set(MsiControl::ENABLE, self.enabled);
        ctrl
    }
}

impl PciCapability for MsiCapability {
    fn id(&self) -> u8 {
        PCI_CAP_ID_MSI
    }

    fn offset(&self) -> u8 {
        self.offset
    }

    fn set_offset(&mut self, offset: u8) {
        self.offset = offset;
    }

    fn len(&self) -> u8 {
        14
    }

    fn sync_to_config(&self, config: &mut [u8; PCI_CONFIG_SPACE_SIZE]) {
        let base = usize::from(self.offset);
        write_u16(config, base + MSI_CTRL, self.control().bits());
        write_u32(config, base + MSI_ADDR_LO, self.address as u32);
        write_u32(config, base + MSI_ADDR_HI, (self.address >> 32) as u32);
        write_u16(config, base + MSI_DATA, self.data);
    }

    fn sync_from_config(&mut self, config: &[u8; PCI_CONFIG_SPACE_SIZE]) {
        let base = usize::from(self.offset);
        let ctrl = MsiControl::from_bits_retain(read_u16(config, base + MSI_CTRL));
        self.enabled = ctrl.contains(MsiControl::ENABLE);
        // The guest may not enable more vectors than the device asked for.
        let mme = ((ctrl & MsiControl::MULTI_MSG_ENABLE).bits() >> 4) as u8;
        self.mme = mme.min(self.mmc);

        let lo = read_u32(config, base + MSI_ADDR_LO) & !0x3;
        let hi = read_u32(config, base + MSI_ADDR_HI);
        self.address = (u64::from(hi) << 32) | u64::from(lo);
        self.data = read_u16(config, base + MSI_DATA);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// PCI Express device/port type, pre-shifted into bits 7:4 of the capabilities register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PcieDeviceType {
    Endpoint = 0x00,
    RootPort = 0x40,
    RootComplexIntegratedEndpoint = 0x90,
}

const PCIE_CAP_VERSION: u16 = 0x2;

const PCIE_CAPS: usize = 0x02;
const PCIE_DEVCTL: usize = 0x08;
const PCIE_LINKCAP: usize = 0x0C;
const PCIE_LINKCTL: usize = 0x10;
const PCIE_LINKSTS: usize = 0x12;

/// Gen1, x1.
const PCIE_LINK_GEN1_X1_CAP: u32 = 0x411;
const PCIE_LINK_GEN1_X1_STATUS: u16 = 0x11;

/// PCI Express capability (version 2 layout). Device and link control are guest writable; the
/// remaining registers are fixed.
#[derive(Debug, Clone)]
pub struct PcieCapability {
    offset: u8,
    device_type: PcieDeviceType,
    device_control: u16,
    link_control: u16,
}

impl PcieCapability {
    pub fn new(device_type: PcieDeviceType) -> Self {
        Self {
            offset: 0,
            device_type,
            device_control: 0,
            link_control: 0,
        }
    }

    pub fn device_type(&self) -> PcieDeviceType {
        self.device_type
    }

    pub fn device_control(&self) -> u16 {
        self.device_control
    }

    pub fn link_control(&self) -> u16 {
        self.link_control
    }

    fn has_link(&self) -> bool {
        self.device_type != PcieDeviceType::RootComplexIntegratedEndpoint
    }
}

impl PciCapability for PcieCapability {
    fn id(&self) -> u8 {
        PCI_CAP_ID_EXPRESS
    }

    fn offset(&self) -> u8 {
        self.offset
    }

    fn set_offset(&mut self, offset: u8) {
        self.offset = offset;
    }

    fn len(&self) -> u8 {
        0x3C
    }

    fn sync_to_config(&self, config: &mut [u8; PCI_CONFIG_SPACE_SIZE]) {
        let base = usize::from(self.offset);
        let len = usize::from(self.len());
        config[base + 2..base + len].fill(0);

        write_u16(
            config,
            base + PCIE_CAPS,
            PCIE_CAP_VERSION | self.device_type as u16,
        );
        write_u16(config, base + PCIE_DEVCTL, self.device_control);
        write_u16(config, base + PCIE_LINKCTL, self.link_control);
        if self.has_link() {
            write_u32(config, base + PCIE_LINKCAP, PCIE_LINK_GEN1_X1_CAP);
            write_u16(config, base + PCIE_LINKSTS, PCIE_LINK_GEN1_X1_STATUS);
        }
    }

    fn sync_from_config(&mut self, config: &[u8; PCI_CONFIG_SPACE_SIZE]) {
        let base = usize::from(self.offset);
        self.device_control = read_u16(config, base + PCIE_DEVCTL);
        self.link_control = read_u16(config, base + PCIE_LINKCTL);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
