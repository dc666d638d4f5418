use super::capabilities::{
    PciCapability, PciCapabilityInfo, PCI_CAP_PTR_OFFSET, PCI_CONFIG_SPACE_SIZE,
    PCI_STATUS_CAPABILITIES_LIST, PCI_STATUS_OFFSET,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciVendorDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciClassCode {
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision_id: u8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PciBarKind {
    Io,
    Mmio32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PciBarDefinition {
    Io { size: u32 },
    Mmio32 { size: u32, prefetchable: bool },
}

impl PciBarDefinition {
    pub fn kind(&self) -> PciBarKind {
        match self {
            Self::Io { .. } => PciBarKind::Io,
            Self::Mmio32 { .. } => PciBarKind::Mmio32,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Io { size } | Self::Mmio32 { size, .. } => u64::from(*size),
        }
    }

    /// Smallest size the BAR register encoding can express.
    pub fn min_size(&self) -> u64 {
        match self {
            Self::Io { .. } => 4,
            Self::Mmio32 { .. } => 16,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciBarRange {
    pub kind: PciBarKind,
    pub base: u64,
    pub size: u64,
}

impl PciBarRange {
    pub fn end_exclusive(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end_exclusive()
    }
}

#[derive(Debug, Clone, Default)]
struct PciBarState {
    def: Option<PciBarDefinition>,
    base: u64,
    probe: bool,
}

impl PciBarState {
    fn range(&self) -> Option<PciBarRange> {
        let def = self.def?;
        Some(PciBarRange {
            kind: def.kind(),
            base: self.base,
            size: def.size(),
        })
    }
}

/// PCI configuration space for a type 0 header.
///
/// Supports:
/// - 256-byte config reads/writes with the header's read-only fields protected
/// - the capability list (MSI, PCI Express)
/// - BAR size probing (write `0xFFFF_FFFF`, read back the size mask)
///
/// BAR addresses are assigned once by the resource allocator. A guest write of anything other
/// than the probe pattern ends probing and leaves the assigned base in place.
pub struct PciConfigSpace {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    capabilities: Vec<Box<dyn PciCapability>>,
    next_cap_offset: u8,
    last_cap_offset: Option<u8>,
    bars: [PciBarState; 6],
}

impl PciConfigSpace {
    pub const HEADER_TYPE_OFFSET: u16 = 0x0E;
    pub const INTERRUPT_LINE_OFFSET: u16 = 0x3C;
    pub const INTERRUPT_PIN_OFFSET: u16 = 0x3D;

    pub const HEADER_TYPE_NORMAL: u8 = 0x00;

    const BAR0_OFFSET: usize = 0x10;
    const BAR_END: usize = 0x28;

    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut cfg = Self {
            bytes: [0u8; PCI_CONFIG_SPACE_SIZE],
            capabilities: Vec::new(),
            next_cap_offset: 0x40,
            last_cap_offset: None,
            bars: Default::default(),
        };
        cfg.set_vendor_device_id(vendor_id, device_id);
        cfg
    }

    pub fn vendor_device_id(&self) -> PciVendorDeviceId {
        PciVendorDeviceId {
            vendor_id: u16::from_le_bytes([self.bytes[0x00], self.bytes[0x01]]),
            device_id: u16::from_le_bytes([self.bytes[0x02], self.bytes[0x03]]),
        }
    }

    /// Device-side identity setup; the guest cannot change these bytes.
    pub fn set_vendor_device_id(&mut self, vendor_id: u16, device_id: u16) {
        self.bytes[0x00..0x02].copy_from_slice(&vendor_id.to_le_bytes());
        self.bytes[0x02..0x04].copy_from_slice(&device_id.to_le_bytes());
    }

    pub fn class_code(&self) -> PciClassCode {
        PciClassCode {
            revision_id: self.bytes[0x08],
            prog_if: self.bytes[0x09],
            subclass: self.bytes[0x0a],
            class: self.bytes[0x0b],
        }
    }

    pub fn set_class_code(&mut self, class: u8, subclass: u8, prog_if: u8, revision_id: u8) {
        self.bytes[0x08] = revision_id;
        self.bytes[0x09] = prog_if;
        self.bytes[0x0a] = subclass;
        self.bytes[0x0b] = class;
    }

    pub fn subsystem_ids(&self) -> (u16, u16) {
        (
            u16::from_le_bytes([self.bytes[0x2c], self.bytes[0x2d]]),
            u16::from_le_bytes([self.bytes[0x2e], self.bytes[0x2f]]),
        )
    }

    pub fn set_subsystem_ids(&mut self, subsystem_vendor_id: u16, subsystem_id: u16) {
        self.bytes[0x2c..0x2e].copy_from_slice(&subsystem_vendor_id.to_le_bytes());
        self.bytes[0x2e..0x30].copy_from_slice(&subsystem_id.to_le_bytes());
    }

    pub fn header_type(&self) -> u8 {
        self.bytes[usize::from(Self::HEADER_TYPE_OFFSET)]
    }

    pub fn set_header_type(&mut self, header_type: u8) {
        self.bytes[usize::from(Self::HEADER_TYPE_OFFSET)] = header_type;
    }

    pub fn command(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0x04], self.bytes[0x05]])
    }

    pub fn status(&self) -> u16 {
        u16::from_le_bytes([
            self.bytes[PCI_STATUS_OFFSET],
            self.bytes[PCI_STATUS_OFFSET + 1],
        ])
    }

    /// Declares BAR `index` and assigns its base address.
    ///
    /// # Panics
    ///
    /// Panics if `index >= 6`.
    pub fn set_bar(&mut self, index: u8, def: PciBarDefinition, base: u64) {
        let index = usize::from(index);
        assert!(index < self.bars.len(), "BAR index {index} out of range");

        self.bars[index] = PciBarState {
            def: Some(def),
            base,
            probe: false,
        };
        let off = Self::BAR0_OFFSET + index * 4;
        self.bytes[off..off + 4].copy_from_slice(&Self::bar_value(def, base).to_le_bytes());
    }

    pub fn bar_definition(&self, index: u8) -> Option<PciBarDefinition> {
        self.bars.get(usize::from(index)).and_then(|bar| bar.def)
    }

    pub fn bar_range(&self, index: u8) -> Option<PciBarRange> {
        self.bars
            .get(usize::from(index))
            .and_then(|bar| bar.range())
    }

    /// Appends a capability to the chain and returns its offset.
    ///
    /// # Panics
    ///
    /// Panics if the capability does not fit in the remaining config space.
    pub fn add_capability(&mut self, mut capability: Box<dyn PciCapability>) -> u8 {
        let offset = self.allocate_capability_offset(capability.len());
        capability.set_offset(offset);

        let base = usize::from(offset);
        self.bytes[base] = capability.id();
        self.bytes[base + 1] = 0;

        match self.last_cap_offset {
            Some(prev) => self.bytes[usize::from(prev) + 1] = offset,
            None => {
                self.bytes[PCI_CAP_PTR_OFFSET] = offset;
                let status = self.status() | PCI_STATUS_CAPABILITIES_LIST;
                self.bytes[PCI_STATUS_OFFSET..PCI_STATUS_OFFSET + 2]
                    .copy_from_slice(&status.to_le_bytes());
            }
        }

        self.last_cap_offset = Some(offset);
        capability.sync_to_config(&mut self.bytes);
        self.capabilities.push(capability);

        offset
    }

    /// Guest config read. Accesses that are not 1/2/4 bytes or run past the end read all ones.
    pub fn read(&mut self, offset: u16, size: usize) -> u32 {
        let offset = usize::from(offset);
        if !matches!(size, 1 | 2 | 4) || offset + size > PCI_CONFIG_SPACE_SIZE {
            tracing::warn!(offset, size, "invalid PCI config read");
            return 0xFFFF_FFFF;
        }

        self.sync_capabilities_to_config();

        if (Self::BAR0_OFFSET..Self::BAR_END).contains(&offset) {
            let aligned = offset & !0x3;
            let value = self.read_bar_register((aligned - Self::BAR0_OFFSET) / 4);
            let shifted = value >> ((offset - aligned) * 8);
            return shifted & size_mask(size);
        }

        (0..size).fold(0u32, |value, i| {
            value | (u32::from(self.bytes[offset + i]) << (8 * i))
        })
    }

    /// Guest config write. Read-only bytes are preserved; invalid accesses are dropped.
    pub fn write(&mut self, offset: u16, size: usize, value: u32) {
        let offset = usize::from(offset);
        if !matches!(size, 1 | 2 | 4) || offset + size > PCI_CONFIG_SPACE_SIZE {
            tracing::warn!(offset, size, value, "invalid PCI config write");
            return;
        }

        if (Self::BAR0_OFFSET..Self::BAR_END).contains(&offset) {
            if offset & 0x3 != 0 || size != 4 {
                tracing::debug!(offset, size, "ignoring partial BAR write");
                return;
            }
            self.write_bar_register((offset - Self::BAR0_OFFSET) / 4, value);
            return;
        }

        // Device-managed capability state must be in the byte image before merging the write.
        self.sync_capabilities_to_config();

        for i in 0..size {
            let addr = offset + i;
            if self.is_read_only_byte(addr) {
                continue;
            }
            self.bytes[addr] = (value >> (8 * i)) as u8;
        }

        self.sync_capabilities_from_config();
        self.sync_capabilities_to_config();
    }

    pub fn capability_list(&mut self) -> Vec<PciCapabilityInfo> {
        self.sync_capabilities_to_config();

        let mut caps = Vec::new();
        let mut offset = self.bytes[PCI_CAP_PTR_OFFSET];
        let mut seen = [false; PCI_CONFIG_SPACE_SIZE];

        while offset != 0 {
            let off = usize::from(offset);
            if off + 1 >= PCI_CONFIG_SPACE_SIZE || seen[off] {
                break;
            }
            seen[off] = true;

            caps.push(PciCapabilityInfo {
                id: self.bytes[off],
                offset,
            });
            offset = self.bytes[off + 1];
        }

        caps
    }

    pub fn find_capability(&mut self, id: u8) -> Option<u8> {
        self.capability_list()
            .into_iter()
            .find(|cap| cap.id == id)
            .map(|cap| cap.offset)
    }

    pub fn capability<T: 'static>(&self) -> Option<&T> {
        self.capabilities
            .iter()
            .find_map(|cap| cap.as_any().downcast_ref::<T>())
    }

    fn allocate_capability_offset(&mut self, len: u8) -> u8 {
        let offset = self.next_cap_offset;
        let next = (usize::from(offset) + usize::from(len) + 3) & !3;
        assert!(
            next <= PCI_CONFIG_SPACE_SIZE,
            "PCI capability list overflows config space"
        );
        // A full 256-byte space leaves nothing for later capabilities; 0 terminates the chain.
        self.next_cap_offset = u8::try_from(next).unwrap_or(0);
        offset
    }

    fn sync_capabilities_to_config(&mut self) {
        for cap in &self.capabilities {
            cap.sync_to_config(&mut self.bytes);
        }
    }

    fn sync_capabilities_from_config(&mut self) {
        for cap in &mut self.capabilities {
            cap.sync_from_config(&self.bytes);
        }
    }

    fn is_read_only_byte(&self, addr: usize) -> bool {
        // Vendor/device ID.
        if addr < 0x04 {
            return true;
        }
        // Status: guests write Command with 32-bit stores and zero upper halves.
        if (PCI_STATUS_OFFSET..PCI_STATUS_OFFSET + 2).contains(&addr) {
            return true;
        }
        // Revision ID / class code.
        if (0x08..=0x0B).contains(&addr) {
            return true;
        }
        if addr == usize::from(Self::HEADER_TYPE_OFFSET) {
            return true;
        }
        // Subsystem IDs.
        if (0x2C..0x30).contains(&addr) {
            return true;
        }
        if addr == PCI_CAP_PTR_OFFSET || addr == usize::from(Self::INTERRUPT_PIN_OFFSET) {
            return true;
        }

        self.capabilities.iter().any(|cap| {
            let base = usize::from(cap.offset());
            addr == base || addr == base + 1
        })
    }

    fn bar_value(def: PciBarDefinition, base: u64) -> u32 {
        match def {
            PciBarDefinition::Io { .. } => (base as u32 & 0xFFFF_FFFC) | 0x1,
            PciBarDefinition::Mmio32 { prefetchable, .. } => {
                let mut val = base as u32 & 0xFFFF_FFF0;
                if prefetchable {
                    val |= 1 << 3;
                }
                val
            }
        }
    }

    fn read_bar_register(&self, bar_index: usize) -> u32 {
        let bar = &self.bars[bar_index];
        let Some(def) = bar.def else {
            return 0;
        };

        if !bar.probe {
            return Self::bar_value(def, bar.base);
        }

        let size = def.size() as u32;
        match def {
            PciBarDefinition::Io { .. } => (!(size.saturating_sub(1)) & 0xFFFF_FFFC) | 0x1,
            PciBarDefinition::Mmio32 { prefetchable, .. } => {
                let mut mask = !(size.saturating_sub(1)) & 0xFFFF_FFF0;
                if prefetchable {
                    mask |= 1 << 3;
                }
                mask
            }
        }
    }

    fn write_bar_register(&mut self, bar_index: usize, value: u32) {
        let bar = &mut self.bars[bar_index];
        if bar.def.is_none() {
            return;
        }

        if value == 0xFFFF_FFFF {
            bar.probe = true;
            return;
        }

        bar.probe = false;
        if u64::from(value & 0xFFFF_FFF0) != bar.base & 0xFFFF_FFF0 {
            tracing::debug!(
                bar = bar_index,
                value,
                base = bar.base,
                "guest BAR relocation ignored"
            );
        }
    }
}

fn size_mask(size: usize) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::capabilities::{MsiCapability, PcieCapability, PcieDeviceType, PCI_CAP_ID_MSI};

    fn fbuf_like() -> PciConfigSpace {
        let mut cfg = PciConfigSpace::new(0xFB5D, 0x40FB);
        cfg.set_class_code(0x03, 0x00, 0, 0);
        cfg.set_bar(
            0,
            PciBarDefinition::Mmio32 {
                size: 0x80,
                prefetchable: false,
            },
            0xE000_0000,
        );
        cfg.set_bar(1, PciBarDefinition::Io { size: 0x10 }, 0x1000);
        cfg
    }

    #[test]
    fn identity_bytes_are_read_only() {
        let mut cfg = fbuf_like();
        cfg.write(0x00, 4, 0xDEAD_BEEF);
        cfg.write(0x08, 4, 0xFFFF_FFFF);
        cfg.write(0x0E, 1, 0x80);

        assert_eq!(cfg.read(0x00, 2), 0xFB5D);
        assert_eq!(cfg.read(0x02, 2), 0x40FB);
        assert_eq!(cfg.read(0x0B, 1), 0x03);
        assert_eq!(cfg.header_type(), PciConfigSpace::HEADER_TYPE_NORMAL);
    }

    #[test]
    fn dword_write_to_command_does_not_clobber_status() {
        let mut cfg = fbuf_like();
        cfg.add_capability(Box::new(MsiCapability::new(1)));
        let status = cfg.status();
        assert_ne!(status & PCI_STATUS_CAPABILITIES_LIST, 0);

        cfg.write(0x04, 4, 0x0000_0007);
        assert_eq!(cfg.command(), 0x0007);
        assert_eq!(cfg.status(), status);
    }

    #[test]
    fn bar_probe_reports_size_mask_and_keeps_base() {
        let mut cfg = fbuf_like();

        cfg.write(0x10, 4, 0xFFFF_FFFF);
        assert_eq!(cfg.read(0x10, 4), 0xFFFF_FF80);
        cfg.write(0x14, 4, 0xFFFF_FFFF);
        assert_eq!(cfg.read(0x14, 4), 0xFFFF_FFF1);

        // Restoring (or relocating) ends the probe; the allocator's base stays.
        cfg.write(0x10, 4, 0xF000_0000);
        assert_eq!(cfg.read(0x10, 4), 0xE000_0000);
        assert_eq!(cfg.bar_range(0).unwrap().base, 0xE000_0000);
        assert_eq!(cfg.read(0x12, 2), 0xE000);
    }

    #[test]
    fn undefined_bars_read_zero() {
        let mut cfg = fbuf_like();
        cfg.write(0x18, 4, 0xFFFF_FFFF);
        assert_eq!(cfg.read(0x18, 4), 0);
        assert!(cfg.bar_range(2).is_none());
    }

    #[test]
    fn capability_chain_is_linked_in_insertion_order() {
        let mut cfg = fbuf_like();
        let msi = cfg.add_capability(Box::new(MsiCapability::new(4)));
        let pcie = cfg.add_capability(Box::new(PcieCapability::new(PcieDeviceType::RootPort)));

        assert_eq!(msi, 0x40);
        assert_eq!(pcie, 0x50);
        assert_eq!(cfg.read(0x34, 1), 0x40);
        assert_eq!(cfg.read(0x41, 1), 0x50);
        assert_eq!(cfg.read(0x51, 1), 0x00);
        assert_eq!(cfg.find_capability(PCI_CAP_ID_MSI), Some(0x40));

        // Guests cannot rewrite the chain.
        cfg.write(0x40, 2, 0x0000);
        assert_eq!(cfg.capability_list().len(), 2);
    }

    #[test]
    fn msi_programming_reaches_the_capability() {
        let mut cfg = fbuf_like();
        let off = u16::from(cfg.add_capability(Box::new(MsiCapability::new(4))));

        cfg.write(off + 4, 4, 0xFEE0_0000);
        cfg.write(off + 8, 4, 0);
        cfg.write(off + 12, 2, 0x0041);
        cfg.write(off + 2, 2, 0x0001);

        let msi = cfg.capability::<MsiCapability>().unwrap();
        assert!(msi.enabled());
        assert_eq!(msi.message_address(), 0xFEE0_0000);
        assert_eq!(msi.message_data(), 0x0041);
        assert_eq!(cfg.read(off + 2, 2), 0x0085);
    }

    #[test]
    fn invalid_accesses_do_not_panic() {
        let mut cfg = fbuf_like();
        assert_eq!(cfg.read(0xFE, 4), 0xFFFF_FFFF);
        assert_eq!(cfg.read(0x00, 3), 0xFFFF_FFFF);
        cfg.write(0xFF, 2, 0xFFFF);
        cfg.write(0x12, 2, 0xFFFF);
        assert_eq!(cfg.read(0x10, 4), 0xE000_0000);
    }
}
