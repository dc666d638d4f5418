use super::config::{PciBarDefinition, PciBarKind, PciBarRange};
use super::PciBdf;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct PciResourceAllocatorConfig {
    /// Base address of the 32-bit MMIO window reserved for PCI BAR allocation.
    pub mmio_base: u64,
    pub mmio_size: u64,
    /// Base port of the I/O window reserved for PCI BAR allocation.
    pub io_base: u32,
    pub io_size: u32,
}

impl Default for PciResourceAllocatorConfig {
    fn default() -> Self {
        // I/O stays clear of the legacy 0x0000..0x0FFF range (PM timer, PIC, ...). MMIO sits high
        // in the 32-bit space, below the local APIC/IOAPIC.
        Self {
            mmio_base: 0xE000_0000,
            mmio_size: 0x1000_0000,
            io_base: 0x1000,
            io_size: 0xE000,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum PciResourceError {
    #[error("32-bit MMIO window exhausted")]
    OutOfMmioSpace,

    #[error("PCI I/O window exhausted")]
    OutOfIoSpace,

    #[error("BAR size {size:#x} is not a power of two of at least {min:#x}")]
    InvalidBarSize { size: u64, min: u64 },

    #[error("BAR [{base:#x}..{end:#x}) overlaps a BAR of {owner}")]
    Overlap { base: u64, end: u64, owner: PciBdf },

    #[error("PCI slot {0} is already occupied")]
    SlotInUse(PciBdf),

    #[error("no free PCI slot on bus 0")]
    NoFreeSlot,
}

/// Bump allocator over the PCI MMIO and I/O windows.
///
/// BARs are naturally aligned. The allocator is `Clone` so a caller can snapshot it before a
/// device's init and roll back if that init fails.
#[derive(Debug, Clone)]
pub struct PciResourceAllocator {
    cfg: PciResourceAllocatorConfig,
    next_mmio: u64,
    next_io: u64,
}

impl PciResourceAllocator {
    pub fn new(cfg: PciResourceAllocatorConfig) -> Self {
        Self {
            next_mmio: cfg.mmio_base,
            next_io: u64::from(cfg.io_base),
            cfg,
        }
    }

    pub fn config(&self) -> &PciResourceAllocatorConfig {
        &self.cfg
    }

    pub fn reset(&mut self) {
        self.next_mmio = self.cfg.mmio_base;
        self.next_io = u64::from(self.cfg.io_base);
    }

    pub fn allocate_bar(&mut self, bar: PciBarDefinition) -> Result<PciBarRange, PciResourceError> {
        let size = bar.size();
        let min = bar.min_size();
        if size < min || !size.is_power_of_two() {
            return Err(PciResourceError::InvalidBarSize { size, min });
        }

        let kind = bar.kind();
        let (next, window_end, exhausted) = match kind {
            PciBarKind::Io => (
                &mut self.next_io,
                u64::from(self.cfg.io_base) + u64::from(self.cfg.io_size),
                PciResourceError::OutOfIoSpace,
            ),
            PciBarKind::Mmio32 => (
                &mut self.next_mmio,
                self.cfg.mmio_base.saturating_add(self.cfg.mmio_size),
                PciResourceError::OutOfMmioSpace,
            ),
        };

        let base = align_up_u64(*next, size).ok_or(exhausted)?;
        let end = base.checked_add(size).ok_or(exhausted)?;
        if end > window_end {
            return Err(exhausted);
        }

        *next = end;
        Ok(PciBarRange { kind, base, size })
    }
}

fn align_up_u64(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mmio(size: u32) -> PciBarDefinition {
        PciBarDefinition::Mmio32 {
            size,
            prefetchable: false,
        }
    }

    #[test]
    fn bars_are_naturally_aligned_and_disjoint() {
        let mut alloc = PciResourceAllocator::new(PciResourceAllocatorConfig::default());

        let regs = alloc.allocate_bar(mmio(0x80)).unwrap();
        let fb = alloc.allocate_bar(mmio(16 << 20)).unwrap();
        let io = alloc.allocate_bar(PciBarDefinition::Io { size: 0x20 }).unwrap();

        assert_eq!(regs.base, 0xE000_0000);
        assert_eq!(fb.base, 0xE100_0000);
        assert_eq!(fb.base % fb.size, 0);
        assert!(regs.end_exclusive() <= fb.base);
        assert_eq!(io.base, 0x1000);
        assert_eq!(io.kind, PciBarKind::Io);
    }

    #[test]
    fn rejects_bad_sizes() {
        let mut alloc = PciResourceAllocator::new(PciResourceAllocatorConfig::default());
        assert_eq!(
            alloc.allocate_bar(mmio(0x30)).unwrap_err(),
            PciResourceError::InvalidBarSize {
                size: 0x30,
                min: 0x10
            }
        );
        assert!(matches!(
            alloc.allocate_bar(PciBarDefinition::Io { size: 2 }),
            Err(PciResourceError::InvalidBarSize { .. })
        ));
    }

    #[test]
    fn exhaustion_leaves_cursor_untouched() {
        let mut alloc = PciResourceAllocator::new(PciResourceAllocatorConfig {
            mmio_base: 0xE000_0000,
            mmio_size: 0x0200_0000,
            ..Default::default()
        });

        alloc.allocate_bar(mmio(0x80)).unwrap();
        assert_eq!(
            alloc.allocate_bar(mmio(0x0200_0000)).unwrap_err(),
            PciResourceError::OutOfMmioSpace
        );
        // A fitting request still succeeds after a failed one.
        let fb = alloc.allocate_bar(mmio(0x0100_0000)).unwrap();
        assert_eq!(fb.base, 0xE100_0000);
    }

    #[test]
    fn snapshot_and_restore_rolls_back() {
        let mut alloc = PciResourceAllocator::new(PciResourceAllocatorConfig::default());
        let snapshot = alloc.clone();
        alloc.allocate_bar(mmio(0x1000)).unwrap();

        alloc = snapshot;
        assert_eq!(alloc.allocate_bar(mmio(0x1000)).unwrap().base, 0xE000_0000);
    }
}
