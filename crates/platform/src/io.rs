use thiserror::Error;

/// A device reachable through x86 port I/O.
///
/// Handlers take `&self`: several vCPU threads may access the same device concurrently, so any
/// mutable device state lives behind the device's own lock.
pub trait PortIoDevice: Send + Sync {
    fn read(&self, port: u16, size: u8) -> u32;
    fn write(&self, port: u16, size: u8, value: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoBusError {
    #[error("I/O port range length must be non-zero (start={start:#x})")]
    EmptyRange { start: u16 },

    #[error("I/O port range wraps past 0xFFFF: start={start:#x} len={len:#x}")]
    Wraps { start: u16, len: u16 },

    #[error("overlapping I/O port ranges: new=[{start:#x}..{end:#x}) existing=[{existing_start:#x}..{existing_end:#x})")]
    Overlap {
        start: u32,
        end: u32,
        existing_start: u32,
        existing_end: u32,
    },
}

struct RangeDevice {
    start: u16,
    len: u16,
    dev: Box<dyn PortIoDevice>,
}

impl RangeDevice {
    fn end_exclusive(&self) -> u32 {
        u32::from(self.start) + u32::from(self.len)
    }

    fn contains(&self, port: u16) -> bool {
        let p = u32::from(port);
        p >= u32::from(self.start) && p < self.end_exclusive()
    }
}

/// Port I/O router.
///
/// Registration happens while the VM is being built or torn down (`&mut self`); guest accesses
/// only need `&self`, so a fully built bus can be shared between vCPU threads without locking.
#[derive(Default)]
pub struct IoPortBus {
    ranges: Vec<RangeDevice>,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a single device over a contiguous I/O port range.
    ///
    /// Ranges are kept sorted by start port and must not overlap.
    pub fn register_range(
        &mut self,
        start: u16,
        len: u16,
        dev: Box<dyn PortIoDevice>,
    ) -> Result<(), IoBusError> {
        if len == 0 {
            return Err(IoBusError::EmptyRange { start });
        }

        let end_exclusive = u32::from(start) + u32::from(len);
        if end_exclusive > 0x1_0000 {
            return Err(IoBusError::Wraps { start, len });
        }

        let idx = self
            .ranges
            .partition_point(|r| u32::from(r.start) < u32::from(start));

        let neighbours = [idx.checked_sub(1), Some(idx)];
        for existing in neighbours.into_iter().flatten() {
            let Some(existing) = self.ranges.get(existing) else {
                continue;
            };
            if u32::from(start) < existing.end_exclusive()
                && u32::from(existing.start) < end_exclusive
            {
                return Err(IoBusError::Overlap {
                    start: u32::from(start),
                    end: end_exclusive,
                    existing_start: u32::from(existing.start),
                    existing_end: existing.end_exclusive(),
                });
            }
        }

        self.ranges.insert(idx, RangeDevice { start, len, dev });
        Ok(())
    }

    /// Unregisters a device previously registered via [`Self::register_range`].
    ///
    /// Returns the removed device if a range exactly matching `(start, len)` exists.
    pub fn unregister_range(&mut self, start: u16, len: u16) -> Option<Box<dyn PortIoDevice>> {
        if len == 0 {
            return None;
        }

        let idx = self.ranges.partition_point(|r| r.start < start);
        let cand = self.ranges.get(idx)?;
        if cand.start != start || cand.len != len {
            return None;
        }
        Some(self.ranges.remove(idx).dev)
    }

    pub fn is_mapped(&self, port: u16) -> bool {
        self.find_range_index(port).is_some()
    }

    fn find_range_index(&self, port: u16) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.start <= port);
        if idx == 0 {
            return None;
        }
        let cand = idx - 1;
        self.ranges
            .get(cand)
            .is_some_and(|r| r.contains(port))
            .then_some(cand)
    }

    pub fn read(&self, port: u16, size: u8) -> u32 {
        if size == 0 {
            return 0;
        }

        // x86 port I/O instructions only support access sizes {1,2,4}. Float the bus high for
        // anything else rather than forwarding an unexpected size into device models.
        if !matches!(size, 1 | 2 | 4) {
            tracing::warn!(port, size, "unsupported port read size");
            return 0xFFFF_FFFF;
        }

        match self.find_range_index(port) {
            Some(idx) => self.ranges[idx].dev.read(port, size),
            None => all_ones(size),
        }
    }

    pub fn write(&self, port: u16, size: u8, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            tracing::warn!(port, size, value, "unsupported port write size dropped");
            return;
        }
        if let Some(idx) = self.find_range_index(port) {
            self.ranges[idx].dev.write(port, size, value);
        }
    }
}

fn all_ones(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}
