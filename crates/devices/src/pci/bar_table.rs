use super::config::{PciBarKind, PciBarRange};
use super::{PciBdf, PciResourceError};
use std::collections::BTreeMap;

/// Guest address space a BAR decodes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarSpace {
    Io,
    Memory,
}

impl From<PciBarKind> for BarSpace {
    fn from(kind: PciBarKind) -> Self {
        match kind {
            PciBarKind::Io => Self::Io,
            PciBarKind::Mmio32 => Self::Memory,
        }
    }
}

/// One live BAR assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarEntry {
    pub owner: PciBdf,
    pub bar: u8,
    pub range: PciBarRange,
}

/// Address-to-BAR lookup for every live BAR.
///
/// Populated while devices are created and torn down; guest accesses only read it.
#[derive(Debug, Default)]
pub struct BarTable {
    io: BTreeMap<u64, BarEntry>,
    memory: BTreeMap<u64, BarEntry>,
}

impl BarTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn space(&self, space: BarSpace) -> &BTreeMap<u64, BarEntry> {
        match space {
            BarSpace::Io => &self.io,
            BarSpace::Memory => &self.memory,
        }
    }

    fn space_mut(&mut self, space: BarSpace) -> &mut BTreeMap<u64, BarEntry> {
        match space {
            BarSpace::Io => &mut self.io,
            BarSpace::Memory => &mut self.memory,
        }
    }

    /// Records a BAR. Fails without modifying the table if it overlaps a live BAR.
    pub fn insert(&mut self, entry: BarEntry) -> Result<(), PciResourceError> {
        let base = entry.range.base;
        let end = entry.range.end_exclusive();
        let map = self.space_mut(entry.range.kind.into());

        if let Some((_, existing)) = map
            .range(..end)
            .next_back()
            .filter(|(_, e)| e.range.end_exclusive() > base)
        {
            return Err(PciResourceError::Overlap {
                base,
                end,
                owner: existing.owner,
            });
        }

        map.insert(base, entry);
        Ok(())
    }

    /// Removes every BAR owned by `owner`.
    pub fn remove_owner(&mut self, owner: PciBdf) {
        self.io.retain(|_, e| e.owner != owner);
        self.memory.retain(|_, e| e.owner != owner);
    }

    pub fn clear(&mut self) {
        self.io.clear();
        self.memory.clear();
    }

    /// Finds the BAR decoding `addr` in `space`.
    pub fn lookup(&self, space: BarSpace, addr: u64) -> Option<&BarEntry> {
        self.space(space)
            .range(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.range.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &BarEntry> {
        self.io.values().chain(self.memory.values())
    }

    pub fn len(&self) -> usize {
        self.io.len() + self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
