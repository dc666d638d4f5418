//! Host-backed guest memory.
//!
//! Some device regions (e.g. a linear framebuffer) are not trapped at all: the host allocates a
//! backing store and maps it directly into guest-physical address space. [`HostMemory`] is that
//! backing store, shared between the mapping and whatever host component consumes it (the
//! display path), and [`GuestMemoryMapper`] is the hypervisor operation that installs it.

use bitflags::bitflags;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

bitflags! {
    /// Access rights of a direct guest mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("host memory access out of range: offset={offset:#x} len={len} size={size:#x}")]
    OutOfRange { offset: u64, len: usize, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("invalid guest mapping: gpa={gpa:#x} len={len:#x}")]
    InvalidRange { gpa: u64, len: u64 },

    #[error("guest mapping [{gpa:#x}..{end:#x}) overlaps existing mapping at {existing:#x}")]
    Overlap { gpa: u64, end: u64, existing: u64 },

    #[error("no guest mapping at {gpa:#x}")]
    NotMapped { gpa: u64 },

    #[error("guest access not permitted by mapping at {gpa:#x}")]
    AccessDenied { gpa: u64 },

    #[error("hypervisor rejected mapping at {gpa:#x}: {reason}")]
    Rejected { gpa: u64, reason: String },
}

/// Zero-initialised, fixed-size host memory shared between the guest mapping and host readers.
#[derive(Debug)]
pub struct HostMemory {
    bytes: RwLock<Box<[u8]>>,
}

impl HostMemory {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = self.bytes.read().unwrap_or_else(PoisonError::into_inner);
        let range = checked_range(offset, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = self.bytes.write().unwrap_or_else(PoisonError::into_inner);
        let range = checked_range(offset, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, value: u8) {
        self.bytes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fill(value);
    }

    /// Runs `f` with a consistent view of the whole region (e.g. to scan out a frame).
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self.bytes.read().unwrap_or_else(PoisonError::into_inner);
        f(&bytes)
    }
}

fn checked_range(
    offset: u64,
    len: usize,
    size: usize,
) -> Result<std::ops::Range<usize>, MemoryError> {
    let err = || MemoryError::OutOfRange {
        offset,
        len,
        size: size as u64,
    };
    let start = usize::try_from(offset).map_err(|_| err())?;
    let end = start.checked_add(len).ok_or_else(err)?;
    if end > size {
        return Err(err());
    }
    Ok(start..end)
}

/// Hypervisor operation that backs a guest-physical range directly with host memory.
pub trait GuestMemoryMapper: Send + Sync {
    fn map_direct(
        &self,
        gpa: u64,
        backing: Arc<HostMemory>,
        prot: Protection,
    ) -> Result<(), MapError>;

    /// Removes the mapping starting at `gpa`, returning its backing store.
    fn unmap(&self, gpa: u64) -> Result<Arc<HostMemory>, MapError>;
}

struct Mapping {
    len: u64,
    prot: Protection,
    backing: Arc<HostMemory>,
}

/// In-process guest-physical map.
///
/// Records direct mappings and services guest accesses to them. Used by the native runner and by
/// tests in place of a real hypervisor memory-slot API.
#[derive(Default)]
pub struct GuestPhysMap {
    mappings: Mutex<BTreeMap<u64, Mapping>>,
}

impl GuestPhysMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_mapped(&self, gpa: u64) -> bool {
        let mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        find_mapping(&mappings, gpa).is_some()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Guest read through a direct mapping. The access must not straddle mappings.
    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MapError> {
        let (base, backing, prot) = self.resolve(gpa)?;
        if !prot.contains(Protection::READ) {
            return Err(MapError::AccessDenied { gpa });
        }
        backing
            .read(gpa - base, buf)
            .map_err(|_| MapError::NotMapped { gpa })
    }

    /// Guest write through a direct mapping. The access must not straddle mappings.
    pub fn write(&self, gpa: u64, data: &[u8]) -> Result<(), MapError> {
        let (base, backing, prot) = self.resolve(gpa)?;
        if !prot.contains(Protection::WRITE) {
            return Err(MapError::AccessDenied { gpa });
        }
        backing
            .write(gpa - base, data)
            .map_err(|_| MapError::NotMapped { gpa })
    }

    fn resolve(&self, gpa: u64) -> Result<(u64, Arc<HostMemory>, Protection), MapError> {
        let mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        let (base, mapping) = find_mapping(&mappings, gpa).ok_or(MapError::NotMapped { gpa })?;
        Ok((base, mapping.backing.clone(), mapping.prot))
    }
}

fn find_mapping(mappings: &BTreeMap<u64, Mapping>, gpa: u64) -> Option<(u64, &Mapping)> {
    let (&base, mapping) = mappings.range(..=gpa).next_back()?;
    (gpa - base < mapping.len).then_some((base, mapping))
}

impl GuestMemoryMapper for GuestPhysMap {
    fn map_direct(
        &self,
        gpa: u64,
        backing: Arc<HostMemory>,
        prot: Protection,
    ) -> Result<(), MapError> {
        let len = backing.len() as u64;
        let end = gpa
            .checked_add(len)
            .filter(|_| len != 0)
            .ok_or(MapError::InvalidRange { gpa, len })?;

        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((&existing, _)) = mappings
            .range(..end)
            .next_back()
            .filter(|(base, m)| **base + m.len > gpa)
        {
            return Err(MapError::Overlap { gpa, end, existing });
        }

        tracing::debug!(gpa, len, ?prot, "direct guest mapping installed");
        mappings.insert(gpa, Mapping { len, prot, backing });
        Ok(())
    }

    fn unmap(&self, gpa: u64) -> Result<Arc<HostMemory>, MapError> {
        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        let mapping = mappings.remove(&gpa).ok_or(MapError::NotMapped { gpa })?;
        tracing::debug!(gpa, len = mapping.len, "direct guest mapping removed");
        Ok(mapping.backing)
    }
}
