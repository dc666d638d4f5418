//! BAR0 control block: 128 bytes, little-endian.
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 4    | fbsize       |
//! | 4      | 2    | width        |
//! | 6      | 2    | height       |
//! | 8      | 2    | depth        |
//! | 10     | 2    | refresh rate |
//! | 12     | 116  | reserved     |
//!
//! The guest may access any in-bounds offset with 1/2/4/8-byte accesses; fields are not
//! validated.

use crate::RegisterAccessError;

pub const FBUF_REGS_SIZE: usize = 128;

pub const REG_FBSIZE: usize = 0;
pub const REG_WIDTH: usize = 4;
pub const REG_HEIGHT: usize = 6;
pub const REG_DEPTH: usize = 8;
pub const REG_REFRESH_RATE: usize = 10;

#[derive(Clone, PartialEq, Eq)]
pub struct FbufRegisters {
    bytes: [u8; FBUF_REGS_SIZE],
}

impl FbufRegisters {
    pub fn new(fbsize: u32, width: u16, height: u16, depth: u16) -> Self {
        let mut regs = Self {
            bytes: [0; FBUF_REGS_SIZE],
        };
        regs.bytes[REG_FBSIZE..REG_FBSIZE + 4].copy_from_slice(&fbsize.to_le_bytes());
        regs.set_u16(REG_WIDTH, width);
        regs.set_u16(REG_HEIGHT, height);
        regs.set_u16(REG_DEPTH, depth);
        regs
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    fn set_u16(&mut self, offset: usize, value: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn fbsize(&self) -> u32 {
        u32::from_le_bytes([
            self.bytes[REG_FBSIZE],
            self.bytes[REG_FBSIZE + 1],
            self.bytes[REG_FBSIZE + 2],
            self.bytes[REG_FBSIZE + 3],
        ])
    }

    pub fn width(&self) -> u16 {
        self.u16_at(REG_WIDTH)
    }

    pub fn height(&self) -> u16 {
        self.u16_at(REG_HEIGHT)
    }

    pub fn depth(&self) -> u16 {
        self.u16_at(REG_DEPTH)
    }

    pub fn refresh_rate(&self) -> u16 {
        self.u16_at(REG_REFRESH_RATE)
    }

    pub fn as_bytes(&self) -> &[u8; FBUF_REGS_SIZE] {
        &self.bytes
    }

    fn checked_range(
        offset: u64,
        size: usize,
    ) -> Result<std::ops::Range<usize>, RegisterAccessError> {
        let out_of_range = RegisterAccessError::OutOfRange {
            offset,
            size,
            len: FBUF_REGS_SIZE,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_range)?;
        let end = start.checked_add(size).ok_or(out_of_range)?;
        if end > FBUF_REGS_SIZE {
            return Err(out_of_range);
        }
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(RegisterAccessError::UnsupportedSize(size));
        }
        Ok(start..end)
    }

    pub fn read(&self, offset: u64, size: usize) -> Result<u64, RegisterAccessError> {
        let range = Self::checked_range(offset, size)?;
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&self.bytes[range]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes the low `size` bytes of `value`. Nothing is written if the access is rejected.
    pub fn write(
        &mut self,
        offset: u64,
        size: usize,
        value: u64,
    ) -> Result<(), RegisterAccessError> {
        let range = Self::checked_range(offset, size)?;
        self.bytes[range].copy_from_slice(&value.to_le_bytes()[..size]);
        Ok(())
    }
}

impl std::fmt::Debug for FbufRegisters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FbufRegisters")
            .field("fbsize", &self.fbsize())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("depth", &self.depth())
            .field("refresh_rate", &self.refresh_rate())
            .finish()
    }
}
