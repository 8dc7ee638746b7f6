use super::buffer::BUFFER_SIZE;
use super::error::{Error, Result};
use crate::FlashInfo;

const DEFAULT_READ_SIZE: u32 = 256;
const DEFAULT_PROG_SIZE: u32 = 256;
const DEFAULT_BLOCK_SIZE: u32 = 4096;
const DEFAULT_BLOCK_CYCLES: i32 = 1000;
const DEFAULT_CACHE_SIZE: u32 = 256;

/// Requested instance geometry.
///
/// `block_count` and `lookahead_size` may be left at zero to have them
/// derived from the chip capacity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Minimum read granularity in bytes.
    pub read_size: u32,
    /// Minimum program granularity in bytes.
    pub prog_size: u32,
    /// Erasable block size, a multiple of the flash sector size.
    pub block_size: u32,
    pub block_count: u32,
    /// Erase cycles before the consumer relocates metadata, or -1 to disable.
    pub block_cycles: i32,
    pub cache_size: u32,
    pub lookahead_size: u32,
    /// Limits passed through to the consumer; zero selects its defaults.
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
    /// Log every block operation at debug level.
    pub debug: bool,
}

impl Config {
    /// Defaults for a chip: one block per sector, 256-byte read/program units.
    pub fn for_flash(info: &FlashInfo) -> Self {
        let block_count = info.capacity / DEFAULT_BLOCK_SIZE;
        Config {
            read_size: DEFAULT_READ_SIZE,
            prog_size: DEFAULT_PROG_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            block_count,
            block_cycles: DEFAULT_BLOCK_CYCLES,
            cache_size: DEFAULT_CACHE_SIZE,
            lookahead_size: default_lookahead(block_count),
            name_max: 0,
            file_max: 0,
            attr_max: 0,
            debug: false,
        }
    }

    /// Validate against the chip and the instance buffers, filling in derived fields.
    pub fn resolve(&self, info: &FlashInfo) -> Result<Geometry> {
        if self.read_size == 0 || self.prog_size == 0 || self.block_size == 0 {
            return Err(Error::InvalidConfig("read, prog and block sizes must be non-zero"));
        }
        if self.block_size % info.sector_size() != 0 {
            return Err(Error::InvalidConfig("block size must be a multiple of the sector size"));
        }
        if self.block_size % self.read_size != 0 || self.block_size % self.prog_size != 0 {
            return Err(Error::InvalidConfig("block size must be a multiple of read and prog size"));
        }
        if self.cache_size == 0
            || self.cache_size as usize > BUFFER_SIZE
            || self.cache_size % self.read_size != 0
            || self.cache_size % self.prog_size != 0
            || self.block_size % self.cache_size != 0
        {
            return Err(Error::InvalidConfig("cache size does not fit the buffers or geometry"));
        }

        let block_count = match self.block_count {
            0 => info.capacity / self.block_size,
            n => n,
        };
        if block_count == 0 {
            return Err(Error::InvalidConfig("chip is smaller than one block"));
        }
        let max_address = block_count as u64 * self.block_size as u64;
        if max_address > info.capacity as u64 {
            return Err(Error::InvalidConfig("block count exceeds chip capacity"));
        }

        let lookahead_size = match self.lookahead_size {
            0 => default_lookahead(block_count),
            n => n,
        };
        if lookahead_size % 8 != 0 || lookahead_size as usize > BUFFER_SIZE {
            return Err(Error::InvalidConfig("lookahead size must be a multiple of 8 within the buffer"));
        }

        Ok(Geometry {
            read_size: self.read_size,
            prog_size: self.prog_size,
            block_size: self.block_size,
            block_count,
            block_cycles: self.block_cycles,
            cache_size: self.cache_size,
            lookahead_size,
            name_max: self.name_max,
            file_max: self.file_max,
            attr_max: self.attr_max,
            sector_size: info.sector_size(),
            max_address,
        })
    }
}

/// Lookahead bitmap size: one bit per block, clamped to [8, 256] bytes in multiples of 8.
pub fn default_lookahead(block_count: u32) -> u32 {
    (block_count / 8).max(8).min(BUFFER_SIZE as u32) & !7
}

/// Validated geometry as seen by the consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub read_size: u32,
    pub prog_size: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub block_cycles: i32,
    pub cache_size: u32,
    pub lookahead_size: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
    /// Flash sector size; each block is erased as `block_size / sector_size` sectors.
    pub sector_size: u32,
    /// One past the last byte address this instance may touch.
    pub max_address: u64,
}

impl Geometry {
    pub fn total_bytes(&self) -> u64 {
        self.max_address
    }
}
