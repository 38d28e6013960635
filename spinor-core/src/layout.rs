//! Translator region layout
//!
//! The device is split relative to the running firmware image:
//!
//! ```text
//! firmware in the front half:
//! ┌──────┬───────────────┬──────────────────────────────┬──────────┐
//! │ meta │ firmware      │ translator pool              │ reserved │
//! └──────┴───────────────┴──────────────────────────────┴──────────┘
//!  └──── boot-contiguous ┘
//!
//! firmware in the back half:
//! ┌──────┬──────────────────────────────┬──────────┬───────────────┐
//! │ meta │ translator pool              │ reserved │ firmware      │
//! └──────┴──────────────────────────────┴──────────┴───────────────┘
//!                                                   └ boot-contiguous
//! ```
//!
//! One pool block is always held back from the addressable range as the
//! relocation reserve, so the pool sits on the side of the image that is
//! not boot-contiguous and can be updated without touching the image.
//!
//! Blocks lent out as the physical area are carved from the pool edge
//! that faces the firmware: right after the firmware when it is in
//! front, right before the reserved blocks when it is in the back.

use core::ops::Range;

use spinor_hal::{Geometry, SECTOR_SIZE};

use crate::config::TranslatorConfig;
use crate::error::Error;

/// Width limit of the block number fields in the partition metadata
pub const METADATA_FIELD_MAX: u32 = u8::MAX as u32;

/// First block the pool may start at; block 0 holds partition metadata
pub const MIN_POOL_START: u32 = 1;

/// Which half of the device the firmware image starts in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FirmwareSide {
    /// Image in the front half, pool after it
    Front,
    /// Image in the back half, pool before it
    Back,
}

/// Computed placement of the translator pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Layout {
    /// Device geometry the layout was computed for
    pub geometry: Geometry,
    /// Side of the device holding the firmware
    pub side: FirmwareSide,
    /// First physical block of the pool
    pub pool_start: u32,
    /// Physical blocks in the pool, relocation reserve included
    pub total_blocks: u32,
    /// First block of the boot-contiguous area
    pub boot_start: u32,
    /// Blocks in the boot-contiguous area
    pub boot_blocks: u32,
    /// First block carved off after the pool
    pub reserved_start: u32,
    /// Blocks carved off after the pool
    pub reserved_blocks: u32,
    /// First block lent out as the physical area
    pub physical_start: u32,
    /// Blocks lent out as the physical area
    pub physical_blocks: u32,
}

impl Layout {
    /// Place the pool for `config` on a device with `geometry`
    pub fn compute(geometry: Geometry, config: &TranslatorConfig) -> Result<Self, Error> {
        if geometry.sectors_per_block < 2 {
            // One header sector plus at least one data sector
            return Err(Error::InvalidRange);
        }
        let device_blocks = geometry.block_count;
        let block_size = geometry.block_size();
        let firmware = config.firmware;
        if firmware.end() > geometry.capacity() {
            return Err(Error::InvalidRange);
        }

        let fw_first = firmware.start / block_size;
        let fw_end = firmware.end().div_ceil(block_size);

        let (side, start, end, boot) = if fw_first.saturating_mul(2) < device_blocks {
            (FirmwareSide::Front, fw_end, device_blocks, 0..fw_end)
        } else {
            (FirmwareSide::Back, MIN_POOL_START, fw_first, fw_first..device_blocks)
        };

        let metadata_blocks = config
            .metadata_sectors
            .div_ceil(geometry.sectors_per_block);
        let start = start
            .max(MIN_POOL_START)
            .max(config.protected_blocks)
            .max(metadata_blocks);
        let reserved_start = end.saturating_sub(config.reserved_blocks);
        let lent = config.physical_blocks;

        let (physical_start, pool_start, pool_end) = match side {
            FirmwareSide::Front => (start, start.saturating_add(lent), reserved_start),
            FirmwareSide::Back => {
                let physical_start = reserved_start.saturating_sub(lent);
                (physical_start, start, physical_start)
            }
        };
        if pool_start > METADATA_FIELD_MAX {
            return Err(Error::InsufficientBlocks);
        }
        let total_blocks = pool_end
            .saturating_sub(pool_start)
            .min(METADATA_FIELD_MAX);
        if total_blocks < 2 {
            return Err(Error::InsufficientBlocks);
        }

        Ok(Self {
            geometry,
            side,
            pool_start,
            total_blocks,
            boot_start: boot.start,
            boot_blocks: boot.end - boot.start,
            reserved_start,
            reserved_blocks: end - reserved_start,
            physical_start,
            physical_blocks: lent,
        })
    }

    /// Data bytes one logical block holds (sector 0 is the block header)
    pub const fn per_block_capacity(&self) -> u32 {
        (self.geometry.sectors_per_block - 1) * SECTOR_SIZE as u32
    }

    /// Logical blocks exposed to callers
    pub const fn addressable_blocks(&self) -> u32 {
        self.total_blocks - 1
    }

    /// Usable logical address space in bytes
    pub const fn logical_size(&self) -> u32 {
        self.addressable_blocks() * self.per_block_capacity()
    }

    /// Physical blocks of the pool
    pub const fn pool(&self) -> Range<u32> {
        self.pool_start..self.pool_start + self.total_blocks
    }

    /// Whether `block` belongs to the pool
    pub const fn contains(&self, block: u32) -> bool {
        block >= self.pool_start && block < self.pool_start + self.total_blocks
    }

    /// Boot-contiguous area in bytes
    pub const fn boot_region(&self) -> Range<u32> {
        let block_size = self.geometry.block_size();
        self.boot_start * block_size..(self.boot_start + self.boot_blocks) * block_size
    }

    /// Blocks carved off after the pool
    pub const fn reserved(&self) -> Range<u32> {
        self.reserved_start..self.reserved_start + self.reserved_blocks
    }

    /// Blocks lent out as the physical area
    pub const fn physical(&self) -> Range<u32> {
        self.physical_start..self.physical_start + self.physical_blocks
    }

    /// Physical area in bytes
    pub const fn physical_region(&self) -> Range<u32> {
        let block_size = self.geometry.block_size();
        let blocks = self.physical();
        blocks.start * block_size..blocks.end * block_size
    }
}
