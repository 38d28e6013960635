//! Configuration type definitions
//!
//! All addresses are byte offsets from the start of the flash device
//! handed to the storage layer.

use serde::{Deserialize, Serialize};

/// Location of the currently executing firmware image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareImage {
    /// First byte of the image
    pub start: u32,
    /// Image length in bytes
    pub len: u32,
}

impl FirmwareImage {
    /// Create an image description
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    /// One past the last byte of the image
    pub const fn end(&self) -> u32 {
        self.start.saturating_add(self.len)
    }
}

/// Logical block translator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TranslatorConfig {
    /// Running firmware image; the translator region is placed around it
    pub firmware: FirmwareImage,
    /// Leading blocks that are statically write protected
    pub protected_blocks: u32,
    /// Blocks carved off the end of the translator region for other users
    /// (the parameter store lives here)
    pub reserved_blocks: u32,
    /// Leading sectors holding the partition table and boot metadata
    pub metadata_sectors: u32,
    /// Pool blocks lent out as a physically contiguous area, taken from
    /// the pool edge that faces the firmware
    pub physical_blocks: u32,
}

impl TranslatorConfig {
    /// Configuration with no static protection and no reserved blocks
    pub const fn new(firmware: FirmwareImage) -> Self {
        Self {
            firmware,
            protected_blocks: 0,
            reserved_blocks: 0,
            metadata_sectors: 0,
            physical_blocks: 0,
        }
    }

    /// Set the statically protected leading range
    pub const fn with_protected_blocks(mut self, blocks: u32) -> Self {
        self.protected_blocks = blocks;
        self
    }

    /// Reserve blocks at the end of the translator region
    pub const fn with_reserved_blocks(mut self, blocks: u32) -> Self {
        self.reserved_blocks = blocks;
        self
    }

    /// Set the number of partition metadata sectors
    pub const fn with_metadata_sectors(mut self, sectors: u32) -> Self {
        self.metadata_sectors = sectors;
        self
    }

    /// Keep `blocks` pool blocks lent out as the physical area
    ///
    /// Persist the size reported after a physical area change here so the
    /// next mount places the pool the same way.
    pub const fn with_physical_blocks(mut self, blocks: u32) -> Self {
        self.physical_blocks = blocks;
        self
    }
}

/// Durable parameter store configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParamStoreConfig {
    /// Physical block holding the parameter log
    pub block: u32,
    /// After locating the programmed/blank boundary, read every sector
    /// past it and treat the block as full if any is not blank
    pub verify_tail: bool,
}

impl ParamStoreConfig {
    /// Store in `block` with the fast recovery path
    pub const fn new(block: u32) -> Self {
        Self {
            block,
            verify_tail: false,
        }
    }

    /// Enable the linear tail check during recovery
    pub const fn with_verify_tail(mut self, verify_tail: bool) -> Self {
        self.verify_tail = verify_tail;
        self
    }
}
