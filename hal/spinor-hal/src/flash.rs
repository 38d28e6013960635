//! Raw flash abstractions
//!
//! Sector-granular primitives that chip-specific HALs implement on top of
//! their NOR flash controller. Everything above this trait (write guard,
//! block translator, parameter store) only ever talks to flash through it.

use core::future::Future;

/// Sector size in bytes. Fixed for every supported part.
pub const SECTOR_SIZE: usize = 512;

/// Value of an erased byte on NOR flash
pub const ERASED_BYTE: u8 = 0xFF;

/// One sector worth of data
pub type Sector = [u8; SECTOR_SIZE];

/// A fully erased sector
pub const BLANK_SECTOR: Sector = [ERASED_BYTE; SECTOR_SIZE];

/// Check whether a sector reads back as erased
pub fn is_blank(sector: &[u8]) -> bool {
    sector.iter().all(|&b| b == ERASED_BYTE)
}

/// Check whether `new` can be programmed over `old` without an erase
///
/// NOR cells only go from 1 to 0 when programmed, so every bit set in
/// `new` must already be set in `old`.
pub fn can_program_over(old: &[u8], new: &[u8]) -> bool {
    old.iter().zip(new.iter()).all(|(&o, &n)| o & n == n)
}

/// Physical layout of a flash device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    /// Sectors per erase block
    pub sectors_per_block: u32,
    /// Number of erase blocks on the device
    pub block_count: u32,
}

impl Geometry {
    /// Create a geometry description
    pub const fn new(sectors_per_block: u32, block_count: u32) -> Self {
        Self {
            sectors_per_block,
            block_count,
        }
    }

    /// Erase block size in bytes
    pub const fn block_size(&self) -> u32 {
        self.sectors_per_block * SECTOR_SIZE as u32
    }

    /// Total number of sectors
    pub const fn sector_count(&self) -> u32 {
        self.sectors_per_block * self.block_count
    }

    /// Device capacity in bytes
    pub const fn capacity(&self) -> u32 {
        self.block_size() * self.block_count
    }

    /// First sector of `block`
    pub const fn first_sector(&self, block: u32) -> u32 {
        block * self.sectors_per_block
    }

    /// Erase block containing `sector`
    pub const fn block_of(&self, sector: u32) -> u32 {
        sector / self.sectors_per_block
    }

    /// Byte address of `sector`
    pub const fn sector_address(sector: u32) -> u32 {
        sector * SECTOR_SIZE as u32
    }
}

/// Errors from raw flash operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Sector or block index outside the device
    OutOfBounds,
    /// Target block is write protected
    Protected,
    /// Address or length not aligned to the device granularity
    Unaligned,
    /// Controller reported a failure
    Device,
}

/// Raw NOR flash driver
///
/// Implementations only move bytes; they perform no policy checks.
/// Program operations follow NOR semantics: bits can only be cleared,
/// so callers must erase a block before rewriting a sector with bits set.
pub trait RawFlash {
    /// Device geometry
    fn geometry(&self) -> Geometry;

    /// Read one sector
    fn read_sector(
        &mut self,
        sector: u32,
        buf: &mut Sector,
    ) -> impl Future<Output = Result<(), FlashError>>;

    /// Program one sector
    fn write_sector(
        &mut self,
        sector: u32,
        data: &Sector,
    ) -> impl Future<Output = Result<(), FlashError>>;

    /// Erase one block back to `0xFF`
    fn erase_block(&mut self, block: u32) -> impl Future<Output = Result<(), FlashError>>;

    /// Enable or disable the write protection bits covering `block`
    fn set_write_protect(
        &mut self,
        block: u32,
        enabled: bool,
    ) -> impl Future<Output = Result<(), FlashError>>;
}

impl<F: RawFlash + ?Sized> RawFlash for &mut F {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }

    async fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<(), FlashError> {
        (**self).read_sector(sector, buf).await
    }

    async fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), FlashError> {
        (**self).write_sector(sector, data).await
    }

    async fn erase_block(&mut self, block: u32) -> Result<(), FlashError> {
        (**self).erase_block(block).await
    }

    async fn set_write_protect(&mut self, block: u32, enabled: bool) -> Result<(), FlashError> {
        (**self).set_write_protect(block, enabled).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_math() {
        let geo = Geometry::new(8, 16);
        assert_eq!(geo.block_size(), 4096);
        assert_eq!(geo.sector_count(), 128);
        assert_eq!(geo.capacity(), 64 * 1024);
        assert_eq!(geo.first_sector(3), 24);
        assert_eq!(geo.block_of(25), 3);
        assert_eq!(Geometry::sector_address(2), 1024);
    }

    #[test]
    fn test_blank_detection() {
        let mut sector = BLANK_SECTOR;
        assert!(is_blank(&sector));
        sector[511] = 0xFE;
        assert!(!is_blank(&sector));
    }

    #[test]
    fn test_program_over_only_clears_bits() {
        assert!(can_program_over(&[0xFF, 0xF0], &[0x0F, 0x00]));
        assert!(can_program_over(&[0x5A], &[0x5A]));
        assert!(!can_program_over(&[0x00], &[0x01]));
        assert!(!can_program_over(&[0xF0], &[0xF8]));
    }
}
