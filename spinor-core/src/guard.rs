//! Write guard
//!
//! Sits between the storage layers and the raw flash driver and refuses
//! any erase or program that would land on partition metadata, the
//! running firmware image, or the translator's boot-contiguous area.
//! A violation is a programming error, so it halts instead of returning.
//!
//! An authorized update flow can lift the guard for a scope by engaging
//! the [`BypassFlag`] it was constructed with.

use core::ops::Range;
use core::sync::atomic::{AtomicBool, Ordering};

use spinor_hal::{FlashError, Geometry, RawFlash, Sector, SECTOR_SIZE};

use crate::config::TranslatorConfig;
use crate::error::Error;
use crate::layout::Layout;

/// Maximum number of protected regions a guard tracks
pub const MAX_REGIONS: usize = 8;

/// What a protected region holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegionKind {
    /// Partition table and boot metadata
    PartitionMetadata,
    /// Currently executing firmware image
    RunningFirmware,
    /// Firmware side of the translator layout
    BootContiguous,
    /// Application defined
    Custom,
}

/// A sector range that must not be erased or programmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProtectedRegion {
    /// What the region holds
    pub kind: RegionKind,
    /// First protected sector
    pub start: u32,
    /// One past the last protected sector
    pub end: u32,
}

impl ProtectedRegion {
    /// Protect sectors `start..end`
    pub const fn new(kind: RegionKind, start: u32, end: u32) -> Self {
        Self { kind, start, end }
    }

    /// Protect every sector touched by the byte range `bytes`
    pub const fn from_bytes(kind: RegionKind, bytes: Range<u32>) -> Self {
        let sector = SECTOR_SIZE as u32;
        Self {
            kind,
            start: bytes.start / sector,
            end: bytes.end.div_ceil(sector),
        }
    }

    /// Protected sectors
    pub const fn sectors(&self) -> Range<u32> {
        self.start..self.end
    }

    /// Whether the region shares a sector with `start..end`
    pub const fn overlaps(&self, start: u32, end: u32) -> bool {
        self.start < end && start < self.end
    }
}

/// Operation refused by the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GuardedOp {
    /// Block erase
    Erase(u32),
    /// Sector program
    Program(u32),
}

/// A refused operation and the region it hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Violation {
    /// Refused operation
    pub op: GuardedOp,
    /// Region it would have modified
    pub region: ProtectedRegion,
}

/// Irrecoverable stop on a guard violation
pub trait Halt {
    /// Stop the system; never returns
    fn halt(&self, violation: &Violation) -> !;
}

/// Default halt: log the violation and panic
///
/// On target `panic-probe` turns the panic into a breakpoint and abort.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicHalt;

impl Halt for PanicHalt {
    fn halt(&self, violation: &Violation) -> ! {
        error!("write guard: {} hits {}", violation.op, violation.region);
        panic!("write guard violation: {:?}", violation);
    }
}

/// Global switch that lifts the guard during an authorized update
pub struct BypassFlag(AtomicBool);

impl BypassFlag {
    /// Create a cleared flag
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Whether the guard is currently lifted
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Lift the guard until the returned token is dropped
    pub fn engage(&self) -> BypassToken<'_> {
        warn!("write guard bypass engaged");
        self.0.store(true, Ordering::Release);
        BypassToken { flag: self }
    }
}

impl Default for BypassFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope of a lifted guard; dropping it re-arms the guard
#[must_use = "the guard is re-armed as soon as the token is dropped"]
pub struct BypassToken<'a> {
    flag: &'a BypassFlag,
}

impl Drop for BypassToken<'_> {
    fn drop(&mut self) {
        self.flag.0.store(false, Ordering::Release);
        info!("write guard bypass released");
    }
}

/// Raw flash wrapper that refuses writes to protected regions
pub struct WriteGuard<'a, F, H = PanicHalt> {
    flash: F,
    regions: heapless::Vec<ProtectedRegion, MAX_REGIONS>,
    bypass: &'a BypassFlag,
    halt: H,
}

impl<'a, F: RawFlash> WriteGuard<'a, F> {
    /// Guard `flash` with no regions yet, halting by panic
    pub fn new(flash: F, bypass: &'a BypassFlag) -> Self {
        Self::with_halt(flash, bypass, PanicHalt)
    }
}

impl<'a, F: RawFlash, H: Halt> WriteGuard<'a, F, H> {
    /// Guard `flash` with a custom halt path
    pub fn with_halt(flash: F, bypass: &'a BypassFlag, halt: H) -> Self {
        Self {
            flash,
            regions: heapless::Vec::new(),
            bypass,
            halt,
        }
    }

    /// Add a protected region
    pub fn protect(&mut self, region: ProtectedRegion) -> Result<(), Error> {
        debug!(
            "write guard: protect sectors {}..{}",
            region.start, region.end
        );
        self.regions.push(region).map_err(|_| Error::OutOfMemory)
    }

    /// Protect the metadata sectors, the firmware image and the
    /// boot-contiguous side of `layout`
    pub fn protect_layout(
        &mut self,
        layout: &Layout,
        config: &TranslatorConfig,
    ) -> Result<(), Error> {
        if config.metadata_sectors > 0 {
            self.protect(ProtectedRegion::new(
                RegionKind::PartitionMetadata,
                0,
                config.metadata_sectors,
            ))?;
        }
        if config.firmware.len > 0 {
            self.protect(ProtectedRegion::from_bytes(
                RegionKind::RunningFirmware,
                config.firmware.start..config.firmware.end(),
            ))?;
        }
        if layout.boot_blocks > 0 {
            self.protect(ProtectedRegion::from_bytes(
                RegionKind::BootContiguous,
                layout.boot_region(),
            ))?;
        }
        Ok(())
    }

    /// Regions currently protected
    pub fn regions(&self) -> &[ProtectedRegion] {
        &self.regions
    }

    /// Check an erase of `block` against the protected regions
    ///
    /// Blocks past the end of the device pass; the driver rejects them.
    pub fn check_erase(&self, block: u32) -> Result<(), Violation> {
        let geometry = self.flash.geometry();
        if block >= geometry.block_count {
            return Ok(());
        }
        let start = geometry.first_sector(block);
        self.check(GuardedOp::Erase(block), start, start + geometry.sectors_per_block)
    }

    /// Check a program of `sector` against the protected regions
    pub fn check_program(&self, sector: u32) -> Result<(), Violation> {
        if sector >= self.flash.geometry().sector_count() {
            return Ok(());
        }
        self.check(GuardedOp::Program(sector), sector, sector + 1)
    }

    fn check(&self, op: GuardedOp, start: u32, end: u32) -> Result<(), Violation> {
        if self.bypass.is_set() {
            return Ok(());
        }
        match self.regions.iter().find(|r| r.overlaps(start, end)) {
            Some(region) => Err(Violation {
                op,
                region: *region,
            }),
            None => Ok(()),
        }
    }

    /// Wrapped driver
    pub fn inner(&self) -> &F {
        &self.flash
    }

    /// Wrapped driver, mutably; writes through it are not checked
    pub fn inner_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Unwrap the driver
    pub fn into_inner(self) -> F {
        self.flash
    }
}

impl<F: RawFlash, H: Halt> RawFlash for WriteGuard<'_, F, H> {
    fn geometry(&self) -> Geometry {
        self.flash.geometry()
    }

    async fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<(), FlashError> {
        self.flash.read_sector(sector, buf).await
    }

    async fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), FlashError> {
        if let Err(violation) = self.check_program(sector) {
            self.halt.halt(&violation);
        }
        self.flash.write_sector(sector, data).await
    }

    async fn erase_block(&mut self, block: u32) -> Result<(), FlashError> {
        if let Err(violation) = self.check_erase(block) {
            self.halt.halt(&violation);
        }
        self.flash.erase_block(block).await
    }

    async fn set_write_protect(&mut self, block: u32, enabled: bool) -> Result<(), FlashError> {
        self.flash.set_write_protect(block, enabled).await
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use embassy_futures::block_on;
    use spinor_hal::sim::RamFlash;
    use spinor_hal::BLANK_SECTOR;

    use super::*;
    use crate::config::FirmwareImage;

    // 16 blocks of 8 sectors
    const GEO: Geometry = Geometry::new(8, 16);

    fn guard(bypass: &BypassFlag) -> WriteGuard<'_, RamFlash> {
        let mut guard = WriteGuard::new(RamFlash::new(GEO), bypass);
        guard
            .protect(ProtectedRegion::new(RegionKind::PartitionMetadata, 0, 2))
            .unwrap();
        guard
            .protect(ProtectedRegion::new(RegionKind::RunningFirmware, 16, 40))
            .unwrap();
        guard
    }

    #[test]
    fn test_check_program() {
        let bypass = BypassFlag::new();
        let guard = guard(&bypass);
        assert!(guard.check_program(2).is_ok());
        assert!(guard.check_program(40).is_ok());

        let violation = guard.check_program(1).unwrap_err();
        assert_eq!(violation.op, GuardedOp::Program(1));
        assert_eq!(violation.region.kind, RegionKind::PartitionMetadata);
        assert_eq!(
            guard.check_program(39).unwrap_err().region.kind,
            RegionKind::RunningFirmware
        );
    }

    #[test]
    fn test_check_erase_covers_whole_block() {
        let bypass = BypassFlag::new();
        let guard = guard(&bypass);
        // Block 0 holds sectors 0..8, metadata is 0..2
        assert!(guard.check_erase(0).is_err());
        assert!(guard.check_erase(1).is_ok());
        assert!(guard.check_erase(2).is_err());
        assert!(guard.check_erase(4).is_err());
        assert!(guard.check_erase(5).is_ok());
    }

    #[test]
    fn test_out_of_device_ops_left_to_driver() {
        let bypass = BypassFlag::new();
        let mut guard = guard(&bypass);
        assert!(guard.check_erase(16).is_ok());
        assert!(guard.check_erase(u32::MAX).is_ok());
        assert!(guard.check_program(u32::MAX).is_ok());

        assert_eq!(
            block_on(guard.erase_block(u32::MAX)),
            Err(FlashError::OutOfBounds)
        );
        assert_eq!(
            block_on(guard.write_sector(u32::MAX, &BLANK_SECTOR)),
            Err(FlashError::OutOfBounds)
        );
    }

    #[test]
    fn test_bypass_is_scoped() {
        let bypass = BypassFlag::new();
        let guard = guard(&bypass);
        {
            let _token = bypass.engage();
            assert!(guard.check_erase(2).is_ok());
        }
        assert!(!bypass.is_set());
        assert!(guard.check_erase(2).is_err());
    }

    #[test]
    fn test_region_capacity() {
        let bypass = BypassFlag::new();
        let mut guard = WriteGuard::new(RamFlash::new(GEO), &bypass);
        for i in 0..MAX_REGIONS as u32 {
            guard
                .protect(ProtectedRegion::new(RegionKind::Custom, i, i + 1))
                .unwrap();
        }
        assert_eq!(
            guard.protect(ProtectedRegion::new(RegionKind::Custom, 9, 10)),
            Err(Error::OutOfMemory)
        );
    }

    #[test]
    fn test_protect_layout_regions() {
        let bypass = BypassFlag::new();
        let config = TranslatorConfig::new(FirmwareImage::new(4096, 3 * 4096 + 100))
            .with_metadata_sectors(2);
        let layout = Layout::compute(GEO, &config).unwrap();
        let mut guard = WriteGuard::new(RamFlash::new(GEO), &bypass);
        guard.protect_layout(&layout, &config).unwrap();

        let kinds: Vec<_> = guard.regions().iter().map(|r| (r.kind, r.sectors())).collect();
        assert_eq!(
            kinds,
            vec![
                (RegionKind::PartitionMetadata, 0..2),
                (RegionKind::RunningFirmware, 8..33),
                (RegionKind::BootContiguous, 0..40),
            ]
        );
        assert!(guard.check_erase(layout.pool_start).is_ok());
    }

    #[test]
    #[should_panic(expected = "write guard violation")]
    fn test_default_halt_panics() {
        let bypass = BypassFlag::new();
        let mut guard = guard(&bypass);
        let _ = block_on(guard.erase_block(0));
    }

    #[test]
    fn test_violation_never_reaches_driver() {
        let bypass = BypassFlag::new();
        let mut guard = guard(&bypass);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = block_on(guard.write_sector(20, &BLANK_SECTOR));
        }));
        assert!(result.is_err());
        assert_eq!(guard.inner().write_count(), 0);

        block_on(guard.write_sector(41, &[0u8; SECTOR_SIZE])).unwrap();
        assert_eq!(guard.inner().write_count(), 1);
    }

    #[test]
    fn test_bypass_reaches_driver() {
        let bypass = BypassFlag::new();
        let mut guard = guard(&bypass);
        let token = bypass.engage();
        block_on(guard.erase_block(0)).unwrap();
        block_on(guard.write_sector(0, &[0u8; SECTOR_SIZE])).unwrap();
        drop(token);
        assert_eq!(guard.inner().erase_count(), 1);
        assert_eq!(guard.inner().write_count(), 1);
    }
}
