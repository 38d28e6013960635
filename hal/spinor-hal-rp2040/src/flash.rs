//! Flash driver for RP2040
//!
//! Exposes a window of the QSPI flash as sector-granular raw flash. The
//! RP2040 erases in 4 KiB units, so one block is eight 512-byte sectors.
//!
//! Write protection lives in the flash part's status register, which the
//! boot ROM routines do not expose; `set_write_protect` only validates the
//! block and the write guard provides the actual protection.

use embassy_rp::dma::Channel;
use embassy_rp::flash::{Async, Flash, ERASE_SIZE};
use embassy_rp::peripherals::FLASH;
use embassy_rp::Peri;
use spinor_hal::{FlashError, Geometry, NorFlashAdapter, RawFlash, Sector};

/// Flash part size on the supported boards (2 MiB)
pub const FLASH_SIZE: usize = 2 * 1024 * 1024;

/// Flash erase size for RP2040
pub const FLASH_ERASE_SIZE: usize = ERASE_SIZE;

type Driver<'d> = Flash<'d, FLASH, Async, FLASH_SIZE>;

/// RP2040 raw flash
pub struct Rp2040Flash<'d> {
    inner: NorFlashAdapter<Driver<'d>>,
}

impl<'d> Rp2040Flash<'d> {
    /// Expose the whole part
    pub fn new(flash: Peri<'d, FLASH>, dma: Peri<'d, impl Channel>) -> Result<Self, FlashError> {
        Ok(Self {
            inner: NorFlashAdapter::new(Flash::new(flash, dma))?,
        })
    }

    /// Expose `len` bytes starting at flash offset `base`
    ///
    /// Both must be multiples of [`FLASH_ERASE_SIZE`].
    pub fn with_window(
        flash: Peri<'d, FLASH>,
        dma: Peri<'d, impl Channel>,
        base: u32,
        len: u32,
    ) -> Result<Self, FlashError> {
        Ok(Self {
            inner: NorFlashAdapter::with_window(Flash::new(flash, dma), base, len)?,
        })
    }

    /// Get the embassy driver for low-level access
    pub fn into_driver(self) -> Driver<'d> {
        self.inner.into_inner()
    }
}

impl RawFlash for Rp2040Flash<'_> {
    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    async fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<(), FlashError> {
        self.inner.read_sector(sector, buf).await
    }

    async fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), FlashError> {
        self.inner.write_sector(sector, data).await
    }

    async fn erase_block(&mut self, block: u32) -> Result<(), FlashError> {
        self.inner.erase_block(block).await
    }

    async fn set_write_protect(&mut self, block: u32, enabled: bool) -> Result<(), FlashError> {
        self.inner.set_write_protect(block, enabled).await
    }
}
