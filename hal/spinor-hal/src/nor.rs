//! Adapter from `embedded-storage-async` NOR flash drivers
//!
//! Any HAL flash peripheral implementing
//! [`embedded_storage_async::nor_flash::NorFlash`] (embassy-rp, embassy-stm32,
//! ...) can be exposed as a [`RawFlash`] through [`NorFlashAdapter`]. The
//! adapter maps a block-aligned window of the device so sector and block
//! numbers start at zero at the window base.

use embedded_storage_async::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use crate::flash::{FlashError, Geometry, RawFlash, Sector, SECTOR_SIZE};

/// [`RawFlash`] implementation on top of an async NOR flash driver
pub struct NorFlashAdapter<F> {
    flash: F,
    base: u32,
    geometry: Geometry,
}

impl<F: NorFlash> NorFlashAdapter<F> {
    /// Expose the whole device
    pub fn new(flash: F) -> Result<Self, FlashError> {
        let capacity = u32::try_from(flash.capacity()).map_err(|_| FlashError::OutOfBounds)?;
        Self::with_window(flash, 0, capacity)
    }

    /// Expose `len` bytes starting at `base`
    ///
    /// Both must be multiples of the driver's erase size, which itself
    /// must be a multiple of [`SECTOR_SIZE`].
    pub fn with_window(flash: F, base: u32, len: u32) -> Result<Self, FlashError> {
        let erase_size = u32::try_from(F::ERASE_SIZE).map_err(|_| FlashError::Unaligned)?;
        if F::ERASE_SIZE % SECTOR_SIZE != 0 || SECTOR_SIZE % F::WRITE_SIZE != 0 {
            return Err(FlashError::Unaligned);
        }
        if base % erase_size != 0 || len % erase_size != 0 {
            return Err(FlashError::Unaligned);
        }
        let end = base.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end as usize > flash.capacity() {
            return Err(FlashError::OutOfBounds);
        }

        let sectors_per_block = erase_size / SECTOR_SIZE as u32;
        Ok(Self {
            flash,
            base,
            geometry: Geometry::new(sectors_per_block, len / erase_size),
        })
    }

    /// Give back the wrapped driver
    pub fn into_inner(self) -> F {
        self.flash
    }

    fn sector_offset(&self, sector: u32) -> Result<u32, FlashError> {
        if sector >= self.geometry.sector_count() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(self.base + Geometry::sector_address(sector))
    }

    fn block_offset(&self, block: u32) -> Result<u32, FlashError> {
        if block >= self.geometry.block_count {
            return Err(FlashError::OutOfBounds);
        }
        Ok(self.base + block * self.geometry.block_size())
    }
}

fn map_error<E: NorFlashError>(error: E) -> FlashError {
    match error.kind() {
        NorFlashErrorKind::NotAligned => FlashError::Unaligned,
        NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds,
        _ => FlashError::Device,
    }
}

impl<F: NorFlash> RawFlash for NorFlashAdapter<F> {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    async fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<(), FlashError> {
        let offset = self.sector_offset(sector)?;
        self.flash.read(offset, buf).await.map_err(map_error)
    }

    async fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), FlashError> {
        let offset = self.sector_offset(sector)?;
        self.flash.write(offset, data).await.map_err(map_error)
    }

    async fn erase_block(&mut self, block: u32) -> Result<(), FlashError> {
        let from = self.block_offset(block)?;
        let to = from + self.geometry.block_size();
        self.flash.erase(from, to).await.map_err(map_error)
    }

    async fn set_write_protect(&mut self, block: u32, _enabled: bool) -> Result<(), FlashError> {
        // embedded-storage has no notion of protection bits; only validate the target
        self.block_offset(block).map(|_| ())
    }
}
