//! Logical block translator
//!
//! Presents the pool of physical blocks next to the firmware image as a
//! linear logical address space. Tables live in RAM only and are rebuilt
//! from the block headers when the first user calls [`Translator::init`];
//! they are freed again when the last [`LbtHandle`] is released.
//!
//! ```text
//!            init (refcount 0 -> 1)          release (refcount 1 -> 0)
//! Uninitialized ──► Initializing ──► Ready ──► Releasing ──► Uninitialized
//!                                   ▲   │
//!                                   └───┘ init / release (refcount > 1)
//! ```

pub mod header;
pub mod rebuild;
pub mod table;
pub mod volume;

use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use spinor_hal::{RawFlash, Sector};

use crate::config::TranslatorConfig;
use crate::error::Error;
use crate::layout::{FirmwareSide, Layout};

pub use header::{BlockHeader, HeaderState, HEADER_MAGIC};
pub use table::{BlockState, LogicalBlockInfo};
pub use volume::{PoolChange, Relocation, Volume};

/// Translator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LbtState {
    /// No tables in memory
    Uninitialized,
    /// First user is rebuilding the tables
    Initializing,
    /// Tables available
    Ready,
    /// Last user is freeing the tables
    Releasing,
}

/// Lifecycle counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TranslatorStats {
    /// Completed table rebuilds
    pub rebuilds: u32,
    /// Completed teardowns
    pub teardowns: u32,
}

/// State guarded by the translator mutex
struct Slot<F> {
    flash: F,
    config: TranslatorConfig,
    state: LbtState,
    refcount: u32,
    volume: Option<Volume>,
    stats: TranslatorStats,
}

impl<F: RawFlash> Slot<F> {
    async fn mount(&mut self) -> Result<(), Error> {
        let layout = Layout::compute(self.flash.geometry(), &self.config)?;
        self.volume = Some(Volume::mount(&mut self.flash, layout).await?);
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut F, &mut Volume), Error> {
        match self.volume.as_mut() {
            Some(volume) => Ok((&mut self.flash, volume)),
            None => Err(Error::Uninitialized),
        }
    }

    /// Move the pool to the layout `config` describes
    ///
    /// Returns the layouts before and after. The config is kept once the
    /// volume has switched, so a later mount places the pool the same way
    /// even if the data move failed part way.
    async fn repartition(
        &mut self,
        config: TranslatorConfig,
        change: PoolChange,
    ) -> Result<(Layout, Layout), Error> {
        let layout = Layout::compute(self.flash.geometry(), &config)?;
        let volume = self.volume.as_mut().ok_or(Error::Uninitialized)?;
        let old = *volume.layout();
        let result = volume.repartition(&mut self.flash, layout, change).await;
        if *volume.layout() == layout {
            self.config = config;
        }
        result.map(|()| (old, layout))
    }
}

/// Reference-counted logical block translator over one flash device
pub struct Translator<M: RawMutex, F> {
    inner: Mutex<M, Slot<F>>,
    logical_size: AtomicU32,
}

impl<M: RawMutex, F: RawFlash> Translator<M, F> {
    /// Create an uninitialized translator
    pub const fn new(flash: F, config: TranslatorConfig) -> Self {
        Self {
            inner: Mutex::new(Slot {
                flash,
                config,
                state: LbtState::Uninitialized,
                refcount: 0,
                volume: None,
                stats: TranslatorStats {
                    rebuilds: 0,
                    teardowns: 0,
                },
            }),
            logical_size: AtomicU32::new(0),
        }
    }

    /// Acquire a handle, rebuilding the tables if this is the first one
    ///
    /// Concurrent callers wait for the rebuild and then share its result.
    pub async fn init(&self) -> Result<LbtHandle<'_, M, F>, Error> {
        let mut slot = self.inner.lock().await;

        if slot.refcount == 0 {
            slot.state = LbtState::Initializing;
            if let Err(e) = slot.mount().await {
                error!("lbt: init failed: {}", e);
                slot.volume = None;
                slot.state = LbtState::Uninitialized;
                return Err(e);
            }
            slot.state = LbtState::Ready;
            slot.stats.rebuilds += 1;
        }

        let logical_size = slot.parts()?.1.layout().logical_size();
        self.logical_size.store(logical_size, Ordering::Relaxed);
        slot.refcount += 1;
        trace!("lbt: init, refcount {}", slot.refcount);

        Ok(LbtHandle { translator: self })
    }

    async fn release(&self) {
        let mut slot = self.inner.lock().await;
        slot.refcount = slot.refcount.saturating_sub(1);
        trace!("lbt: release, refcount {}", slot.refcount);

        if slot.refcount == 0 && slot.volume.is_some() {
            slot.state = LbtState::Releasing;
            slot.volume = None;
            slot.state = LbtState::Uninitialized;
            slot.stats.teardowns += 1;
            debug!("lbt: tables freed");
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> LbtState {
        self.inner.lock().await.state
    }

    /// Lifecycle counters
    pub async fn stats(&self) -> TranslatorStats {
        self.inner.lock().await.stats
    }

    /// Number of live handles
    pub async fn refcount(&self) -> u32 {
        self.inner.lock().await.refcount
    }

    /// Layout of the mounted volume, if any
    pub async fn layout(&self) -> Option<Layout> {
        self.inner
            .lock()
            .await
            .volume
            .as_ref()
            .map(|volume| *volume.layout())
    }

    /// Configuration the next mount will use
    pub async fn config(&self) -> TranslatorConfig {
        self.inner.lock().await.config
    }

    /// Release the flash
    pub fn into_inner(self) -> F {
        self.inner.into_inner().flash
    }
}

/// A user's reference to an initialized translator
///
/// Must be given back with [`LbtHandle::release`]; dropping it keeps the
/// tables alive.
#[must_use = "release the handle to free the translator tables"]
pub struct LbtHandle<'a, M: RawMutex, F> {
    translator: &'a Translator<M, F>,
}

impl<'a, M: RawMutex, F: RawFlash> LbtHandle<'a, M, F> {
    /// Usable logical size in bytes
    ///
    /// Follows physical area changes made through any handle.
    pub fn logical_size(&self) -> u32 {
        self.translator.logical_size.load(Ordering::Relaxed)
    }

    fn publish(&self, layout: &Layout) {
        self.translator
            .logical_size
            .store(layout.logical_size(), Ordering::Relaxed);
    }

    /// Read `buf.len()` bytes at logical address `addr`
    pub async fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        let mut slot = self.translator.inner.lock().await;
        let (flash, volume) = slot.parts()?;
        volume.read(flash, addr, buf).await
    }

    /// Write `data` at logical address `addr`
    pub async fn write(&self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let mut slot = self.translator.inner.lock().await;
        let (flash, volume) = slot.parts()?;
        volume.write(flash, addr, data).await
    }

    /// Erase stale block copies ahead of later writes
    pub async fn flush(&self) -> Result<(), Error> {
        let mut slot = self.translator.inner.lock().await;
        let (flash, volume) = slot.parts()?;
        volume.flush(flash).await
    }

    /// Discard logical blocks from the first block boundary at or after
    /// `addr` to the end of the space
    pub async fn trim(&self, addr: u32) -> Result<(), Error> {
        let mut slot = self.translator.inner.lock().await;
        let (flash, volume) = slot.parts()?;
        volume.trim(flash, addr).await
    }

    /// Logical bytes up to the end of the last mapped block
    pub async fn used_size(&self) -> Result<u32, Error> {
        let mut slot = self.translator.inner.lock().await;
        Ok(slot.parts()?.1.used_size())
    }

    /// Validate a block-aligned physical range for an image update
    ///
    /// The range must lie inside the boot-contiguous area or the physical
    /// area.
    pub async fn check_physical_area(&self, addr: u32, size: u32) -> Result<(), Error> {
        let mut slot = self.translator.inner.lock().await;
        slot.parts()?.1.check_physical_area(addr, size)
    }

    /// Lend at least `size` bytes of pool blocks to the physical area
    ///
    /// Returns the newly lent byte range, rounded up to whole blocks. Data
    /// in those blocks is moved first and the blocks are handed over
    /// erased. Fails with [`Error::InvalidRange`] while logical data lives
    /// past the shrunk logical size; trim it first.
    pub async fn new_physical_area(&self, size: u32) -> Result<Range<u32>, Error> {
        let mut slot = self.translator.inner.lock().await;
        let block_size = slot.flash.geometry().block_size();
        let blocks = size.div_ceil(block_size);
        if blocks == 0 {
            return Err(Error::InvalidRange);
        }
        let physical_blocks = slot
            .config
            .physical_blocks
            .checked_add(blocks)
            .ok_or(Error::InsufficientBlocks)?;
        let config = slot.config.with_physical_blocks(physical_blocks);
        let result = slot.repartition(config, PoolChange::Lend).await;
        self.publish(slot.parts()?.1.layout());

        let (old, new) = result?;
        let (old, new) = (old.physical_region(), new.physical_region());
        let lent = if new.start < old.start {
            new.start..old.start
        } else {
            old.end..new.end
        };
        info!("lbt: lent {}..{} as physical area", lent.start, lent.end);
        Ok(lent)
    }

    /// Give a byte range of the physical area back to the pool
    ///
    /// Only the blocks next to the pool can go back. Blocks whose first
    /// two sectors hold data are erased.
    pub async fn del_physical_area(&self, addr: u32, size: u32) -> Result<(), Error> {
        let mut slot = self.translator.inner.lock().await;
        let geometry = slot.flash.geometry();
        let (blocks, current) = {
            let volume = slot.parts()?.1;
            (volume.block_range(addr, size)?, volume.layout().physical())
        };
        if blocks.is_empty() {
            return Err(Error::InvalidRange);
        }
        if blocks.start < current.start || blocks.end > current.end {
            return Err(Error::PermissionDenied);
        }

        let remaining = (current.end - current.start) - (blocks.end - blocks.start);
        let config = slot.config.with_physical_blocks(remaining);
        let shrunk = Layout::compute(geometry, &config)?.physical();
        let returned = if shrunk.start > current.start {
            current.start..shrunk.start
        } else {
            shrunk.end..current.end
        };
        if returned != blocks {
            return Err(Error::PermissionDenied);
        }

        let result = slot.repartition(config, PoolChange::Lend).await;
        self.publish(slot.parts()?.1.layout());
        result.map(|_| ())
    }

    /// Drop the unwritten tail of a physical area range
    ///
    /// Returns the bytes still in use, counted from `addr`.
    pub async fn trim_physical_area(&self, addr: u32, size: u32) -> Result<u32, Error> {
        let mut slot = self.translator.inner.lock().await;
        let (flash, volume) = slot.parts()?;
        volume.trim_physical_area(flash, addr, size).await
    }

    /// Move translator data out of the blocks below `protected_blocks`
    ///
    /// Used by a back-half firmware before it protects a longer leading
    /// range. Those blocks leave the pool; logical blocks that no longer
    /// fit the smaller pool are discarded. Returns `None` when there is
    /// nothing to move, otherwise the used logical size afterwards.
    pub async fn evacuate_protected(&self, protected_blocks: u32) -> Result<Option<u32>, Error> {
        let mut slot = self.translator.inner.lock().await;
        let layout = *slot.parts()?.1.layout();
        if layout.side == FirmwareSide::Front || protected_blocks <= layout.pool_start {
            return Ok(None);
        }

        let config = slot.config.with_protected_blocks(protected_blocks);
        let result = slot.repartition(config, PoolChange::Retire).await;
        let volume = slot.parts()?.1;
        self.publish(volume.layout());
        result?;
        Ok(Some(volume.used_size()))
    }

    /// Borrow an erased pool block for an outside user
    ///
    /// The translator stays locked until the [`LentBlock`] is dropped.
    pub async fn lend_block(&self) -> Result<LentBlock<'a, M, F>, Error> {
        let mut slot = self.translator.inner.lock().await;
        let (flash, volume) = slot.parts()?;
        let block = volume.lend_block(flash).await?;
        Ok(LentBlock { slot, block })
    }

    /// Give the handle back; the last release frees the tables
    pub async fn release(self) {
        self.translator.release().await;
    }
}

/// A pool block on loan to an outside user
///
/// Holds the translator lock. Dropping it returns the block to the pool
/// as dirty, so it is erased before the translator uses it again.
pub struct LentBlock<'a, M: RawMutex, F> {
    slot: MutexGuard<'a, M, Slot<F>>,
    block: u32,
}

impl<M: RawMutex, F: RawFlash> LentBlock<'_, M, F> {
    /// Physical block number
    pub fn block(&self) -> u32 {
        self.block
    }

    fn sector(&self, index: u32) -> Result<u32, Error> {
        let geometry = self.slot.flash.geometry();
        if index >= geometry.sectors_per_block {
            return Err(Error::InvalidRange);
        }
        Ok(geometry.first_sector(self.block) + index)
    }

    /// Read sector `index` of the block
    pub async fn read_sector(&mut self, index: u32, buf: &mut Sector) -> Result<(), Error> {
        let sector = self.sector(index)?;
        Ok(self.slot.flash.read_sector(sector, buf).await?)
    }

    /// Program sector `index` of the block
    pub async fn write_sector(&mut self, index: u32, data: &Sector) -> Result<(), Error> {
        let sector = self.sector(index)?;
        Ok(self.slot.flash.write_sector(sector, data).await?)
    }
}

impl<M: RawMutex, F> Drop for LentBlock<'_, M, F> {
    fn drop(&mut self) {
        if let Some(volume) = self.slot.volume.as_mut() {
            volume.take_back(self.block);
            debug!("lbt: block {} returned", self.block);
        }
    }
}
