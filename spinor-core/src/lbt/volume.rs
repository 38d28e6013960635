//! Mounted translator volume
//!
//! Owns the layout and tables of a ready translator and implements the
//! data path. Overwrites that only clear bits are programmed in place;
//! anything else relocates the logical block into a free physical block,
//! data sectors first and the header last.

use core::ops::Range;

use spinor_hal::{
    can_program_over, is_blank, RawFlash, Sector, BLANK_SECTOR, ERASED_BYTE, SECTOR_SIZE,
};

use super::header::BlockHeader;
use super::rebuild;
use super::table::{BlockState, LogicalBlockInfo, Tables};
use crate::error::Error;
use crate::layout::Layout;

const SECTOR_BYTES: u32 = SECTOR_SIZE as u32;

/// A logical block being copied into a new physical block
///
/// The copy is not part of the map until its header is programmed after
/// the last data sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Relocation {
    /// Logical block being moved
    pub logical: u32,
    /// Physical block holding the current copy, if any
    pub source: Option<u32>,
    /// Physical block receiving the new copy
    pub target: u32,
    /// Last data sector programmed into the target; `None` until the
    /// first non-blank sector lands
    pub last_write_sector: Option<u32>,
}

/// How blocks that leave the pool are handed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PoolChange {
    /// Blocks join the physical area. Logical blocks past the new range
    /// are refused and leaving blocks are erased for their new owner.
    Lend,
    /// Blocks fall under static protection. Logical blocks past the new
    /// range are discarded and leaving blocks are left as they are.
    Retire,
}

/// Copy the part of `chunk` that falls into data sector `index`
///
/// `chunk` starts `offset` bytes into the block's data area.
fn overlay(sector: &mut Sector, index: u32, offset: u32, chunk: &[u8]) {
    let start = index * SECTOR_BYTES;
    let end = start + SECTOR_BYTES;
    let lo = offset.max(start);
    let hi = (offset + chunk.len() as u32).min(end);
    if lo < hi {
        sector[(lo - start) as usize..(hi - start) as usize]
            .copy_from_slice(&chunk[(lo - offset) as usize..(hi - offset) as usize]);
    }
}

/// Layout and tables of a mounted translator
#[derive(Debug)]
pub struct Volume {
    layout: Layout,
    tables: Tables,
}

impl Volume {
    /// Rebuild the tables for `layout` from the block headers on flash
    pub async fn mount<F: RawFlash>(flash: &mut F, layout: Layout) -> Result<Self, Error> {
        let headers = rebuild::scan_headers(flash, &layout).await?;
        let tables = rebuild::resolve(&layout, &headers)?;
        drop(headers);

        info!(
            "lbt: mounted blocks {}..{}, {} used {} dirty {} unknown",
            layout.pool_start,
            layout.pool_start + layout.total_blocks,
            tables.count(BlockState::Used),
            tables.count(BlockState::Dirty),
            tables.count(BlockState::Unknown)
        );
        Ok(Self { layout, tables })
    }

    /// Layout the volume was mounted with
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Translation tables
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Logical bytes up to the end of the last mapped block
    pub fn used_size(&self) -> u32 {
        self.tables.used_blocks() * self.layout.per_block_capacity()
    }

    fn data_sector(&self, phys: u32, index: u32) -> u32 {
        self.layout.geometry.first_sector(phys) + 1 + index
    }

    fn data_sectors(&self) -> u32 {
        self.layout.geometry.sectors_per_block - 1
    }

    /// End of `len` bytes at `addr`, if inside the logical space
    fn span(&self, addr: u32, len: usize) -> Result<u32, Error> {
        u32::try_from(len)
            .ok()
            .and_then(|len| addr.checked_add(len))
            .filter(|&end| end <= self.layout.logical_size())
            .ok_or(Error::InvalidRange)
    }

    /// Read logical bytes; unmapped blocks read as erased
    pub async fn read<F: RawFlash>(
        &self,
        flash: &mut F,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let end = self.span(addr, buf.len())?;
        let capacity = self.layout.per_block_capacity();
        let mut sector = BLANK_SECTOR;
        let mut pos = addr;
        let mut done = 0;

        while pos < end {
            let logical = pos / capacity;
            let offset = pos % capacity;
            let index = offset / SECTOR_BYTES;
            let within = (offset % SECTOR_BYTES) as usize;
            let len = (SECTOR_SIZE - within).min((end - pos) as usize);
            let dst = &mut buf[done..done + len];

            match self.tables.lookup(logical) {
                Some(info) => {
                    flash
                        .read_sector(self.data_sector(info.phys, index), &mut sector)
                        .await?;
                    dst.copy_from_slice(&sector[within..within + len]);
                }
                None => dst.fill(ERASED_BYTE),
            }
            pos += len as u32;
            done += len;
        }
        Ok(())
    }

    /// Write logical bytes
    pub async fn write<F: RawFlash>(
        &mut self,
        flash: &mut F,
        addr: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let end = self.span(addr, data.len())?;
        let capacity = self.layout.per_block_capacity();
        let mut pos = addr;
        let mut done = 0;

        while pos < end {
            let logical = pos / capacity;
            let offset = pos % capacity;
            let len = (capacity - offset).min(end - pos) as usize;
            self.write_block(flash, logical, offset, &data[done..done + len])
                .await?;
            pos += len as u32;
            done += len;
        }
        Ok(())
    }

    async fn write_block<F: RawFlash>(
        &mut self,
        flash: &mut F,
        logical: u32,
        offset: u32,
        chunk: &[u8],
    ) -> Result<(), Error> {
        let current = self.tables.lookup(logical);
        if let Some(info) = current {
            if self.fits_in_place(flash, info.phys, offset, chunk).await? {
                return self.program_in_place(flash, info.phys, offset, chunk).await;
            }
        }
        self.relocate(flash, logical, current, offset, chunk).await
    }

    /// Data sectors touched by `chunk` at `offset`
    fn touched(offset: u32, chunk: &[u8]) -> core::ops::RangeInclusive<u32> {
        let last = offset + chunk.len() as u32 - 1;
        offset / SECTOR_BYTES..=last / SECTOR_BYTES
    }

    async fn fits_in_place<F: RawFlash>(
        &self,
        flash: &mut F,
        phys: u32,
        offset: u32,
        chunk: &[u8],
    ) -> Result<bool, Error> {
        let mut sector = BLANK_SECTOR;
        for index in Self::touched(offset, chunk) {
            flash
                .read_sector(self.data_sector(phys, index), &mut sector)
                .await?;
            let mut merged = sector;
            overlay(&mut merged, index, offset, chunk);
            if !can_program_over(&sector, &merged) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn program_in_place<F: RawFlash>(
        &self,
        flash: &mut F,
        phys: u32,
        offset: u32,
        chunk: &[u8],
    ) -> Result<(), Error> {
        let mut sector = BLANK_SECTOR;
        for index in Self::touched(offset, chunk) {
            let target = self.data_sector(phys, index);
            flash.read_sector(target, &mut sector).await?;
            let mut merged = sector;
            overlay(&mut merged, index, offset, chunk);
            if merged != sector {
                flash.write_sector(target, &merged).await?;
            }
        }
        Ok(())
    }

    async fn relocate<F: RawFlash>(
        &mut self,
        flash: &mut F,
        logical: u32,
        source: Option<LogicalBlockInfo>,
        offset: u32,
        chunk: &[u8],
    ) -> Result<(), Error> {
        let target = self.allocate(flash).await?;
        let sequence = source.map_or(0, |s| s.sequence.wrapping_add(1));
        let mut relocation = Relocation {
            logical,
            source: source.map(|s| s.phys),
            target,
            last_write_sector: None,
        };
        trace!("lbt: relocating {}", relocation);

        if let Err(e) = self
            .stage(flash, &mut relocation, sequence, offset, chunk)
            .await
        {
            warn!(
                "lbt: relocation of {} into {} failed after sector {}: {}",
                logical, target, relocation.last_write_sector, e
            );
            self.tables.set_state(target, BlockState::Dirty);
            return Err(e);
        }

        self.tables
            .set_mapping(logical, Some(LogicalBlockInfo { phys: target, sequence }));
        self.tables.set_state(target, BlockState::Used);
        if let Some(old) = relocation.source {
            self.tables.set_state(old, BlockState::Dirty);
        }
        Ok(())
    }

    async fn stage<F: RawFlash>(
        &self,
        flash: &mut F,
        relocation: &mut Relocation,
        sequence: u32,
        offset: u32,
        chunk: &[u8],
    ) -> Result<(), Error> {
        let mut sector = BLANK_SECTOR;
        for index in 0..self.data_sectors() {
            match relocation.source {
                Some(source) => {
                    flash
                        .read_sector(self.data_sector(source, index), &mut sector)
                        .await?
                }
                None => sector = BLANK_SECTOR,
            }
            overlay(&mut sector, index, offset, chunk);
            if !is_blank(&sector) {
                flash
                    .write_sector(self.data_sector(relocation.target, index), &sector)
                    .await?;
                relocation.last_write_sector = Some(index);
            }
        }

        let header = BlockHeader::new(relocation.logical as u16, sequence).encode();
        flash
            .write_sector(self.layout.geometry.first_sector(relocation.target), &header)
            .await?;
        Ok(())
    }

    /// Take a block from the free pool, erasing it if needed
    async fn allocate<F: RawFlash>(&mut self, flash: &mut F) -> Result<u32, Error> {
        let phys = self
            .tables
            .next_candidate()
            .ok_or(Error::InsufficientBlocks)?;
        match self.tables.state(phys) {
            BlockState::Dirty => self.erase(flash, phys).await?,
            BlockState::Unknown => {
                if self.is_erased(flash, phys).await? {
                    self.tables.set_state(phys, BlockState::Free);
                } else {
                    debug!("lbt: block {} has leftover data", phys);
                    self.erase(flash, phys).await?;
                }
            }
            BlockState::Free | BlockState::Used => {}
        }
        Ok(phys)
    }

    async fn is_erased<F: RawFlash>(&self, flash: &mut F, phys: u32) -> Result<bool, Error> {
        let geometry = self.layout.geometry;
        let first = geometry.first_sector(phys);
        let mut sector = BLANK_SECTOR;
        for index in first..first + geometry.sectors_per_block {
            flash.read_sector(index, &mut sector).await?;
            if !is_blank(&sector) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn erase<F: RawFlash>(&mut self, flash: &mut F, phys: u32) -> Result<(), Error> {
        flash.erase_block(phys).await?;
        self.tables.set_state(phys, BlockState::Free);
        Ok(())
    }

    /// Erase every dirty block
    pub async fn flush<F: RawFlash>(&mut self, flash: &mut F) -> Result<(), Error> {
        for phys in self.layout.pool() {
            if self.tables.state(phys) == BlockState::Dirty {
                self.erase(flash, phys).await?;
            }
        }
        Ok(())
    }

    /// Drop every logical block from the first block boundary at or
    /// after `addr`
    ///
    /// Stale copies are flushed first and trimmed blocks are erased
    /// right away, so a rebuild cannot bring any of them back.
    pub async fn trim<F: RawFlash>(&mut self, flash: &mut F, addr: u32) -> Result<(), Error> {
        let capacity = self.layout.per_block_capacity();
        let first = addr.div_ceil(capacity);
        if u64::from(first) * u64::from(capacity) > u64::from(self.layout.logical_size()) {
            return Err(Error::InvalidRange);
        }

        self.flush(flash).await?;
        for logical in first..self.tables.logical_blocks() {
            if let Some(info) = self.tables.lookup(logical) {
                self.erase(flash, info.phys).await?;
                self.tables.set_mapping(logical, None);
            }
        }
        debug!("lbt: trimmed from logical block {}", first);
        Ok(())
    }

    /// Blocks covered by a block-aligned byte range
    pub fn block_range(&self, addr: u32, size: u32) -> Result<Range<u32>, Error> {
        let block_size = self.layout.geometry.block_size();
        if addr % block_size != 0 || size % block_size != 0 {
            return Err(Error::InvalidRange);
        }
        let end = addr.checked_add(size).ok_or(Error::InvalidRange)?;
        Ok(addr / block_size..end / block_size)
    }

    /// Check that a block-aligned byte range lies in the boot-contiguous
    /// area or the physical area
    pub fn check_physical_area(&self, addr: u32, size: u32) -> Result<(), Error> {
        let blocks = self.block_range(addr, size)?;
        let boot = self.layout.boot_start..self.layout.boot_start + self.layout.boot_blocks;
        let lent = self.layout.physical();
        let joined = if boot.end == lent.start {
            boot.start..lent.end
        } else if lent.end == boot.start {
            lent.start..boot.end
        } else {
            boot.clone()
        };
        let inside = |area: &Range<u32>| blocks.start >= area.start && blocks.end <= area.end;
        if inside(&boot) || inside(&lent) || inside(&joined) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// Move the pool to `layout`
    ///
    /// Dirty blocks are flushed first. Data in blocks that leave the pool
    /// is relocated into the new pool. Blocks that join it are erased when
    /// their first two sectors hold data and checked lazily otherwise.
    pub async fn repartition<F: RawFlash>(
        &mut self,
        flash: &mut F,
        layout: Layout,
        change: PoolChange,
    ) -> Result<(), Error> {
        let addressable = layout.addressable_blocks();
        if change == PoolChange::Lend && self.tables.used_blocks() > addressable {
            return Err(Error::InvalidRange);
        }
        self.flush(flash).await?;
        for logical in addressable..self.tables.logical_blocks() {
            if let Some(info) = self.tables.lookup(logical) {
                warn!("lbt: discarding logical block {} in {}", logical, info.phys);
                self.erase(flash, info.phys).await?;
                self.tables.set_mapping(logical, None);
            }
        }

        let tables = self.tables.remap(&layout)?;
        let old = core::mem::replace(&mut self.layout, layout);
        let old_tables = core::mem::replace(&mut self.tables, tables);

        for phys in layout.pool().filter(|&phys| !old.contains(phys)) {
            if self.head_written(flash, phys).await? {
                self.erase(flash, phys).await?;
            }
        }
        for logical in 0..addressable {
            if let Some(info) = self.tables.lookup(logical) {
                if !layout.contains(info.phys) {
                    self.relocate(flash, logical, Some(info), 0, &[]).await?;
                }
            }
        }
        if change == PoolChange::Lend {
            for phys in old.pool().filter(|&phys| !layout.contains(phys)) {
                if old_tables.state(phys) != BlockState::Free {
                    flash.erase_block(phys).await?;
                }
            }
        }

        info!(
            "lbt: pool moved to {}..{}, physical area {}..{}",
            layout.pool_start,
            layout.pool_start + layout.total_blocks,
            layout.physical_start,
            layout.physical_start + layout.physical_blocks
        );
        Ok(())
    }

    /// Drop the unwritten tail of a physical area range
    ///
    /// Walks back from the last block: a block whose last sector is written
    /// is complete and ends the walk, a partly written block is erased and
    /// ends it, a blank block is skipped. Returns the bytes still in use.
    pub async fn trim_physical_area<F: RawFlash>(
        &mut self,
        flash: &mut F,
        addr: u32,
        size: u32,
    ) -> Result<u32, Error> {
        let blocks = self.block_range(addr, size)?;
        let lent = self.layout.physical();
        if blocks.start < lent.start || blocks.end > lent.end {
            return Err(Error::PermissionDenied);
        }

        self.flush(flash).await?;
        let geometry = self.layout.geometry;
        let mut kept = blocks.end - blocks.start;
        let mut sector = BLANK_SECTOR;
        for phys in blocks.rev() {
            let last = geometry.first_sector(phys) + geometry.sectors_per_block - 1;
            flash.read_sector(last, &mut sector).await?;
            if !is_blank(&sector) {
                break;
            }
            kept -= 1;
            if self.head_written(flash, phys).await? {
                flash.erase_block(phys).await?;
                break;
            }
        }
        Ok(kept * geometry.block_size())
    }

    /// Take an erased block out of circulation for an outside user
    pub async fn lend_block<F: RawFlash>(&mut self, flash: &mut F) -> Result<u32, Error> {
        let phys = self.allocate(flash).await?;
        // Unmapped but not allocatable until taken back
        self.tables.set_state(phys, BlockState::Used);
        debug!("lbt: lent block {}", phys);
        Ok(phys)
    }

    /// Return a lent block; it is erased before its next use
    pub fn take_back(&mut self, phys: u32) {
        let mapped = (0..self.tables.logical_blocks())
            .filter_map(|logical| self.tables.lookup(logical))
            .any(|info| info.phys == phys);
        if !mapped && self.tables.state(phys) == BlockState::Used {
            self.tables.set_state(phys, BlockState::Dirty);
        }
    }

    /// Whether either of the first two sectors of `phys` holds data
    async fn head_written<F: RawFlash>(&self, flash: &mut F, phys: u32) -> Result<bool, Error> {
        let first = self.layout.geometry.first_sector(phys);
        let mut sector = BLANK_SECTOR;
        for index in first..first + 2 {
            flash.read_sector(index, &mut sector).await?;
            if !is_blank(&sector) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
