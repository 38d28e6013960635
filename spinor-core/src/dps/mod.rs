//! Durable parameter store
//!
//! An append-only log of fixed-size records in one erase block. Every
//! write merges the change into the newest valid payload and appends a
//! fresh checksummed sector, so a torn append leaves the previous record
//! intact. Sector counters live in RAM only and are rebuilt from flash
//! by [`ParamStore::init`].
//!
//! The block is never erased in normal operation. Once every sector is
//! used, writes fail with [`Error::OutOfSectors`] until the owner runs
//! [`ParamStore::compact`] out of band.

pub mod record;
pub mod recovery;
pub mod typed;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use spinor_hal::{is_blank, RawFlash, Sector, BLANK_SECTOR};

use crate::config::ParamStoreConfig;
use crate::error::Error;

pub use record::PAYLOAD_SIZE;
pub use recovery::{BoundarySearch, Recovery};
pub use typed::TypedParams;

/// Snapshot of the log counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StoreStatus {
    /// Sectors consumed since the last erase
    pub programmed: u32,
    /// Newest sector holding a verified record
    pub valid: Option<u32>,
    /// Sectors in the block
    pub budget: u32,
}

impl StoreStatus {
    /// Appends left before the block is exhausted
    pub const fn remaining(&self) -> u32 {
        self.budget - self.programmed
    }
}

/// Log state guarded by the store mutex
struct Log<F> {
    flash: F,
    block: u32,
    first_sector: u32,
    budget: u32,
    verify_tail: bool,
    programmed: u32,
    valid: Option<u32>,
    /// Copy of the valid record, or blank when there is none
    cache: Sector,
}

impl<F: RawFlash> Log<F> {
    async fn recover(&mut self) -> Result<(), Error> {
        let mut sector = BLANK_SECTOR;

        let mut search = BoundarySearch::new(self.budget);
        while let Some(mid) = search.next_midpoint() {
            self.flash
                .read_sector(self.first_sector + mid, &mut sector)
                .await?;
            search.record(!is_blank(&sector));
        }
        let mut programmed = search.finish();

        if self.verify_tail {
            for index in (programmed..self.budget).rev() {
                self.flash
                    .read_sector(self.first_sector + index, &mut sector)
                    .await?;
                if !is_blank(&sector) {
                    warn!("dps: non-blank sector {} past boundary {}", index, programmed);
                    programmed = index + 1;
                    break;
                }
            }
        }

        self.programmed = programmed;
        self.valid = None;
        self.cache = BLANK_SECTOR;
        for index in (0..programmed).rev() {
            self.flash
                .read_sector(self.first_sector + index, &mut sector)
                .await?;
            if record::verify_record(&sector) {
                self.valid = Some(index);
                self.cache = sector;
                break;
            }
            warn!("dps: sector {} fails checksum", index);
        }

        debug!(
            "dps: block {} programmed {} valid {}",
            self.block, self.programmed, self.valid
        );
        Ok(())
    }

    async fn append(&mut self, record: &Sector) -> Result<(), Error> {
        if self.programmed >= self.budget {
            return Err(Error::OutOfSectors);
        }
        let slot = self.programmed;

        self.flash.set_write_protect(self.block, false).await?;
        // The slot is spent even if the program fails
        self.programmed += 1;
        let written = self.flash.write_sector(self.first_sector + slot, record).await;
        let relocked = self.flash.set_write_protect(self.block, true).await;

        if let Err(e) = written {
            error!("dps: append to sector {} failed: {}", slot, e);
            return Err(e.into());
        }
        self.valid = Some(slot);
        self.cache = *record;
        relocked?;
        Ok(())
    }

    async fn compact(&mut self) -> Result<(), Error> {
        let current = self.valid.map(|_| self.cache);

        self.flash.set_write_protect(self.block, false).await?;
        if let Err(e) = self.flash.erase_block(self.block).await {
            error!("dps: erase of block {} failed: {}", self.block, e);
            // The erase error is the one reported
            let _ = self.flash.set_write_protect(self.block, true).await;
            return Err(e.into());
        }
        self.programmed = 0;
        self.valid = None;
        self.cache = BLANK_SECTOR;

        match current {
            Some(record) => self.append(&record).await,
            None => Ok(self.flash.set_write_protect(self.block, true).await?),
        }
    }

    /// Refuse further appends until the counters are rebuilt
    fn poison(&mut self) {
        self.programmed = self.budget;
    }

    fn status(&self) -> StoreStatus {
        StoreStatus {
            programmed: self.programmed,
            valid: self.valid,
            budget: self.budget,
        }
    }
}

/// Append-only parameter log in one reserved erase block
pub struct ParamStore<M: RawMutex, F> {
    inner: Mutex<M, Log<F>>,
}

impl<M: RawMutex, F: RawFlash> ParamStore<M, F> {
    /// Open the store and rebuild its counters from flash
    pub async fn init(flash: F, config: ParamStoreConfig) -> Result<Self, Error> {
        let geometry = flash.geometry();
        if config.block >= geometry.block_count {
            return Err(Error::InvalidRange);
        }

        let mut log = Log {
            flash,
            block: config.block,
            first_sector: geometry.first_sector(config.block),
            budget: geometry.sectors_per_block,
            verify_tail: config.verify_tail,
            programmed: 0,
            valid: None,
            cache: BLANK_SECTOR,
        };
        log.recover().await?;
        info!(
            "dps: mounted block {}, {} of {} sectors used",
            log.block, log.programmed, log.budget
        );

        Ok(Self {
            inner: Mutex::new(log),
        })
    }

    /// Replace `data.len()` payload bytes at `offset` and append the
    /// merged record
    pub async fn write(&self, offset: usize, data: &[u8]) -> Result<(), Error> {
        let end = payload_end(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let mut log = self.inner.lock().await;
        let mut record = log.cache;
        record::payload_mut(&mut record)[offset..end].copy_from_slice(data);
        record::seal(&mut record);
        log.append(&record).await
    }

    /// Copy `buf.len()` bytes of the current payload at `offset`
    pub async fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        let log = self.inner.lock().await;
        if log.valid.is_none() {
            return Err(Error::NotFound);
        }
        let end = payload_end(offset, buf.len())?;
        buf.copy_from_slice(&record::payload(&log.cache)[offset..end]);
        Ok(())
    }

    /// Current counters
    pub async fn status(&self) -> StoreStatus {
        self.inner.lock().await.status()
    }

    /// Erase the block and rewrite the current record as sector 0
    ///
    /// Not crash-atomic: losing power between the erase and the rewrite
    /// loses the stored record. On failure the counters are rebuilt from
    /// whatever reached flash; if that rebuild fails too, writes return
    /// [`Error::OutOfSectors`] until [`ParamStore::reload`] succeeds.
    pub async fn compact(&self) -> Result<(), Error> {
        let mut log = self.inner.lock().await;
        info!("dps: compacting block {}", log.block);
        if let Err(e) = log.compact().await {
            if let Err(reload) = log.recover().await {
                error!("dps: block {} unreadable after compact: {}", log.block, reload);
                log.poison();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Discard the counters and rebuild them from flash
    pub async fn reload(&self) -> Result<(), Error> {
        self.inner.lock().await.recover().await
    }

    /// Release the flash
    pub fn into_inner(self) -> F {
        self.inner.into_inner().flash
    }
}

fn payload_end(offset: usize, len: usize) -> Result<usize, Error> {
    match offset.checked_add(len) {
        Some(end) if end <= PAYLOAD_SIZE => Ok(end),
        _ => Err(Error::InvalidRange),
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use spinor_hal::sim::{FlashOp, RamFlash};
    use spinor_hal::{FlashError, Geometry};

    use super::*;

    type Store = ParamStore<NoopRawMutex, RamFlash>;

    const GEO: Geometry = Geometry::new(8, 4);

    fn open(flash: RamFlash) -> Store {
        block_on(Store::init(flash, ParamStoreConfig::new(2))).unwrap()
    }

    #[test]
    fn test_empty_store() {
        let store = open(RamFlash::new(GEO));
        let mut buf = [0u8; 4];
        assert_eq!(block_on(store.read(0, &mut buf)), Err(Error::NotFound));
        assert_eq!(
            block_on(store.status()),
            StoreStatus {
                programmed: 0,
                valid: None,
                budget: 8
            }
        );
    }

    #[test]
    fn test_block_outside_device() {
        let result = block_on(Store::init(RamFlash::new(GEO), ParamStoreConfig::new(4)));
        assert!(matches!(result, Err(Error::InvalidRange)));
    }

    #[test]
    fn test_write_merges_into_previous_payload() {
        let store = open(RamFlash::new(GEO));
        block_on(store.write(0, &[1, 2, 3, 4])).unwrap();
        block_on(store.write(2, &[9])).unwrap();

        let mut buf = [0u8; 6];
        block_on(store.read(0, &mut buf)).unwrap();
        assert_eq!(buf, [1, 2, 9, 4, 0xFF, 0xFF]);
    }

    #[test]
    fn test_range_checks() {
        let store = open(RamFlash::new(GEO));
        assert_eq!(
            block_on(store.write(PAYLOAD_SIZE - 1, &[0, 0])),
            Err(Error::InvalidRange)
        );
        assert_eq!(block_on(store.write(usize::MAX, &[0])), Err(Error::InvalidRange));

        block_on(store.write(PAYLOAD_SIZE - 1, &[7])).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(
            block_on(store.read(PAYLOAD_SIZE - 1, &mut buf)),
            Err(Error::InvalidRange)
        );
        assert_eq!(block_on(store.status()).programmed, 1);
    }

    #[test]
    fn test_protection_only_lifted_for_program() {
        let store = open(RamFlash::new(GEO));
        block_on(store.write(0, &[1])).unwrap();
        let flash = store.into_inner();
        assert_eq!(
            flash.ops(),
            &[
                // recovery reads
                FlashOp::Read(20),
                FlashOp::Read(18),
                FlashOp::Read(17),
                FlashOp::Read(16),
                FlashOp::Protect {
                    block: 2,
                    enabled: false
                },
                FlashOp::Write(16),
                FlashOp::Protect {
                    block: 2,
                    enabled: true
                },
            ]
        );
    }

    #[test]
    fn test_failed_program_consumes_slot() {
        let mut flash = RamFlash::new(GEO);
        flash.fail_next_writes(1);
        let store = open(flash);

        assert_eq!(
            block_on(store.write(0, &[5])),
            Err(Error::Flash(FlashError::Device))
        );
        let status = block_on(store.status());
        assert_eq!((status.programmed, status.valid), (1, None));

        block_on(store.write(0, &[6])).unwrap();
        let status = block_on(store.status());
        assert_eq!((status.programmed, status.valid), (2, Some(1)));
    }

    #[test]
    fn test_compact_keeps_current_record() {
        let store = open(RamFlash::new(GEO));
        for i in 0..8u8 {
            block_on(store.write(0, &[i])).unwrap();
        }
        assert_eq!(block_on(store.write(0, &[8])), Err(Error::OutOfSectors));

        block_on(store.compact()).unwrap();
        assert_eq!(
            block_on(store.status()),
            StoreStatus {
                programmed: 1,
                valid: Some(0),
                budget: 8
            }
        );
        let mut buf = [0u8; 1];
        block_on(store.read(0, &mut buf)).unwrap();
        assert_eq!(buf, [7]);
    }

    #[test]
    fn test_compact_empty_store() {
        let store = open(RamFlash::new(GEO));
        block_on(store.compact()).unwrap();
        assert_eq!(block_on(store.status()).programmed, 0);
    }

    #[test]
    fn test_empty_write_appends_nothing() {
        let store = open(RamFlash::new(GEO));
        block_on(store.write(3, &[])).unwrap();
        block_on(store.write(PAYLOAD_SIZE, &[])).unwrap();
        assert_eq!(block_on(store.status()).programmed, 0);
        assert_eq!(
            block_on(store.write(PAYLOAD_SIZE + 1, &[])),
            Err(Error::InvalidRange)
        );
        assert_eq!(store.into_inner().write_count(), 0);
    }

    #[test]
    fn test_failed_erase_keeps_log_and_protection() {
        let store = open(RamFlash::new(GEO));
        for i in 0..8u8 {
            block_on(store.write(0, &[i])).unwrap();
        }
        let before = block_on(store.status());

        let mut flash = store.into_inner();
        flash.fail_next_erases(1);
        let store = open(flash);
        assert_eq!(
            block_on(store.compact()),
            Err(Error::Flash(FlashError::Device))
        );
        assert_eq!(block_on(store.status()), before);
        let mut buf = [0u8; 1];
        block_on(store.read(0, &mut buf)).unwrap();
        assert_eq!(buf, [7]);

        let flash = store.into_inner();
        assert!(flash.is_protected(2));
        let last_toggle = flash
            .ops()
            .iter()
            .rev()
            .find(|op| matches!(op, FlashOp::Protect { .. }));
        assert_eq!(
            last_toggle,
            Some(&FlashOp::Protect {
                block: 2,
                enabled: true
            })
        );
    }

    #[test]
    fn test_unreadable_block_after_failed_compact_refuses_writes() {
        let store = open(RamFlash::new(GEO));
        block_on(store.write(0, &[1])).unwrap();

        let mut flash = store.into_inner();
        flash.cut_power_on_next_erase();
        let store = open(flash);
        assert_eq!(
            block_on(store.compact()),
            Err(Error::Flash(FlashError::Device))
        );
        assert_eq!(block_on(store.status()).remaining(), 0);
        assert_eq!(block_on(store.write(0, &[2])), Err(Error::OutOfSectors));

        let mut flash = store.into_inner();
        flash.restore_power();
        let store = open(flash);
        block_on(store.write(0, &[2])).unwrap();
        let mut buf = [0u8; 1];
        block_on(store.read(0, &mut buf)).unwrap();
        assert_eq!(buf, [2]);
        assert!(store.into_inner().is_protected(2));
    }

    #[test]
    fn test_reload_sees_external_corruption() {
        let store = open(RamFlash::new(GEO));
        block_on(store.write(0, &[1])).unwrap();
        block_on(store.write(0, &[2])).unwrap();

        let mut flash = store.into_inner();
        // Break the newest record's payload
        flash.poke(Geometry::sector_address(17) + 10, 0x00);
        let store = open(flash);
        block_on(store.reload()).unwrap();

        let mut buf = [0u8; 1];
        block_on(store.read(0, &mut buf)).unwrap();
        assert_eq!(buf, [1]);
        assert_eq!(block_on(store.status()).programmed, 2);
    }
}
