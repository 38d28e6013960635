//! Logical block translator behaviour against the simulated NOR flash

use std::sync::Barrier;

use embassy_futures::join::join;
use embassy_futures::{block_on, yield_now};
use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, NoopRawMutex};
use proptest::prelude::*;
use spinor_core::lbt::{BlockHeader, LbtState};
use spinor_core::{Error, FirmwareImage, Translator, TranslatorConfig, TranslatorStats};
use spinor_hal::sim::{FlashOp, RamFlash};
use spinor_hal::{FlashError, Geometry, RawFlash, SECTOR_SIZE};

// 16 blocks of 4 sectors; firmware in blocks 1..4, pool is blocks 4..16
const GEO: Geometry = Geometry::new(4, 16);
const BLOCK: u32 = 2048;
const CAPACITY: u32 = 3 * 512;
const POOL_START: u32 = 4;

type Lbt = Translator<NoopRawMutex, RamFlash>;

fn config() -> TranslatorConfig {
    TranslatorConfig::new(FirmwareImage::new(BLOCK, 3 * BLOCK))
}

fn translator(flash: RamFlash) -> Lbt {
    Translator::new(flash, config())
}

/// Write `data` at `addr` through a fresh handle
fn write(lbt: &Lbt, addr: u32, data: &[u8]) -> Result<(), Error> {
    block_on(async {
        let handle = lbt.init().await?;
        let result = handle.write(addr, data).await;
        handle.release().await;
        result
    })
}

fn read(lbt: &Lbt, addr: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    block_on(async {
        let handle = lbt.init().await.unwrap();
        handle.read(addr, &mut buf).await.unwrap();
        handle.release().await;
    });
    buf
}

/// Program a block header and one data sector directly
fn place_block(flash: &mut RamFlash, phys: u32, logical: u16, sequence: u32, fill: u8) {
    let first = GEO.first_sector(phys);
    block_on(flash.write_sector(first + 1, &[fill; SECTOR_SIZE])).unwrap();
    block_on(flash.write_sector(first, &BlockHeader::new(logical, sequence).encode())).unwrap();
}

#[test]
fn test_fresh_device_reads_erased() {
    let lbt = translator(RamFlash::new(GEO));
    assert_eq!(read(&lbt, 100, 8), vec![0xFF; 8]);

    let size = block_on(async {
        let handle = lbt.init().await.unwrap();
        let size = handle.logical_size();
        handle.release().await;
        size
    });
    assert_eq!(size, 11 * CAPACITY);
}

#[test]
fn test_range_checks() {
    let lbt = translator(RamFlash::new(GEO));
    let size = 11 * CAPACITY;
    assert_eq!(write(&lbt, size - 1, &[0, 0]), Err(Error::InvalidRange));
    assert_eq!(write(&lbt, u32::MAX, &[0]), Err(Error::InvalidRange));
    assert_eq!(write(&lbt, size - 1, &[0]), Ok(()));
}

#[test]
fn test_write_spanning_blocks() {
    let lbt = translator(RamFlash::new(GEO));
    let data: Vec<u8> = (0..2 * CAPACITY).map(|i| i as u8).collect();
    write(&lbt, CAPACITY / 2, &data).unwrap();

    assert_eq!(read(&lbt, CAPACITY / 2, data.len()), data);
    assert_eq!(read(&lbt, 0, 4), vec![0xFF; 4]);

    // Three logical blocks got a header each
    let flash = lbt.into_inner();
    let headers = (POOL_START..16)
        .filter(|&phys| flash.sector(GEO.first_sector(phys))[..4] == *b"TBL1")
        .count();
    assert_eq!(headers, 3);
}

#[test]
fn test_clearing_bits_programs_in_place() {
    let lbt = translator(RamFlash::new(GEO));
    write(&lbt, 0, &[0xF0; 16]).unwrap();

    let mut flash = lbt.into_inner();
    flash.clear_ops();
    let lbt = translator(flash);
    write(&lbt, 4, &[0x30; 4]).unwrap();

    let flash = lbt.into_inner();
    assert_eq!(flash.write_count(), 1);
    assert_eq!(flash.erase_count(), 0);

    let lbt = translator(flash);
    let mut expected = vec![0xF0; 16];
    expected[4..8].fill(0x30);
    assert_eq!(read(&lbt, 0, 16), expected);
}

#[test]
fn test_setting_bits_relocates() {
    let lbt = translator(RamFlash::new(GEO));
    block_on(async {
        let handle = lbt.init().await.unwrap();
        handle.write(0, &[0x00; 600]).await.unwrap();
        handle.write(10, &[0xAB; 4]).await.unwrap();

        let mut buf = [0u8; 600];
        handle.read(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..10], &[0x00; 10]);
        assert_eq!(&buf[10..14], &[0xAB; 4]);
        assert!(buf[14..].iter().all(|&b| b == 0x00));

        // The stale copy is erased by a flush
        handle.flush().await.unwrap();
        handle.release().await;
    });

    let flash = lbt.into_inner();
    let headers: Vec<_> = (POOL_START..16)
        .filter_map(|phys| {
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(flash.sector(GEO.first_sector(phys)));
            match BlockHeader::decode(&sector) {
                spinor_core::lbt::HeaderState::Valid(header) => Some(header),
                _ => None,
            }
        })
        .collect();
    assert_eq!(headers, vec![BlockHeader::new(0, 1)]);
    assert_eq!(flash.erase_count(), 1);
}

#[test]
fn test_data_survives_reboot() {
    let lbt = translator(RamFlash::new(GEO));
    write(&lbt, 3 * CAPACITY + 7, b"persistent").unwrap();
    write(&lbt, 3 * CAPACITY + 7, b"PERSISTENT").unwrap();

    let lbt = translator(lbt.into_inner());
    assert_eq!(read(&lbt, 3 * CAPACITY + 7, 10), b"PERSISTENT".to_vec());
}

#[test]
fn test_crash_before_header_keeps_old_copy() {
    let lbt = translator(RamFlash::new(GEO));
    write(&lbt, 0, &[0x00; 8]).unwrap();

    let mut flash = lbt.into_inner();
    // The relocation programs one data sector, then tears the header
    flash.cut_power_after(1, 8);
    let lbt = translator(flash);
    assert_eq!(
        write(&lbt, 0, &[0x11; 8]),
        Err(Error::Flash(FlashError::Device))
    );

    let mut flash = lbt.into_inner();
    flash.restore_power();
    let lbt = translator(flash);
    assert_eq!(read(&lbt, 0, 8), vec![0x00; 8]);

    // The torn block is reclaimed and the write can be reissued
    write(&lbt, 0, &[0x11; 8]).unwrap();
    assert_eq!(read(&lbt, 0, 8), vec![0x11; 8]);
}

#[test]
fn test_duplicate_headers_resolve_to_newer() {
    let mut flash = RamFlash::new(GEO);
    place_block(&mut flash, 5, 2, 7, 0xAA);
    place_block(&mut flash, 9, 2, 8, 0xBB);
    place_block(&mut flash, 12, 2, 6, 0xCC);

    let lbt = translator(flash);
    assert_eq!(read(&lbt, 2 * CAPACITY, 4), vec![0xBB; 4]);

    block_on(async {
        let handle = lbt.init().await.unwrap();
        handle.flush().await.unwrap();
        handle.release().await;
    });
    let flash = lbt.into_inner();
    let erased: Vec<_> = flash
        .ops()
        .iter()
        .filter_map(|op| match op {
            FlashOp::Erase(block) => Some(*block),
            _ => None,
        })
        .collect();
    assert_eq!(erased, vec![5, 12]);
}

#[test]
fn test_trim_frees_tail_blocks() {
    let lbt = translator(RamFlash::new(GEO));
    for logical in 0..4 {
        write(&lbt, logical * CAPACITY, &[logical as u8; 4]).unwrap();
    }

    block_on(async {
        let handle = lbt.init().await.unwrap();
        assert_eq!(handle.used_size().await, Ok(4 * CAPACITY));
        // Rounds up to the boundary of logical block 2
        handle.trim(CAPACITY + 1).await.unwrap();
        assert_eq!(handle.used_size().await, Ok(2 * CAPACITY));
        assert_eq!(
            handle.trim(12 * CAPACITY).await,
            Err(Error::InvalidRange)
        );
        handle.release().await;
    });

    // Trimmed blocks stay gone across a rebuild
    let lbt = translator(lbt.into_inner());
    assert_eq!(read(&lbt, CAPACITY, 4), vec![1; 4]);
    assert_eq!(read(&lbt, 2 * CAPACITY, 4), vec![0xFF; 4]);
    assert_eq!(read(&lbt, 3 * CAPACITY, 4), vec![0xFF; 4]);
}

#[test]
fn test_trim_does_not_resurrect_stale_copy() {
    let lbt = translator(RamFlash::new(GEO));
    write(&lbt, 0, &[0x00; 4]).unwrap();
    // Relocates, leaving the first copy dirty
    write(&lbt, 0, &[0xFF; 4]).unwrap();
    block_on(async {
        let handle = lbt.init().await.unwrap();
        handle.trim(0).await.unwrap();
        handle.release().await;
    });

    let lbt = translator(lbt.into_inner());
    assert_eq!(read(&lbt, 0, 4), vec![0xFF; 4]);
    let used = block_on(async {
        let handle = lbt.init().await.unwrap();
        let used = handle.used_size().await;
        handle.release().await;
        used
    });
    assert_eq!(used, Ok(0));
}

#[test]
fn test_every_logical_block_writable_twice() {
    // Fills the addressable space and rewrites it, which only works if
    // the reserve block is always available for relocation
    let lbt = translator(RamFlash::new(GEO));
    for round in 0..2u8 {
        for logical in 0..11 {
            write(&lbt, logical * CAPACITY, &[round ^ 0x5A; 32]).unwrap();
        }
    }
    for logical in 0..11 {
        assert_eq!(read(&lbt, logical * CAPACITY, 32), vec![0x5B; 32]);
    }
}

#[test]
fn test_insufficient_blocks() {
    let config =
        TranslatorConfig::new(FirmwareImage::new(BLOCK, 3 * BLOCK)).with_reserved_blocks(11);
    let lbt = Translator::<NoopRawMutex, _>::new(RamFlash::new(GEO), config);
    let result = block_on(async { lbt.init().await.map(|h| h.logical_size()) });
    assert_eq!(result, Err(Error::InsufficientBlocks));
    assert_eq!(block_on(lbt.state()), LbtState::Uninitialized);
}

#[test]
fn test_concurrent_init_on_one_executor() {
    let lbt = translator(RamFlash::new(GEO));
    block_on(async {
        let (a, b) = join(lbt.init(), lbt.init()).await;
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(lbt.refcount().await, 2);
        join(a.release(), async {
            yield_now().await;
            b.release().await
        })
        .await;
    });
    assert_eq!(
        block_on(lbt.stats()),
        TranslatorStats {
            rebuilds: 1,
            teardowns: 1
        }
    );
    // One header scan over the twelve pool blocks
    let flash = lbt.into_inner();
    assert_eq!(
        flash.ops().iter().filter(|op| matches!(op, FlashOp::Read(_))).count(),
        12
    );
}

#[test]
fn test_concurrent_init_across_threads() {
    const USERS: usize = 8;
    let lbt: Translator<CriticalSectionRawMutex, RamFlash> =
        Translator::new(RamFlash::new(GEO), config());
    let barrier = Barrier::new(USERS);

    std::thread::scope(|s| {
        for _ in 0..USERS {
            s.spawn(|| {
                let handle = block_on(lbt.init()).unwrap();
                barrier.wait();
                block_on(handle.release());
            });
        }
    });

    assert_eq!(block_on(lbt.refcount()), 0);
    assert_eq!(block_on(lbt.state()), LbtState::Uninitialized);
    assert_eq!(
        block_on(lbt.stats()),
        TranslatorStats {
            rebuilds: 1,
            teardowns: 1
        }
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_matches_model_across_reboot(
        writes in prop::collection::vec((0u32..11 * CAPACITY - 64, 1usize..64, any::<u8>()), 1..24)
    ) {
        let size = (11 * CAPACITY) as usize;
        let mut model = vec![0xFFu8; size];
        let lbt = translator(RamFlash::new(GEO));
        for (addr, len, byte) in &writes {
            write(&lbt, *addr, &vec![*byte; *len]).unwrap();
            model[*addr as usize..*addr as usize + len].fill(*byte);
        }
        prop_assert_eq!(read(&lbt, 0, size), model.clone());

        let lbt = translator(lbt.into_inner());
        prop_assert_eq!(read(&lbt, 0, size), model);
    }
}
