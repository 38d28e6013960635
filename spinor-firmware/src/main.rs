//! Spinor - NOR flash storage firmware
//!
//! Bring-up firmware for RP2040 boards. Mounts the storage stack on the
//! QSPI part behind the write guard, counts boots in the parameter store
//! and appends a boot journal entry through the logical block translator.

#![no_std]
#![no_main]

extern crate alloc;

use defmt::*;
use embassy_executor::Spawner;
use embedded_alloc::LlffHeap as Heap;
use spinor_hal_rp2040::Rp2040Flash;
use {defmt_rtt as _, panic_probe as _};

mod storage;
mod tasks;

// Heap allocator for the translator tables
#[global_allocator]
static HEAP: Heap = Heap::empty();

// Heap size: 16KB
const HEAP_SIZE: usize = 16 * 1024;

/// Main entry point
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Spinor firmware starting...");

    // Initialize heap allocator
    init_heap();

    let p = embassy_rp::init(Default::default());

    let flash = unwrap!(Rp2040Flash::new(p.FLASH, p.DMA_CH2));
    let storage = unwrap!(storage::mount(flash).await);
    info!(
        "Storage mounted: parameter block {}, firmware {}..{}",
        storage.layout.reserved_start + storage::PARAM_RESERVED_INDEX,
        storage::FIRMWARE_START,
        storage::FIRMWARE_START + storage::FIRMWARE_LEN
    );

    let boot = match storage::record_boot(storage.params).await {
        Ok(boot) => boot,
        Err(e) => {
            error!("Boot counter not saved: {}", e);
            storage::BootInfo::default()
        }
    };
    info!("Boot #{}", boot.boots);

    spawner
        .spawn(tasks::journal_task(storage.translator, boot.boots))
        .unwrap();

    info!("All tasks spawned, firmware running");
}

/// Initialize the heap allocator
fn init_heap() {
    use core::mem::MaybeUninit;
    static mut HEAP_MEM: [MaybeUninit<u8>; HEAP_SIZE] = [MaybeUninit::uninit(); HEAP_SIZE];
    #[allow(static_mut_refs)]
    unsafe {
        HEAP.init(HEAP_MEM.as_ptr() as usize, HEAP_SIZE)
    }
}
