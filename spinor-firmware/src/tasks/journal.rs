//! Boot journal on the logical block translator
//!
//! Each boot writes one fixed-size entry into a ring at the start of the
//! logical address space, then flushes so dirty blocks are erased while
//! the system is idle.

use defmt::*;

use crate::storage::Lbt;

/// Bytes per journal entry
pub const ENTRY_SIZE: usize = 16;

/// Upper bound on ring slots
pub const MAX_SLOTS: u32 = 64;

/// Marker in the first byte of a written entry
const ENTRY_TAG: u8 = 0xB0;

/// Build the entry for boot number `boots`
fn encode_entry(boots: u32) -> [u8; ENTRY_SIZE] {
    let mut entry = [0xFF; ENTRY_SIZE];
    entry[0] = ENTRY_TAG;
    entry[1..5].copy_from_slice(&boots.to_le_bytes());
    entry
}

/// Journal task - records this boot and releases the translator
#[embassy_executor::task]
pub async fn journal_task(translator: &'static Lbt, boots: u32) {
    info!("Journal task started");

    let handle = match translator.init().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Translator init failed: {}", e);
            return;
        }
    };

    let slots = (handle.logical_size() / ENTRY_SIZE as u32).min(MAX_SLOTS);
    if slots == 0 {
        warn!("Logical space too small for a journal");
        handle.release().await;
        return;
    }
    let addr = (boots % slots) * ENTRY_SIZE as u32;

    let entry = encode_entry(boots);
    if let Err(e) = handle.write(addr, &entry).await {
        error!("Journal write at {} failed: {}", addr, e);
    } else {
        let mut readback = [0u8; ENTRY_SIZE];
        match handle.read(addr, &mut readback).await {
            Ok(()) if readback == entry => debug!("Journal entry {} verified", boots),
            Ok(()) => warn!("Journal entry {} read back different", boots),
            Err(e) => warn!("Journal readback failed: {}", e),
        }
    }

    if let Err(e) = handle.flush().await {
        warn!("Flush failed: {}", e);
    }
    match handle.used_size().await {
        Ok(used) => info!("Translator holds {} of {} bytes", used, handle.logical_size()),
        Err(e) => warn!("Used size unavailable: {}", e),
    }

    handle.release().await;
    let stats = translator.stats().await;
    info!(
        "Journal task done ({} rebuilds, {} teardowns)",
        stats.rebuilds, stats.teardowns
    );
}
