//! Storage stack wiring
//!
//! One guarded flash device behind a mutex, shared by the translator and
//! the parameter store. Everything lives in static cells so tasks can hold
//! `'static` references.

use defmt::*;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use serde::{Deserialize, Serialize};
use spinor_core::{
    BypassFlag, Error, FirmwareImage, Layout, ParamStore, ParamStoreConfig, SharedFlash,
    Translator, TranslatorConfig, TypedParams, WriteGuard,
};
use spinor_hal_rp2040::{RawFlash, Rp2040Flash};
use static_cell::StaticCell;

mod generated {
    include!(concat!(env!("OUT_DIR"), "/flash_layout.rs"));
}

pub use generated::*;

pub type Guarded = WriteGuard<'static, Rp2040Flash<'static>>;
pub type Device = Mutex<CriticalSectionRawMutex, Guarded>;
pub type Shared = SharedFlash<'static, CriticalSectionRawMutex, Guarded>;
pub type Lbt = Translator<CriticalSectionRawMutex, Shared>;
pub type Params = ParamStore<CriticalSectionRawMutex, Shared>;

/// Lifted only while an image update is in progress
pub static BYPASS: BypassFlag = BypassFlag::new();

static DEVICE: StaticCell<Device> = StaticCell::new();
static TRANSLATOR: StaticCell<Lbt> = StaticCell::new();
static PARAMS: StaticCell<Params> = StaticCell::new();

/// Persistent boot bookkeeping kept at offset 0 of the parameter store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Format)]
pub struct BootInfo {
    /// Boots seen so far, this one included
    pub boots: u32,
}

/// Mounted storage stack
pub struct Storage {
    pub layout: Layout,
    pub translator: &'static Lbt,
    pub params: &'static Params,
}

/// Translator configuration from flash_layout.toml
pub const fn translator_config() -> TranslatorConfig {
    TranslatorConfig::new(FirmwareImage::new(FIRMWARE_START, FIRMWARE_LEN))
        .with_metadata_sectors(METADATA_SECTORS)
        .with_protected_blocks(PROTECTED_BLOCKS)
        .with_reserved_blocks(RESERVED_BLOCKS)
}

/// Guard the flash and mount both storage users on it
pub async fn mount(flash: Rp2040Flash<'static>) -> Result<Storage, Error> {
    let config = translator_config();
    let layout = Layout::compute(flash.geometry(), &config)?;
    info!(
        "Pool blocks {}..{}, {} bytes addressable",
        layout.pool_start,
        layout.pool_start + layout.total_blocks,
        layout.logical_size()
    );

    let mut guard = WriteGuard::new(flash, &BYPASS);
    guard.protect_layout(&layout, &config)?;
    let device: &'static Device = DEVICE.init(Mutex::new(guard));

    let translator = TRANSLATOR.init(Translator::new(SharedFlash::new(device).await, config));

    let param_config = ParamStoreConfig::new(layout.reserved_start + PARAM_RESERVED_INDEX)
        .with_verify_tail(VERIFY_TAIL);
    let params = ParamStore::init(SharedFlash::new(device).await, param_config).await?;
    let params = PARAMS.init(params);

    Ok(Storage {
        layout,
        translator,
        params,
    })
}

/// Count this boot in the parameter store
///
/// A full log is compacted once and the save retried.
pub async fn record_boot(params: &'static Params) -> Result<BootInfo, Error> {
    let slot: TypedParams<'_, _, _, BootInfo> = TypedParams::new(params);
    let previous = match slot.load().await {
        Ok(info) => info,
        Err(Error::NotFound) => {
            info!("No boot record, starting from zero");
            BootInfo::default()
        }
        Err(e) => {
            warn!("Boot record unreadable: {}", e);
            BootInfo::default()
        }
    };

    let info = BootInfo {
        boots: previous.boots.wrapping_add(1),
    };
    match slot.save(&info).await {
        Err(Error::OutOfSectors) => {
            info!("Parameter log full, compacting");
            params.compact().await?;
            slot.save(&info).await?;
        }
        other => other?,
    }

    let status = params.status().await;
    debug!(
        "Parameter log: {} programmed, {} remaining",
        status.programmed,
        status.remaining()
    );
    Ok(info)
}
