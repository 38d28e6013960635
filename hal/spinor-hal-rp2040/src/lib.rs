//! RP2040 backend for the Spinor raw flash trait
//!
//! The RP2040 executes from an external QSPI NOR part. This crate wraps
//! the embassy-rp flash driver so the storage core can use it:
//!
//! - Window selection over the 2 MiB part
//! - `RawFlash` implementation via `spinor_hal::NorFlashAdapter`

#![no_std]

pub mod flash;

pub use flash::{Rp2040Flash, FLASH_SIZE};
pub use spinor_hal::{FlashError, Geometry, RawFlash};
