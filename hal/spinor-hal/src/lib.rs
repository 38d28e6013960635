//! Spinor Hardware Abstraction Layer
//!
//! This crate defines the raw flash trait that chip-specific HALs
//! implement (RP2040, Actions SoCs, ...). The storage core in
//! `spinor-core` is written against it, so the same translator and
//! parameter store run on any part and on the host simulator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  spinor-core (guard, LBT, DPS)          │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  spinor-hal (this crate - RawFlash)     │
//! └─────────────────────────────────────────┘
//!                     │
//!         ┌───────────┼───────────────┐
//!         ▼           ▼               ▼
//! ┌─────────────┐ ┌──────────┐ ┌──────────────┐
//! │ nor adapter │ │ sim (RAM)│ │ spinor-hal-  │
//! │ (e-s-async) │ │          │ │   rp2040     │
//! └─────────────┘ └──────────┘ └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`flash`] - [`RawFlash`] trait, geometry, and error type
//! - [`nor`] - adapter for `embedded-storage-async` NOR drivers
//! - `sim` - RAM-backed NOR simulator (feature `sim`)

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

#[cfg(feature = "sim")]
extern crate alloc;

pub mod flash;
pub mod nor;
#[cfg(feature = "sim")]
pub mod sim;

// Re-export key items at crate root for convenience
pub use flash::{
    can_program_over, is_blank, FlashError, Geometry, RawFlash, Sector, BLANK_SECTOR, ERASED_BYTE,
    SECTOR_SIZE,
};
pub use nor::NorFlashAdapter;
