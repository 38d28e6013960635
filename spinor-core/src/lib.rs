//! Board-agnostic NOR flash storage
//!
//! This crate holds everything above the raw flash driver:
//!
//! - Write guard refusing erases and programs on protected regions
//! - Logical block translator with boot-time table rebuild
//! - Durable parameter store (append-only checksummed log)
//! - Layout and configuration types
//!
//! ```text
//!   ┌─────────────────┐   ┌─────────────────┐
//!   │ lbt::Translator │   │ dps::ParamStore │
//!   └────────┬────────┘   └────────┬────────┘
//!            └───────────┬─────────┘
//!             ┌──────────┴───────────┐
//!             │ guard::WriteGuard    │
//!             └──────────┬───────────┘
//!             ┌──────────┴───────────┐
//!             │ spinor_hal::RawFlash │
//!             └──────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod checksum;
pub mod config;
pub mod dps;
pub mod error;
pub mod guard;
pub mod layout;
pub mod lbt;
pub mod shared;

pub use config::{FirmwareImage, ParamStoreConfig, TranslatorConfig};
pub use dps::{ParamStore, StoreStatus, TypedParams};
pub use error::Error;
pub use guard::{
    BypassFlag, BypassToken, Halt, PanicHalt, ProtectedRegion, RegionKind, Violation, WriteGuard,
};
pub use layout::Layout;
pub use lbt::{LbtHandle, LbtState, LentBlock, Translator, TranslatorStats};
pub use shared::SharedFlash;
