//! Storage error type
//!
//! Capacity, resource and integrity failures are ordinary control flow
//! for callers. Write guard violations never show up here: they halt.

use spinor_hal::FlashError;

/// Errors from the translator and the parameter store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Parameter block has no unused sector left; erase it out of band
    OutOfSectors,
    /// Offset or length outside the addressable range
    InvalidRange,
    /// Fewer than two physical blocks available to the translator
    InsufficientBlocks,
    /// In-memory tables could not be allocated
    OutOfMemory,
    /// No committed value yet
    NotFound,
    /// Range lies outside the area the caller may touch
    PermissionDenied,
    /// Handle used after the translator tables were released
    Uninitialized,
    /// Value does not fit the parameter payload
    Encode,
    /// Stored payload does not decode as the requested type
    Decode,
    /// Raw flash operation failed
    Flash(FlashError),
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Error::Flash(e)
    }
}
