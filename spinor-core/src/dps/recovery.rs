//! Boot-time recovery of the parameter log
//!
//! Records are appended in sector order, so the block is a programmed
//! prefix followed by blank sectors. Recovery finds that boundary with a
//! binary search and then walks backwards to the newest record whose
//! checksum verifies.
//!
//! The search is a bisection state machine with no I/O of its own: the
//! caller reads whichever sector [`BoundarySearch::next_midpoint`] names and
//! reports back. The store drives it over flash; [`recover_image`]
//! drives it over an in-memory block image.

use spinor_hal::{is_blank, Sector};

use super::record::verify_record;

/// Binary search for the first blank sector of the log
///
/// Invariant: every sector below `lo` is programmed and every sector at
/// or above `hi` is blank. The search is settled when the bounds meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BoundarySearch {
    lo: u32,
    hi: u32,
}

impl BoundarySearch {
    /// Search a log of `budget` sectors
    pub const fn new(budget: u32) -> Self {
        Self { lo: 0, hi: budget }
    }

    /// Sector to read next, or `None` once settled
    pub const fn next_midpoint(&self) -> Option<u32> {
        if self.lo < self.hi {
            Some(self.lo + (self.hi - self.lo) / 2)
        } else {
            None
        }
    }

    /// Report whether the midpoint sector is programmed
    pub fn record(&mut self, programmed: bool) {
        let Some(mid) = self.next_midpoint() else {
            return;
        };
        if programmed {
            self.lo = mid + 1;
        } else {
            self.hi = mid;
        }
    }

    /// Whether no further read is needed
    pub const fn is_settled(&self) -> bool {
        self.lo >= self.hi
    }

    /// Number of programmed sectors
    ///
    /// Decided from the bounds alone; on an unsettled search this is the
    /// lower bound.
    pub const fn finish(&self) -> u32 {
        self.lo
    }
}

/// Result of scanning a log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Recovery {
    /// Sectors consumed
    pub programmed: u32,
    /// Newest sector whose checksum verifies
    pub valid: Option<u32>,
}

/// Programmed count by a forward linear scan for the first blank sector
pub fn linear_programmed_count(image: &[Sector]) -> u32 {
    image
        .iter()
        .position(|sector| is_blank(sector))
        .unwrap_or(image.len()) as u32
}

/// Programmed count by binary search
pub fn programmed_count(image: &[Sector]) -> u32 {
    let mut search = BoundarySearch::new(image.len() as u32);
    while let Some(mid) = search.next_midpoint() {
        search.record(!is_blank(&image[mid as usize]));
    }
    search.finish()
}

/// Move the boundary past any non-blank sector beyond it
///
/// A program that failed without touching the cells leaves a blank hole
/// the binary search can stop at; everything after it was still
/// appended.
pub fn extend_past_tail(image: &[Sector], programmed: u32) -> u32 {
    image
        .iter()
        .enumerate()
        .skip(programmed as usize)
        .rev()
        .find(|(_, sector)| !is_blank(&sector[..]))
        .map_or(programmed, |(index, _)| index as u32 + 1)
}

/// Newest sector below `programmed` that holds a verified record
pub fn latest_valid(image: &[Sector], programmed: u32) -> Option<u32> {
    (0..programmed.min(image.len() as u32))
        .rev()
        .find(|&index| verify_record(&image[index as usize]))
}

/// Run recovery over an in-memory block image
pub fn recover_image(image: &[Sector], verify_tail: bool) -> Recovery {
    let mut programmed = programmed_count(image);
    if verify_tail {
        programmed = extend_past_tail(image, programmed);
    }
    Recovery {
        programmed,
        valid: latest_valid(image, programmed),
    }
}
