//! Boot-time table rebuild
//!
//! Every pool block's header is read into a scratch table first, then the
//! scratch table is resolved into the logical map and free table. The
//! scratch table is dropped before the translator becomes ready.

use alloc::vec::Vec;

use spinor_hal::{RawFlash, BLANK_SECTOR};

use super::header::{BlockHeader, HeaderState};
use super::table::{try_filled, BlockState, LogicalBlockInfo, Tables};
use crate::error::Error;
use crate::layout::Layout;

/// Read the header sector of every pool block
pub async fn scan_headers<F: RawFlash>(
    flash: &mut F,
    layout: &Layout,
) -> Result<Vec<HeaderState>, Error> {
    let mut headers = try_filled(layout.total_blocks as usize, HeaderState::Blank)?;
    let mut sector = BLANK_SECTOR;
    for (slot, phys) in headers.iter_mut().zip(layout.pool()) {
        flash
            .read_sector(layout.geometry.first_sector(phys), &mut sector)
            .await?;
        *slot = BlockHeader::decode(&sector);
    }
    Ok(headers)
}

/// Build the tables from the scanned headers
///
/// `headers[i]` belongs to physical block `layout.pool_start + i`.
pub fn resolve(layout: &Layout, headers: &[HeaderState]) -> Result<Tables, Error> {
    let mut tables = Tables::new(layout)?;
    let logical_blocks = tables.logical_blocks();

    for (phys, header) in layout.pool().zip(headers) {
        let header = match *header {
            HeaderState::Blank => {
                tables.set_state(phys, BlockState::Unknown);
                continue;
            }
            HeaderState::Invalid => {
                tables.set_state(phys, BlockState::Dirty);
                continue;
            }
            HeaderState::Valid(header) if u32::from(header.logical) >= logical_blocks => {
                warn!("lbt: block {} maps out of range logical {}", phys, header.logical);
                tables.set_state(phys, BlockState::Dirty);
                continue;
            }
            HeaderState::Valid(header) => header,
        };

        let logical = u32::from(header.logical);
        let candidate = LogicalBlockInfo {
            phys,
            sequence: header.sequence,
        };
        match tables.lookup(logical) {
            None => {
                tables.set_mapping(logical, Some(candidate));
                tables.set_state(phys, BlockState::Used);
            }
            Some(current) => {
                let current_header = BlockHeader::new(header.logical, current.sequence);
                let (winner, loser) = if header.is_newer_than(&current_header) {
                    (candidate, current)
                } else {
                    (current, candidate)
                };
                debug!(
                    "lbt: logical {} in blocks {} and {}, keeping {}",
                    logical, current.phys, phys, winner.phys
                );
                tables.set_mapping(logical, Some(winner));
                tables.set_state(winner.phys, BlockState::Used);
                tables.set_state(loser.phys, BlockState::Dirty);
            }
        }
    }

    Ok(tables)
}
