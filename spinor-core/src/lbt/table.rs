//! In-memory translation tables

use alloc::vec::Vec;

use crate::error::Error;
use crate::layout::Layout;

/// Physical block state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockState {
    /// Erased and ready for allocation
    Free,
    /// Holds the current copy of a logical block
    Used,
    /// Holds stale data; erase before use
    Dirty,
    /// Blank header but contents not verified
    Unknown,
}

/// Where a logical block currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LogicalBlockInfo {
    /// Physical block number
    pub phys: u32,
    /// Sequence number in its header
    pub sequence: u32,
}

/// Allocate a vector of `len` copies of `value`, failing instead of
/// aborting when the heap is exhausted
pub(crate) fn try_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>, Error> {
    let mut vec = Vec::new();
    vec.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    vec.resize(len, value);
    Ok(vec)
}

/// Logical map plus physical free table
#[derive(Debug)]
pub struct Tables {
    pool_start: u32,
    map: Vec<Option<LogicalBlockInfo>>,
    states: Vec<BlockState>,
    cursor: usize,
}

impl Tables {
    /// Empty map over the pool of `layout`, every block `Unknown`
    pub fn new(layout: &Layout) -> Result<Self, Error> {
        Ok(Self {
            pool_start: layout.pool_start,
            map: try_filled(layout.addressable_blocks() as usize, None)?,
            states: try_filled(layout.total_blocks as usize, BlockState::Unknown)?,
            cursor: 0,
        })
    }

    /// Carry the tables over to the pool of `layout`
    ///
    /// Blocks that stay in the pool keep their state and blocks that join
    /// it start `Unknown`. Mappings past the new addressable range are
    /// dropped, so callers move or discard them first.
    pub fn remap(&self, layout: &Layout) -> Result<Self, Error> {
        let mut tables = Self::new(layout)?;
        for (slot, info) in tables.map.iter_mut().zip(&self.map) {
            *slot = *info;
        }
        for phys in layout.pool() {
            if let Some(index) = phys.checked_sub(self.pool_start) {
                if let Some(state) = self.states.get(index as usize) {
                    tables.set_state(phys, *state);
                }
            }
        }
        Ok(tables)
    }

    /// Current location of `logical`
    pub fn lookup(&self, logical: u32) -> Option<LogicalBlockInfo> {
        self.map.get(logical as usize).copied().flatten()
    }

    /// Point `logical` at `info`, or unmap it
    pub fn set_mapping(&mut self, logical: u32, info: Option<LogicalBlockInfo>) {
        if let Some(slot) = self.map.get_mut(logical as usize) {
            *slot = info;
        }
    }

    /// Addressable logical blocks
    pub fn logical_blocks(&self) -> u32 {
        self.map.len() as u32
    }

    /// State of physical block `phys`
    pub fn state(&self, phys: u32) -> BlockState {
        phys.checked_sub(self.pool_start)
            .and_then(|index| self.states.get(index as usize))
            .copied()
            .unwrap_or(BlockState::Used)
    }

    /// Set the state of physical block `phys`
    pub fn set_state(&mut self, phys: u32, state: BlockState) {
        let slot = phys
            .checked_sub(self.pool_start)
            .and_then(|index| self.states.get_mut(index as usize));
        if let Some(slot) = slot {
            *slot = state;
        }
    }

    /// Physical blocks in `state`
    pub fn blocks_in(&self, state: BlockState) -> impl Iterator<Item = u32> + '_ {
        let pool_start = self.pool_start;
        self.states
            .iter()
            .enumerate()
            .filter(move |(_, s)| **s == state)
            .map(move |(index, _)| pool_start + index as u32)
    }

    /// Number of physical blocks in `state`
    pub fn count(&self, state: BlockState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }

    /// Next block to allocate, round robin from the cursor
    ///
    /// Erased blocks are preferred over ones that still need an erase or
    /// a blank check.
    pub fn next_candidate(&mut self) -> Option<u32> {
        let len = self.states.len();
        let cursor = self.cursor;
        let order = (0..len).map(move |step| (cursor + step) % len);
        let index = order
            .clone()
            .find(|&i| self.states[i] == BlockState::Free)
            .or_else(|| order.clone().find(|&i| self.states[i] != BlockState::Used))?;
        self.cursor = (index + 1) % len;
        Some(self.pool_start + index as u32)
    }

    /// Number of logical blocks up to and including the last mapped one
    pub fn used_blocks(&self) -> u32 {
        self.map
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |index| index as u32 + 1)
    }
}
