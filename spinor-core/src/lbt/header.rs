//! Physical block header
//!
//! Sector 0 of every mapped block names the logical block it holds:
//!
//! ```text
//! offset  size  field
//! 0       4     magic 0x314C_4254 (u32 LE)
//! 4       2     logical block number (u16 LE)
//! 6       2     0xFFFF
//! 8       4     sequence number (u32 LE, wrapping)
//! 12      4     checksum = word_sum(bytes 0..12) + 0x1234
//! 16..          0xFF
//! ```
//!
//! The header is the last sector programmed when a block is filled, so a
//! block with a valid header always holds a complete copy.

use spinor_hal::{is_blank, Sector, BLANK_SECTOR};

use crate::checksum::salted_sum;

/// Header magic, "TBL1" in flash byte order
pub const HEADER_MAGIC: u32 = 0x314C_4254;

const RESERVED: u16 = 0xFFFF;
const HEADER_WORDS: usize = 3;

/// Decoded block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockHeader {
    /// Logical block held by this physical block
    pub logical: u16,
    /// Relocation sequence; a newer copy has a larger wrapping value
    pub sequence: u32,
}

/// What a header sector contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaderState {
    /// Never programmed
    Blank,
    /// Torn or foreign contents
    Invalid,
    /// A committed header
    Valid(BlockHeader),
}

impl BlockHeader {
    /// Create a header
    pub const fn new(logical: u16, sequence: u32) -> Self {
        Self { logical, sequence }
    }

    /// Encode into a header sector
    pub fn encode(&self) -> Sector {
        let mut sector = BLANK_SECTOR;
        sector[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        sector[4..6].copy_from_slice(&self.logical.to_le_bytes());
        sector[6..8].copy_from_slice(&RESERVED.to_le_bytes());
        sector[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        let sum = salted_sum(&sector[..12], HEADER_WORDS);
        sector[12..16].copy_from_slice(&sum.to_le_bytes());
        sector
    }

    /// Decode a header sector
    pub fn decode(sector: &Sector) -> HeaderState {
        if is_blank(sector) {
            return HeaderState::Blank;
        }
        let word = |at: usize| {
            u32::from_le_bytes([sector[at], sector[at + 1], sector[at + 2], sector[at + 3]])
        };
        let logical = u16::from_le_bytes([sector[4], sector[5]]);
        let reserved = u16::from_le_bytes([sector[6], sector[7]]);
        if word(0) != HEADER_MAGIC
            || reserved != RESERVED
            || word(12) != salted_sum(&sector[..12], HEADER_WORDS)
        {
            return HeaderState::Invalid;
        }
        HeaderState::Valid(Self {
            logical,
            sequence: word(8),
        })
    }

    /// Whether this copy supersedes `other`
    pub const fn is_newer_than(&self, other: &Self) -> bool {
        (self.sequence.wrapping_sub(other.sequence) as i32) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_layout() {
        let sector = BlockHeader::new(3, 7).encode();
        assert_eq!(&sector[..4], b"TBL1");
        assert_eq!(&sector[4..8], &[3, 0, 0xFF, 0xFF]);
        assert_eq!(&sector[8..12], &[7, 0, 0, 0]);
        assert!(sector[16..].iter().all(|&b| b == 0xFF));
        assert_eq!(
            BlockHeader::decode(&sector),
            HeaderState::Valid(BlockHeader::new(3, 7))
        );
    }

    #[test]
    fn test_blank_and_torn_headers() {
        assert_eq!(BlockHeader::decode(&BLANK_SECTOR), HeaderState::Blank);

        // Power lost after the first eight bytes
        let full = BlockHeader::new(1, 1).encode();
        let mut torn = BLANK_SECTOR;
        torn[..8].copy_from_slice(&full[..8]);
        assert_eq!(BlockHeader::decode(&torn), HeaderState::Invalid);

        let mut flipped = full;
        flipped[9] ^= 0x01;
        assert_eq!(BlockHeader::decode(&flipped), HeaderState::Invalid);
    }

    #[test]
    fn test_sequence_wraps() {
        let old = BlockHeader::new(0, u32::MAX);
        let new = BlockHeader::new(0, 0);
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!new.is_newer_than(&new));
    }
}
