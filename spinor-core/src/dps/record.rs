//! Parameter record encoding
//!
//! One record fills one sector:
//!
//! ```text
//! offset  size  field
//! 0       4     checksum (u32 LE) = word_sum(payload, 127) + 0x1234
//! 4       508   payload
//! ```

use spinor_hal::{Sector, SECTOR_SIZE};

use crate::checksum::salted_sum;

/// Bytes taken by the checksum
pub const CHECKSUM_SIZE: usize = 4;

/// Payload bytes per record
pub const PAYLOAD_SIZE: usize = SECTOR_SIZE - CHECKSUM_SIZE;

/// Payload length in 32-bit words
pub const PAYLOAD_WORDS: usize = PAYLOAD_SIZE / 4;

/// Checksum of a record payload
pub fn checksum(payload: &[u8]) -> u32 {
    salted_sum(payload, PAYLOAD_WORDS)
}

/// Write the checksum of the payload into the record header
pub fn seal(record: &mut Sector) {
    let sum = checksum(payload(record));
    record[..CHECKSUM_SIZE].copy_from_slice(&sum.to_le_bytes());
}

/// Whether the stored checksum matches the payload
pub fn verify_record(record: &Sector) -> bool {
    let stored = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    stored == checksum(payload(record))
}

/// Payload of a record
pub fn payload(record: &Sector) -> &[u8] {
    &record[CHECKSUM_SIZE..]
}

/// Payload of a record, mutably
pub fn payload_mut(record: &mut Sector) -> &mut [u8] {
    &mut record[CHECKSUM_SIZE..]
}
