//! Salted word-sum checksum
//!
//! Non-cryptographic; it only has to catch torn or corrupted appends.

/// Additive salt mixed into every checksum
pub const CHECKSUM_SALT: u32 = 0x1234;

/// Wrapping sum of the first `words` little-endian 32-bit words of `data`
///
/// A trailing partial word is ignored, as are words past the end of `data`.
pub fn word_sum(data: &[u8], words: usize) -> u32 {
    data.chunks_exact(4)
        .take(words)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold(0u32, u32::wrapping_add)
}

/// [`word_sum`] plus [`CHECKSUM_SALT`]
pub fn salted_sum(data: &[u8], words: usize) -> u32 {
    word_sum(data, words).wrapping_add(CHECKSUM_SALT)
}
