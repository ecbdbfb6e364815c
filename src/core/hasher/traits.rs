//! Trait definitions for perceptual hash methods.

use crate::error::HashError;
use image::DynamicImage;

/// A perceptual hash method
///
/// Implementations are pure: the same image always yields the same hex
/// string, and every string a method produces has the same length.
pub trait HashMethod: Send + Sync {
    /// Compute the hash of an already-decoded image as lowercase hex
    fn hash_image(&self, image: &DynamicImage) -> Result<String, HashError>;

    /// Number of bits in every hash this method produces
    fn bit_count(&self) -> u32;

    /// Length of the hex string this method produces
    ///
    /// Hashes are packed into whole bytes, so a partial last byte still
    /// takes two hex digits.
    fn hex_len(&self) -> usize {
        (self.bit_count() as usize).div_ceil(8) * 2
    }

    /// Short human-readable description
    fn description(&self) -> &'static str;
}

/// Pack a sequence of bits (most significant first) into lowercase hex.
///
/// A trailing partial byte is padded with zero bits.
pub fn bits_to_hex<I>(bits: I) -> String
where
    I: IntoIterator<Item = bool>,
{
    let mut hash_bytes = Vec::new();
    let mut current_byte: u8 = 0;
    let mut bit_position = 0;

    for bit in bits {
        if bit {
            current_byte |= 1 << (7 - bit_position);
        }

        bit_position += 1;

        if bit_position == 8 {
            hash_bytes.push(current_byte);
            current_byte = 0;
            bit_position = 0;
        }
    }

    if bit_position > 0 {
        hash_bytes.push(current_byte);
    }

    bytes_to_hex(&hash_bytes)
}

/// Lowercase hex of raw hash bytes
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
