//! Normalized Hamming distance between hex-encoded hashes.

use crate::core::model::ImageHash;
use crate::error::MatchError;
use thiserror::Error;

/// Why two hex strings cannot be compared
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistanceError {
    #[error("hex lengths differ ({left} vs {right})")]
    LengthMismatch { left: usize, right: usize },

    #[error("{side} value is not non-empty hex")]
    InvalidHex { side: Side },
}

/// Which operand was malformed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

fn nibble(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

/// Fraction of differing bits between two equal-length hex strings.
///
/// `popcount(a XOR b) / (4 * len)`, always in `[0, 1]`. Digits are
/// compared one nibble at a time, so hashes of any length work.
pub fn hamming_distance(left: &str, right: &str) -> Result<f64, DistanceError> {
    if left.len() != right.len() {
        return Err(DistanceError::LengthMismatch {
            left: left.len(),
            right: right.len(),
        });
    }
    if left.is_empty() {
        return Err(DistanceError::InvalidHex { side: Side::Left });
    }

    let mut differing = 0u32;
    for (a, b) in left.bytes().zip(right.bytes()) {
        let a = nibble(a).ok_or(DistanceError::InvalidHex { side: Side::Left })?;
        let b = nibble(b).ok_or(DistanceError::InvalidHex { side: Side::Right })?;
        differing += (a ^ b).count_ones();
    }

    Ok(differing as f64 / (4 * left.len()) as f64)
}

/// Distance between two stored hashes, with their ids in any error
pub fn hash_distance(left: &ImageHash, right: &ImageHash) -> Result<f64, MatchError> {
    hamming_distance(&left.value, &right.value).map_err(|e| match e {
        DistanceError::LengthMismatch { left: l, right: r } => MatchError::HashLengthMismatch {
            left_id: left.id,
            right_id: right.id,
            left_len: l,
            right_len: r,
        },
        DistanceError::InvalidHex { side } => {
            let hash = match side {
                Side::Left => left,
                Side::Right => right,
            };
            MatchError::InvalidHex {
                hash_id: hash.id,
                value: hash.value.clone(),
            }
        }
    })
}
