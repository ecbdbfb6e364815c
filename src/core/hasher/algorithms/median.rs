//! Median Hash.
//!
//! Same grid as aHash, but thresholds on the median brightness, which keeps
//! the hash balanced when a few very bright or very dark pixels skew the mean.

use super::super::fast_resize::resize_to_grayscale;
use super::super::traits::{bits_to_hex, HashMethod};
use crate::error::HashError;
use image::DynamicImage;

/// Median Hash implementation
pub struct MedianHasher {
    hash_size: u32,
}

impl MedianHasher {
    pub fn new(hash_size: u32) -> Self {
        Self { hash_size }
    }
}

impl HashMethod for MedianHasher {
    fn hash_image(&self, image: &DynamicImage) -> Result<String, HashError> {
        let gray = resize_to_grayscale(image, self.hash_size, self.hash_size)?;

        let mut sorted: Vec<u8> = gray.pixels().map(|p| p[0]).collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] as u16 + sorted[mid] as u16) as f32 / 2.0
        } else {
            sorted[mid] as f32
        };

        Ok(bits_to_hex(gray.pixels().map(|p| p[0] as f32 > median)))
    }

    fn bit_count(&self) -> u32 {
        self.hash_size * self.hash_size
    }

    fn description(&self) -> &'static str {
        "Median Hash - pixels brighter than the median brightness"
    }
}
