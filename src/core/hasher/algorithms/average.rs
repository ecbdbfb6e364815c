//! Average Hash (aHash).
//!
//! 1. Resize the image to hash_size x hash_size
//! 2. Convert to grayscale
//! 3. Compute the mean brightness
//! 4. For each pixel: bit is 1 if brighter than the mean, else 0

use super::super::traits::{bits_to_hex, HashMethod};
use crate::error::HashError;
use image::DynamicImage;

/// Average Hash implementation
pub struct AverageHasher {
    hash_size: u32,
}

impl AverageHasher {
    pub fn new(hash_size: u32) -> Self {
        Self { hash_size }
    }
}

impl HashMethod for AverageHasher {
    fn hash_image(&self, image: &DynamicImage) -> Result<String, HashError> {
        let resized = image.resize_exact(
            self.hash_size,
            self.hash_size,
            image::imageops::FilterType::Lanczos3,
        );
        let gray = resized.to_luma8();

        let total: u64 = gray.pixels().map(|p| p[0] as u64).sum();
        let count = (self.hash_size * self.hash_size) as u64;
        let average = (total / count) as u8;

        Ok(bits_to_hex(gray.pixels().map(|p| p[0] > average)))
    }

    fn bit_count(&self) -> u32 {
        self.hash_size * self.hash_size
    }

    fn description(&self) -> &'static str {
        "Average Hash - pixels brighter than the mean brightness"
    }
}
