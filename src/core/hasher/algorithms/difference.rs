//! Difference Hash (dHash).
//!
//! 1. Resize the image to (hash_size+1) x hash_size
//! 2. Convert to grayscale
//! 3. Compare each pixel to the one to its right
//! 4. Bit is 1 if the left pixel is brighter
//!
//! Captures the brightness gradient rather than absolute brightness.
//! Resizing goes through fast_image_resize.

use super::super::fast_resize::resize_to_grayscale;
use super::super::traits::{bits_to_hex, HashMethod};
use crate::error::HashError;
use image::DynamicImage;

/// Difference Hash implementation
pub struct DifferenceHasher {
    hash_size: u32,
}

impl DifferenceHasher {
    pub fn new(hash_size: u32) -> Self {
        Self { hash_size }
    }
}

impl HashMethod for DifferenceHasher {
    fn hash_image(&self, image: &DynamicImage) -> Result<String, HashError> {
        // One extra column to compute differences
        let gray = resize_to_grayscale(image, self.hash_size + 1, self.hash_size)?;

        let mut bits = Vec::with_capacity(self.bit_count() as usize);
        for y in 0..self.hash_size {
            for x in 0..self.hash_size {
                // Set bit if left is brighter than right
                bits.push(gray.get_pixel(x, y)[0] > gray.get_pixel(x + 1, y)[0]);
            }
        }

        Ok(bits_to_hex(bits))
    }

    fn bit_count(&self) -> u32 {
        self.hash_size * self.hash_size
    }

    fn description(&self) -> &'static str {
        "Difference Hash - brightness gradient between neighbouring pixels"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn create_solid_image(value: u8) -> DynamicImage {
        let img = ImageBuffer::from_fn(100, 100, |_, _| Rgb([value, value, value]));
        DynamicImage::ImageRgb8(img)
    }

    fn create_left_to_right_gradient() -> DynamicImage {
        let img = ImageBuffer::from_fn(100, 100, |x, _| {
            let brightness = (x * 255 / 99) as u8;
            Rgb([brightness, brightness, brightness])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn create_right_to_left_gradient() -> DynamicImage {
        let img = ImageBuffer::from_fn(100, 100, |x, _| {
            let brightness = ((99 - x) * 255 / 99) as u8;
            Rgb([brightness, brightness, brightness])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn solid_image_has_no_gradient() {
        let hasher = DifferenceHasher::new(8);
        let hash = hasher.hash_image(&create_solid_image(128)).unwrap();
        assert_eq!(hash, "0000000000000000");
    }

    #[test]
    fn opposite_gradients_produce_different_hashes() {
        let hasher = DifferenceHasher::new(8);

        let hash1 = hasher.hash_image(&create_left_to_right_gradient()).unwrap();
        let hash2 = hasher.hash_image(&create_right_to_left_gradient()).unwrap();

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn hash_size_affects_output_length() {
        let image = create_solid_image(128);

        let hash_8 = DifferenceHasher::new(8).hash_image(&image).unwrap();
        let hash_16 = DifferenceHasher::new(16).hash_image(&image).unwrap();

        // 64 bits = 16 hex chars, 256 bits = 64 hex chars
        assert_eq!(hash_8.len(), 16);
        assert_eq!(hash_16.len(), 64);
    }
}
