//! DCT Hash (pHash).
//!
//! Applies a Discrete Cosine Transform before thresholding, so the hash
//! reflects low-frequency structure. More robust to:
//! - Scaling
//! - Brightness/contrast changes
//! - Compression artifacts
//!
//! Delegates to the image_hasher crate's DCT preprocessing.

use super::super::traits::{bytes_to_hex, HashMethod};
use crate::error::HashError;
use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig};

/// DCT-based perceptual hash
pub struct DctHasher {
    hash_size: u32,
    hasher: image_hasher::Hasher,
}

impl DctHasher {
    pub fn new(hash_size: u32) -> Self {
        let hasher = HasherConfig::new()
            .hash_size(hash_size, hash_size)
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .to_hasher();

        Self { hash_size, hasher }
    }
}

impl HashMethod for DctHasher {
    fn hash_image(&self, image: &DynamicImage) -> Result<String, HashError> {
        let hash = self.hasher.hash_image(image);
        let hex = bytes_to_hex(hash.as_bytes());

        if hex.len() != self.hex_len() {
            return Err(HashError::ComputationFailed(format!(
                "DCT hash has {} hex digits, expected {}",
                hex.len(),
                self.hex_len()
            )));
        }

        Ok(hex)
    }

    fn bit_count(&self) -> u32 {
        self.hash_size * self.hash_size
    }

    fn description(&self) -> &'static str {
        "DCT Hash - low-frequency structure after a cosine transform"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn create_pattern(offset: u8) -> DynamicImage {
        let img = ImageBuffer::from_fn(100, 100, |x, y| {
            let v = (((x / 10 + y / 10) % 2) as u8 * 200).saturating_add(offset);
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn identical_images_produce_identical_hash() {
        let hasher = DctHasher::new(8);
        let image = create_pattern(0);

        assert_eq!(
            hasher.hash_image(&image).unwrap(),
            hasher.hash_image(&image).unwrap()
        );
    }

    #[test]
    fn produces_sixteen_hex_chars() {
        let hasher = DctHasher::new(8);
        let hash = hasher.hash_image(&create_pattern(0)).unwrap();

        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_size_off_a_byte_boundary_is_accepted() {
        // 6x6 = 36 bits, packed into 5 bytes
        let hasher = DctHasher::new(6);
        let hash = hasher.hash_image(&create_pattern(0)).unwrap();

        assert_eq!(hash.len(), 10);
        assert_eq!(hash.len(), hasher.hex_len());
    }
}
