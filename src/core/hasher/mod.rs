//! # Hasher Module
//!
//! Perceptual hash methods benchmarked by the pipeline.
//!
//! ## Registered Methods
//! - **averagehash** - mean brightness threshold on an 8x8 grid
//! - **medianhash** - median brightness threshold on an 8x8 grid
//! - **differencehash** - horizontal gradient on a 9x8 grid
//! - **dct-hash** - DCT low frequencies (pHash)
//!
//! Every method returns a fixed-length lowercase hex string, so hashes of
//! the same method are always comparable bit for bit.
//!
//! ## Performance Optimizations
//! - Uses `fast_image_resize` for SIMD-accelerated thumbnails
//!
//! ## Example
//! ```rust,ignore
//! let registry = default_registry()?;
//! for (name, method) in registry.iter() {
//!     println!("{name}: {}", method.hash_image(&image)?);
//! }
//! ```

mod algorithms;
pub mod fast_resize;
mod traits;

pub use algorithms::{AverageHasher, DctHasher, DifferenceHasher, MedianHasher};
pub use traits::{bits_to_hex, bytes_to_hex, HashMethod};

use crate::core::registry::{Registry, RegistryBuilder};
use crate::error::BenchError;
use std::sync::Arc;

/// Grid size shared by the default methods (8x8 = 64 bits)
pub const DEFAULT_HASH_SIZE: u32 = 8;

/// Registry of hash methods keyed by name
pub type HashRegistry = Registry<dyn HashMethod>;

/// Build the default hash method registry.
///
/// Registration order is the order hashes are produced for each image.
pub fn default_registry() -> Result<HashRegistry, BenchError> {
    RegistryBuilder::<dyn HashMethod>::new()
        .register("averagehash", Arc::new(AverageHasher::new(DEFAULT_HASH_SIZE)))
        .register("medianhash", Arc::new(MedianHasher::new(DEFAULT_HASH_SIZE)))
        .register(
            "differencehash",
            Arc::new(DifferenceHasher::new(DEFAULT_HASH_SIZE)),
        )
        .register("dct-hash", Arc::new(DctHasher::new(DEFAULT_HASH_SIZE)))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, Rgb};

    #[test]
    fn default_registry_order() {
        let registry = default_registry().unwrap();
        assert_eq!(
            registry.names(),
            vec!["averagehash", "medianhash", "differencehash", "dct-hash"]
        );
    }

    #[test]
    fn every_default_method_produces_sixteen_hex_chars() {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_fn(40, 30, |x, y| {
            Rgb([(x * 6) as u8, (y * 8) as u8, 90])
        }));

        for (name, method) in default_registry().unwrap().iter() {
            let hash = method.hash_image(&image).unwrap();
            assert_eq!(hash.len(), 16, "method {name}");
            assert_eq!(method.hex_len(), 16, "method {name}");
        }
    }
}
