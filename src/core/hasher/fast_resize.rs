//! Fast SIMD-accelerated grayscale thumbnails for hashing.
//!
//! Uses the fast_image_resize crate, which picks AVX2/NEON kernels when
//! available. Every hash method starts from a tiny grayscale grid, so this
//! is the one resize path they share.

use crate::error::HashError;
use fast_image_resize::{images::Image, PixelType, ResizeOptions, Resizer};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};

/// Reusable grayscale resizer
pub struct FastResizer {
    resizer: Resizer,
}

impl FastResizer {
    pub fn new() -> Self {
        Self {
            resizer: Resizer::new(),
        }
    }

    /// Convert to grayscale, then resize to exactly `width` x `height`.
    pub fn resize_to_grayscale(
        &mut self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<GrayImage, HashError> {
        // Grayscale first: one channel to resize instead of three
        let gray = image.to_luma8();

        let src_width = gray.width();
        let src_height = gray.height();

        if src_width == 0 || src_height == 0 {
            return Err(HashError::ComputationFailed(
                "source image has no pixels".to_string(),
            ));
        }

        if width == 0 || height == 0 {
            return Err(HashError::ComputationFailed(format!(
                "invalid thumbnail size {}x{}",
                width, height
            )));
        }

        let src_image = Image::from_vec_u8(src_width, src_height, gray.into_raw(), PixelType::U8)
            .map_err(|e| {
                HashError::ComputationFailed(format!("failed to wrap source pixels: {}", e))
            })?;

        let mut dst_image = Image::new(width, height, PixelType::U8);

        let options = ResizeOptions::new().resize_alg(fast_image_resize::ResizeAlg::Convolution(
            fast_image_resize::FilterType::Bilinear,
        ));

        self.resizer
            .resize(&src_image, &mut dst_image, &options)
            .map_err(|e| HashError::ComputationFailed(format!("resize failed: {}", e)))?;

        let result: ImageBuffer<Luma<u8>, Vec<u8>> =
            ImageBuffer::from_raw(width, height, dst_image.into_vec()).ok_or_else(|| {
                HashError::ComputationFailed("resized buffer has the wrong length".to_string())
            })?;

        Ok(result)
    }
}

impl Default for FastResizer {
    fn default() -> Self {
        Self::new()
    }
}

/// One-off resize; hash methods are shared across threads so they do not
/// keep a resizer of their own.
pub fn resize_to_grayscale(
    image: &DynamicImage,
    width: u32,
    height: u32,
) -> Result<GrayImage, HashError> {
    FastResizer::new().resize_to_grayscale(image, width, height)
}
