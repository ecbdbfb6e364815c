//! Image decoding with a JPEG fast path.
//!
//! Uses zune-jpeg for JPEG files (1.5-2x faster than the image crate),
//! falls back to the image crate for everything else and for JPEGs zune
//! cannot handle.

use crate::error::HashError;
use image::{DynamicImage, ImageBuffer, Luma, Rgb, Rgba};
use std::fs;
use std::path::Path;
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_jpeg::JpegDecoder;

/// Image formats with a dedicated decode path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Other,
}

impl ImageFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("jpg" | "jpeg") => Self::Jpeg,
            Some("png") => Self::Png,
            _ => Self::Other,
        }
    }
}

/// Decode an image from disk using the fastest available decoder
pub fn decode(path: &Path) -> Result<DynamicImage, HashError> {
    match ImageFormat::from_path(path) {
        ImageFormat::Jpeg => decode_jpeg(path).or_else(|_| decode_fallback(path)),
        _ => decode_fallback(path),
    }
}

fn decode_jpeg(path: &Path) -> Result<DynamicImage, HashError> {
    let file_bytes = fs::read(path).map_err(|e| HashError::IoError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let options = DecoderOptions::new_fast().jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(&file_bytes, options);

    let pixels = decoder.decode().map_err(|e| HashError::DecodeError {
        path: path.to_path_buf(),
        reason: format!("zune-jpeg decode failed: {:?}", e),
    })?;

    let info = decoder.info().ok_or_else(|| HashError::DecodeError {
        path: path.to_path_buf(),
        reason: "Failed to get image info".to_string(),
    })?;

    let width = info.width as u32;
    let height = info.height as u32;
    let buffer_error = |kind: &str| HashError::DecodeError {
        path: path.to_path_buf(),
        reason: format!("Failed to create {} buffer", kind),
    };

    let image = match decoder.get_output_colorspace().unwrap_or(ColorSpace::RGB) {
        ColorSpace::RGB => {
            let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
                ImageBuffer::from_raw(width, height, pixels).ok_or_else(|| buffer_error("RGB"))?;
            DynamicImage::ImageRgb8(buffer)
        }
        ColorSpace::RGBA => {
            let buffer: ImageBuffer<Rgba<u8>, Vec<u8>> =
                ImageBuffer::from_raw(width, height, pixels)
                    .ok_or_else(|| buffer_error("RGBA"))?;
            DynamicImage::ImageRgba8(buffer)
        }
        ColorSpace::Luma => {
            let buffer: ImageBuffer<Luma<u8>, Vec<u8>> =
                ImageBuffer::from_raw(width, height, pixels)
                    .ok_or_else(|| buffer_error("Luma"))?;
            DynamicImage::ImageLuma8(buffer)
        }
        // Unsupported colorspace
        _ => return decode_fallback(path),
    };

    Ok(image)
}

fn decode_fallback(path: &Path) -> Result<DynamicImage, HashError> {
    image::open(path).map_err(|e| HashError::DecodeError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
