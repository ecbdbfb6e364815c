//! # Modifier Module
//!
//! Image modifications applied to every source image before hashing.
//!
//! A benchmark run compares hashes of each modified copy against the hashes
//! of every other copy, so the modification set defines which distortions a
//! hash method is measured against.
//!
//! ## Content Addressing
//! Modified images are stored as `<digest>.png`, where the digest covers the
//! decoded pixels and the color type. Producing the same pixels twice maps to
//! the same file and the same database row.

mod transforms;

pub use transforms::{Base, Blur, Flip, Grayscale, Invert, Rotate90};

use crate::core::registry::{Registry, RegistryBuilder};
use crate::error::{BenchError, StageError};
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

/// A pure image transform
pub trait Modification: Send + Sync {
    fn modify(&self, image: &DynamicImage) -> DynamicImage;
}

/// Registry of modifications keyed by name
pub type ModificationRegistry = Registry<dyn Modification>;

/// Build the default modification registry.
pub fn default_registry() -> Result<ModificationRegistry, BenchError> {
    RegistryBuilder::<dyn Modification>::new()
        .register("base", Arc::new(Base))
        .register("rotate_90", Arc::new(Rotate90))
        .register("flip", Arc::new(Flip))
        .register("blur", Arc::new(Blur { sigma: 2.0 }))
        .register("invert", Arc::new(Invert))
        .register("grayscale", Arc::new(Grayscale))
        .build()
}

/// Hex digest of an image's pixels and color type
pub fn content_digest(image: &DynamicImage) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(image.as_bytes());
    hasher.update(format!("{:?}", image.color()).as_bytes());
    format!("{:032x}", hasher.digest128())
}

/// Path a modified image is stored at inside `dir`
pub fn artifact_path(dir: &Path, image: &DynamicImage) -> PathBuf {
    dir.join(content_digest(image)).with_extension("png")
}

/// Write a modified image to its content-addressed path.
///
/// An existing file already holds identical pixels and is left alone.
pub fn save_artifact(dir: &Path, image: &DynamicImage) -> Result<PathBuf, StageError> {
    let path = artifact_path(dir, image);
    if path.exists() {
        return Ok(path);
    }

    std::fs::create_dir_all(dir).map_err(|e| StageError::Artifact {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    // Write to a sibling temp file, then rename into place
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    image
        .save_with_format(&tmp, ImageFormat::Png)
        .map_err(|e| StageError::Artifact {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;
    std::fs::rename(&tmp, &path).map_err(|e| StageError::Artifact {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    Ok(path)
}
