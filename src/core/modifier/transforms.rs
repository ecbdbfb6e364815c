//! Built-in image modifications.

use super::Modification;
use image::DynamicImage;

/// Leaves the image unchanged (the reference copy every other
/// modification is compared against)
pub struct Base;

impl Modification for Base {
    fn modify(&self, image: &DynamicImage) -> DynamicImage {
        image.clone()
    }
}

/// Rotates 90 degrees counter-clockwise
pub struct Rotate90;

impl Modification for Rotate90 {
    fn modify(&self, image: &DynamicImage) -> DynamicImage {
        image.rotate270()
    }
}

/// Mirrors left to right
pub struct Flip;

impl Modification for Flip {
    fn modify(&self, image: &DynamicImage) -> DynamicImage {
        image.fliph()
    }
}

/// Gaussian blur
pub struct Blur {
    pub sigma: f32,
}

impl Modification for Blur {
    fn modify(&self, image: &DynamicImage) -> DynamicImage {
        image.blur(self.sigma)
    }
}

/// Inverts every color channel
pub struct Invert;

impl Modification for Invert {
    fn modify(&self, image: &DynamicImage) -> DynamicImage {
        let mut inverted = image.clone();
        inverted.invert();
        inverted
    }
}

/// Drops color
pub struct Grayscale;

impl Modification for Grayscale {
    fn modify(&self, image: &DynamicImage) -> DynamicImage {
        image.grayscale()
    }
}
