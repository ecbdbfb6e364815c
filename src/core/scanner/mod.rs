//! # Scanner Module
//!
//! Discovers source images in the input tree.
//!
//! The tree is expected to hold one directory per user:
//! ```text
//! input/
//!   alice/  a.jpg  b.png
//!   bob/    c.jpg
//! ```
//! Each image's owner is the name of its parent directory. Files placed
//! directly under the root belong to the `undefined` owner.
//!
//! ## Example
//! ```rust,ignore
//! let scanner = WalkDirScanner::new(ScanConfig::default());
//! for image in scanner.walk(&input)? {
//!     let image = image?;
//!     println!("{} owned by {}", image.path.display(), image.owner);
//! }
//! ```

mod filter;
mod walker;

pub use filter::{ImageFilter, DEFAULT_EXTENSIONS};
pub use walker::{owner_for, ImageWalker, ScanConfig, WalkDirScanner};

/// Owner assigned to images that sit directly under the input root
pub const UNDEFINED_OWNER: &str = "undefined";
