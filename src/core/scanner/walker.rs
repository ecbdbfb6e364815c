//! Directory walking implementation using walkdir.

use super::filter::{is_hidden, ImageFilter};
use super::UNDEFINED_OWNER;
use crate::core::model::ImagePath;
use crate::error::ScanError;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Configuration for the directory scanner
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    /// Whether to follow symbolic links
    pub follow_symlinks: bool,
    /// Whether to include hidden files and directories
    pub include_hidden: bool,
    /// Maximum directory depth (None = unlimited)
    pub max_depth: Option<usize>,
    /// Custom extensions to include (None = use defaults)
    pub extensions: Option<Vec<String>>,
}

/// Scanner implementation using the walkdir crate
pub struct WalkDirScanner {
    config: ScanConfig,
}

impl WalkDirScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Start a lazy walk of `root`.
    ///
    /// Entries are visited in file-name order, so two walks of an unchanged
    /// tree yield the same sequence.
    pub fn walk(&self, root: &Path) -> Result<ImageWalker, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::DirectoryNotFound {
                path: root.to_path_buf(),
            });
        }

        let mut filter = ImageFilter::new().with_hidden(self.config.include_hidden);
        if let Some(ref extensions) = self.config.extensions {
            filter = filter.with_extensions(extensions.clone());
        }

        let mut walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name();
        if let Some(depth) = self.config.max_depth {
            walker = walker.max_depth(depth);
        }

        Ok(ImageWalker {
            root: root.to_path_buf(),
            inner: walker.into_iter(),
            filter,
        })
    }
}

/// Lazy iterator over the images below a root directory
pub struct ImageWalker {
    root: PathBuf,
    inner: walkdir::IntoIter,
    filter: ImageFilter,
}

impl Iterator for ImageWalker {
    type Item = Result<ImagePath, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    return Some(Err(ScanError::ReadEntry {
                        path,
                        reason: e.to_string(),
                    }));
                }
            };

            let path = entry.path();

            if entry.file_type().is_dir() {
                // Skip hidden directories unless configured otherwise
                if !self.filter.includes_hidden() && entry.depth() > 0 && is_hidden(path) {
                    self.inner.skip_current_dir();
                }
                continue;
            }

            if !self.filter.should_include(path) {
                continue;
            }

            return Some(Ok(ImagePath {
                path: path.to_path_buf(),
                owner: owner_for(&self.root, path),
            }));
        }
    }
}

/// Owner of an image: the name of its parent directory, or
/// [`UNDEFINED_OWNER`] for files directly under the root
pub fn owner_for(root: &Path, path: &Path) -> String {
    path.parent()
        .filter(|parent| *parent != root)
        .filter(|parent| parent.starts_with(root))
        .and_then(|parent| parent.file_name())
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| UNDEFINED_OWNER.to_string())
}
