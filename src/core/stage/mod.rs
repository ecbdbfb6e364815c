//! # Stage Module
//!
//! The units of work a pipeline is built from.
//!
//! ## Stages
//! - [`Loader`] - `ImagePath` → `SourceImage`
//! - [`Modifier`] - `SourceImage` → one `ModifiedImage` per modification
//! - [`Hasher`] - `ModifiedImage` → one `ImageHash` per hash method
//!
//! A stage never mutates its input. Outputs come back as a lazy iterator:
//! the local runner drains it, the remote services stop after `limit`
//! items. Every stage instance owns its own store [`Session`].
//!
//! ## Errors
//! An `Err` item with [`StageError::is_fatal`] false skips one output (or
//! the whole record, when the input itself is unreadable). Fatal errors
//! end the run.

mod hasher;
mod loader;
mod modifier;

pub use hasher::Hasher;
pub use loader::Loader;
pub use modifier::Modifier;

use crate::core::hasher::HashRegistry;
use crate::core::modifier::ModificationRegistry;
use crate::core::store::{Session, StoreConnector};
use crate::error::StageError;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lazy outputs for one input record
pub type Outputs<'a, T> = Box<dyn Iterator<Item = Result<T, StageError>> + 'a>;

/// A pipeline stage
pub trait Stage: Send {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Stage name used in logs, events and errors
    const NAME: &'static str;

    /// Produce the outputs for one input record
    fn process<'a>(&'a mut self, input: &'a Self::Input) -> Outputs<'a, Self::Output>;

    /// Commit any buffered writes
    fn flush(&mut self) -> Result<(), StageError>;
}

/// Everything a stage instance needs, built once at startup
#[derive(Clone)]
pub struct StageContext {
    connector: Arc<dyn StoreConnector>,
    batch_size: usize,
    modified_dir: PathBuf,
    modifications: ModificationRegistry,
    hash_methods: HashRegistry,
}

impl StageContext {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        modified_dir: impl Into<PathBuf>,
        modifications: ModificationRegistry,
        hash_methods: HashRegistry,
    ) -> Self {
        Self {
            connector,
            batch_size: 50,
            modified_dir: modified_dir.into(),
            modifications,
            hash_methods,
        }
    }

    /// Writes per transaction for every session opened from this context
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn connector(&self) -> &Arc<dyn StoreConnector> {
        &self.connector
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn modified_dir(&self) -> &Path {
        &self.modified_dir
    }

    pub fn modifications(&self) -> &ModificationRegistry {
        &self.modifications
    }

    pub fn hash_methods(&self) -> &HashRegistry {
        &self.hash_methods
    }

    /// Open a new batched session on its own connection
    pub fn session(&self) -> Result<Session, StageError> {
        Ok(Session::new(self.connector.connect()?, self.batch_size))
    }

    pub fn loader(&self) -> Result<Loader, StageError> {
        Ok(Loader::new(self.session()?))
    }

    /// Fails if no modification is registered
    pub fn modifier(&self) -> Result<Modifier, StageError> {
        if self.modifications.is_empty() {
            return Err(StageError::NoAlgorithmsRegistered {
                stage: Modifier::NAME,
            });
        }
        Ok(Modifier::new(
            self.session()?,
            self.modifications.clone(),
            self.modified_dir.clone(),
        ))
    }

    /// Fails if no hash method is registered
    pub fn hasher(&self) -> Result<Hasher, StageError> {
        if self.hash_methods.is_empty() {
            return Err(StageError::NoAlgorithmsRegistered { stage: Hasher::NAME });
        }
        Ok(Hasher::new(self.session()?, self.hash_methods.clone()))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::small_context;
    use super::*;
    use crate::core::registry::RegistryBuilder;
    use tempfile::TempDir;

    #[test]
    fn empty_registries_fail_at_construction() {
        let dir = TempDir::new().unwrap();
        let base = small_context(dir.path());
        let empty_mods = RegistryBuilder::<dyn crate::core::modifier::Modification>::new()
            .build()
            .unwrap();
        let empty_methods = RegistryBuilder::<dyn crate::core::hasher::HashMethod>::new()
            .build()
            .unwrap();
        let context = StageContext::new(
            base.connector().clone(),
            base.modified_dir(),
            empty_mods,
            empty_methods,
        );

        assert!(matches!(
            context.modifier(),
            Err(StageError::NoAlgorithmsRegistered { stage: "modifier" })
        ));
        assert!(matches!(
            context.hasher(),
            Err(StageError::NoAlgorithmsRegistered { stage: "hasher" })
        ));
        assert!(context.loader().is_ok());
    }
}
