//! # Registry Module
//!
//! Immutable name → implementation mapping for interchangeable algorithms.
//!
//! Registries are built once at startup with explicit `register` calls and
//! frozen by `build`. Iteration follows registration order, so every stage
//! instance applies algorithms in the same sequence.
//!
//! ## Example
//! ```rust,ignore
//! let registry = RegistryBuilder::<dyn HashMethod>::new()
//!     .register("averagehash", Arc::new(AverageHasher::new(8)))
//!     .build()?;
//! ```

use crate::error::BenchError;
use std::collections::HashSet;
use std::sync::Arc;

/// Ordered, immutable algorithm registry
pub struct Registry<T: ?Sized> {
    entries: Arc<[(String, Arc<T>)]>,
}

impl<T: ?Sized> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    /// Number of registered algorithms
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at a position in registration order
    pub fn entry(&self, index: usize) -> Option<(&str, &Arc<T>)> {
        self.entries
            .get(index)
            .map(|(name, algorithm)| (name.as_str(), algorithm))
    }

    /// Iterate in registration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<T>)> + '_ {
        self.entries
            .iter()
            .map(|(name, algorithm)| (name.as_str(), algorithm))
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl<T: ?Sized> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Builder for [`Registry`]
pub struct RegistryBuilder<T: ?Sized> {
    entries: Vec<(String, Arc<T>)>,
    seen: HashSet<String>,
    duplicates: Vec<String>,
}

impl<T: ?Sized> RegistryBuilder<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            seen: HashSet::new(),
            duplicates: Vec::new(),
        }
    }

    /// Register an algorithm under a unique name
    pub fn register(mut self, name: impl Into<String>, algorithm: Arc<T>) -> Self {
        let name = name.into();
        if self.seen.insert(name.clone()) {
            self.entries.push((name, algorithm));
        } else {
            self.duplicates.push(name);
        }
        self
    }

    /// Freeze the registry. Fails if a name was registered twice.
    pub fn build(self) -> Result<Registry<T>, BenchError> {
        if !self.duplicates.is_empty() {
            return Err(BenchError::Config(format!(
                "algorithm names registered more than once: {}",
                self.duplicates.join(", ")
            )));
        }

        Ok(Registry {
            entries: self.entries.into(),
        })
    }
}

impl<T: ?Sized> Default for RegistryBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
