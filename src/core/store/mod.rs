//! # Store Module
//!
//! Persistence gateway shared by every stage.
//!
//! ## Contracts
//! - **Reference rows** (users, modifications, hash methods) are looked up
//!   by name and created on first use. See [`resolve_reference`].
//! - **Content rows** (images, modified images, hashes, matches) are
//!   inserted with conflict-ignore semantics: `Ok(None)` means the row
//!   already existed.
//! - **Reads** are cursor pages in ascending id order. See [`Cursor`].
//!
//! Each stage instance owns one connection, wrapped in a [`Session`] that
//! batches writes into transactions.

mod cursor;
mod gateway;
mod sqlite;

pub use cursor::{Cursor, Keyed};
pub use gateway::{resolve_reference, ReferenceCache, Session};
pub use sqlite::{SqliteConnector, SqliteStore};

use crate::core::model::{HashMethodRow, ImageHash};
use crate::error::StoreError;
use std::fmt;
use std::path::Path;

/// Kinds of shared, append-only reference rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    User,
    Modification,
    HashMethod,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::User => "user",
            ReferenceKind::Modification => "modification",
            ReferenceKind::HashMethod => "hash method",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tables that can be counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Users,
    Images,
    Modifications,
    HashMethods,
    ModifiedImages,
    Hashes,
    Matches,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Users,
        Table::Images,
        Table::Modifications,
        Table::HashMethods,
        Table::ModifiedImages,
        Table::Hashes,
        Table::Matches,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Images => "images",
            Table::Modifications => "modifications",
            Table::HashMethods => "hash_methods",
            Table::ModifiedImages => "modified_images",
            Table::Hashes => "hashes",
            Table::Matches => "matches",
        }
    }
}

/// One connection to the benchmark database
///
/// Implementations are used from a single thread at a time.
pub trait Store: Send {
    /// Id of a reference row by name
    fn reference_id(&self, kind: ReferenceKind, name: &str) -> Result<Option<i64>, StoreError>;

    /// Create a reference row; `None` if it already exists
    fn create_reference(&self, kind: ReferenceKind, name: &str)
        -> Result<Option<i64>, StoreError>;

    fn insert_image(&self, path: &Path, owner_id: i64) -> Result<Option<i64>, StoreError>;

    fn insert_modified_image(
        &self,
        path: &Path,
        image_id: i64,
        modification_id: i64,
    ) -> Result<Option<i64>, StoreError>;

    fn insert_hash(
        &self,
        value: &str,
        modified_image_id: i64,
        hash_method_id: i64,
    ) -> Result<Option<i64>, StoreError>;

    /// Insert a comparison. The pair is stored as (min, max); a pair of
    /// identical ids is never stored.
    fn insert_match(
        &self,
        hamming_distance: f64,
        hash_id_a: i64,
        hash_id_b: i64,
    ) -> Result<Option<i64>, StoreError>;

    /// Hash methods with `id > after_id`, ascending
    fn hash_methods_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<HashMethodRow>, StoreError>;

    /// Hashes of one method with `id > after_id`, ascending
    fn hashes_after(
        &self,
        hash_method_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ImageHash>, StoreError>;

    fn begin(&self) -> Result<(), StoreError>;
    fn commit(&self) -> Result<(), StoreError>;
    fn in_transaction(&self) -> bool;

    fn count(&self, table: Table) -> Result<u64, StoreError>;
}

/// Opens new store connections
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Store>, StoreError>;
}
