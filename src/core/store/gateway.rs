//! Batched write sessions and reference-row resolution.

use super::{ReferenceKind, Store};
use crate::error::{StageError, StoreError};
use std::collections::HashMap;

/// A store connection owned by one stage instance
///
/// The first write opens a transaction; it is committed once `batch_size`
/// writes are pending, on [`Session::flush`], or when the session is
/// dropped.
pub struct Session {
    store: Box<dyn Store>,
    batch_size: usize,
    pending: usize,
}

impl Session {
    pub fn new(store: Box<dyn Store>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            pending: 0,
        }
    }

    /// The underlying connection, for reads
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Run one write inside the current batch
    pub fn write<T>(
        &mut self,
        op: impl FnOnce(&dyn Store) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if !self.store.in_transaction() {
            self.store.begin()?;
        }

        let value = op(self.store.as_ref())?;
        self.pending += 1;

        if self.pending >= self.batch_size {
            self.flush()?;
        }

        Ok(value)
    }

    /// Commit pending writes
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.store.in_transaction() {
            self.store.commit()?;
            tracing::debug!(writes = self.pending, "Committed batch");
        }
        self.pending = 0;
        Ok(())
    }

    /// Number of uncommitted writes
    pub fn pending(&self) -> usize {
        self.pending
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(error = %e, pending = self.pending, "Failed to commit final batch");
        }
    }
}

/// Resolve a reference row id by name, creating the row if needed.
///
/// Lookup, then create, then lookup again. Another connection may create
/// the row between the first lookup and the create; a miss on the second
/// lookup means the store is inconsistent.
pub fn resolve_reference(
    store: &dyn Store,
    kind: ReferenceKind,
    name: &str,
) -> Result<i64, StageError> {
    if let Some(id) = store.reference_id(kind, name)? {
        return Ok(id);
    }

    if let Some(id) = store.create_reference(kind, name)? {
        tracing::debug!(kind = %kind, name, id, "Created reference row");
        return Ok(id);
    }

    store
        .reference_id(kind, name)?
        .ok_or_else(|| StageError::ReferenceRowRace {
            kind: kind.as_str(),
            name: name.to_string(),
        })
}

/// Per-stage memo of resolved reference ids
#[derive(Debug, Default)]
pub struct ReferenceCache {
    ids: HashMap<(ReferenceKind, String), i64>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &mut self,
        store: &dyn Store,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<i64, StageError> {
        if let Some(&id) = self.ids.get(&(kind, name.to_string())) {
            return Ok(id);
        }

        let id = resolve_reference(store, kind, name)?;
        self.ids.insert((kind, name.to_string()), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{SqliteConnector, StoreConnector, Table};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn session_commits_every_batch_size_writes() {
        let dir = TempDir::new().unwrap();
        let connector = SqliteConnector::new(dir.path().join("s.db"));
        let reader = connector.connect().unwrap();
        let mut session = Session::new(connector.connect().unwrap(), 2);

        session
            .write(|s| s.create_reference(ReferenceKind::User, "a"))
            .unwrap();
        assert_eq!(session.pending(), 1);
        assert_eq!(reader.count(Table::Users).unwrap(), 0);

        session
            .write(|s| s.create_reference(ReferenceKind::User, "b"))
            .unwrap();
        assert_eq!(session.pending(), 0);
        assert_eq!(reader.count(Table::Users).unwrap(), 2);
    }

    #[test]
    fn dropping_a_session_commits_the_partial_batch() {
        let dir = TempDir::new().unwrap();
        let connector = SqliteConnector::new(dir.path().join("s.db"));
        let reader = connector.connect().unwrap();

        {
            let mut session = Session::new(connector.connect().unwrap(), 100);
            session
                .write(|s| s.create_reference(ReferenceKind::User, "carol"))
                .unwrap();
        }

        assert_eq!(reader.count(Table::Users).unwrap(), 1);
    }

    #[test]
    fn resolve_reference_creates_then_reuses() {
        let dir = TempDir::new().unwrap();
        let store = SqliteConnector::new(dir.path().join("s.db")).connect().unwrap();

        let created = resolve_reference(store.as_ref(), ReferenceKind::HashMethod, "dct-hash")
            .unwrap();
        let again = resolve_reference(store.as_ref(), ReferenceKind::HashMethod, "dct-hash")
            .unwrap();

        assert_eq!(created, again);
        assert_eq!(store.count(Table::HashMethods).unwrap(), 1);
    }

    /// Store whose create always loses the race and whose lookups
    /// succeed only after a configurable number of misses
    struct RacingStore {
        misses_before_hit: usize,
        lookups: AtomicUsize,
    }

    impl Store for RacingStore {
        fn reference_id(&self, _: ReferenceKind, _: &str) -> Result<Option<i64>, StoreError> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok((n >= self.misses_before_hit).then_some(42))
        }
        fn create_reference(&self, _: ReferenceKind, _: &str) -> Result<Option<i64>, StoreError> {
            Ok(None)
        }
        fn insert_image(&self, _: &Path, _: i64) -> Result<Option<i64>, StoreError> {
            unimplemented!()
        }
        fn insert_modified_image(&self, _: &Path, _: i64, _: i64) -> Result<Option<i64>, StoreError> {
            unimplemented!()
        }
        fn insert_hash(&self, _: &str, _: i64, _: i64) -> Result<Option<i64>, StoreError> {
            unimplemented!()
        }
        fn insert_match(&self, _: f64, _: i64, _: i64) -> Result<Option<i64>, StoreError> {
            unimplemented!()
        }
        fn hash_methods_after(
            &self,
            _: i64,
            _: usize,
        ) -> Result<Vec<crate::core::model::HashMethodRow>, StoreError> {
            unimplemented!()
        }
        fn hashes_after(
            &self,
            _: i64,
            _: i64,
            _: usize,
        ) -> Result<Vec<crate::core::model::ImageHash>, StoreError> {
            unimplemented!()
        }
        fn begin(&self) -> Result<(), StoreError> {
            Ok(())
        }
        fn commit(&self) -> Result<(), StoreError> {
            Ok(())
        }
        fn in_transaction(&self) -> bool {
            false
        }
        fn count(&self, _: Table) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[test]
    fn lost_create_race_falls_back_to_lookup() {
        let store = RacingStore {
            misses_before_hit: 1,
            lookups: AtomicUsize::new(0),
        };

        let id = resolve_reference(&store, ReferenceKind::Modification, "blur").unwrap();
        assert_eq!(id, 42);
    }

    #[test]
    fn second_miss_is_a_race_error() {
        let store = RacingStore {
            misses_before_hit: usize::MAX,
            lookups: AtomicUsize::new(0),
        };

        let result = resolve_reference(&store, ReferenceKind::Modification, "blur");
        assert!(matches!(
            result,
            Err(StageError::ReferenceRowRace { kind: "modification", .. })
        ));
    }

    #[test]
    fn reference_cache_hits_store_once() {
        let store = RacingStore {
            misses_before_hit: 0,
            lookups: AtomicUsize::new(0),
        };
        let mut cache = ReferenceCache::new();

        cache.resolve(&store, ReferenceKind::User, "dave").unwrap();
        cache.resolve(&store, ReferenceKind::User, "dave").unwrap();

        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }
}
