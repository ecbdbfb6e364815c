//! SQLite store backend.

use super::{ReferenceKind, Store, StoreConnector, Table};
use crate::core::model::{HashMethodRow, ImageHash};
use crate::error::StoreError;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS images (
        id INTEGER PRIMARY KEY,
        path TEXT NOT NULL,
        user_id INTEGER NOT NULL REFERENCES users(id),
        UNIQUE (path, user_id)
    );
    CREATE TABLE IF NOT EXISTS modifications (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS hash_methods (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS modified_images (
        id INTEGER PRIMARY KEY,
        path TEXT NOT NULL UNIQUE,
        image_id INTEGER NOT NULL REFERENCES images(id),
        modification_id INTEGER NOT NULL REFERENCES modifications(id),
        UNIQUE (image_id, modification_id)
    );
    CREATE TABLE IF NOT EXISTS hashes (
        id INTEGER PRIMARY KEY,
        value TEXT NOT NULL,
        modified_image_id INTEGER NOT NULL REFERENCES modified_images(id),
        hash_method_id INTEGER NOT NULL REFERENCES hash_methods(id),
        UNIQUE (modified_image_id, hash_method_id)
    );
    CREATE INDEX IF NOT EXISTS idx_hashes_method ON hashes(hash_method_id, id);
    CREATE TABLE IF NOT EXISTS matches (
        id INTEGER PRIMARY KEY,
        hamming_distance REAL NOT NULL,
        hash_id1 INTEGER NOT NULL REFERENCES hashes(id),
        hash_id2 INTEGER NOT NULL REFERENCES hashes(id),
        UNIQUE (hash_id1, hash_id2),
        CHECK (hash_id1 < hash_id2)
    );
";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                StoreError::Transient(e.to_string())
            }
            _ => StoreError::Query(e.to_string()),
        }
    }
}

fn reference_table(kind: ReferenceKind) -> &'static str {
    match kind {
        ReferenceKind::User => "users",
        ReferenceKind::Modification => "modifications",
        ReferenceKind::HashMethod => "hash_methods",
    }
}

/// One SQLite connection
///
/// Uses WAL (Write-Ahead Logging) so readers proceed while a writer holds
/// the lock. Writers take the lock up front with `BEGIN IMMEDIATE`.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        // Create parent directories if needed
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let conn = Connection::open(path).map_err(|e| match StoreError::from(e) {
            StoreError::Transient(reason) => StoreError::Transient(reason),
            other => StoreError::Open {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { conn })
    }
}

impl Store for SqliteStore {
    fn reference_id(&self, kind: ReferenceKind, name: &str) -> Result<Option<i64>, StoreError> {
        let sql = format!("SELECT id FROM {} WHERE name = ?1", reference_table(kind));
        let id = self
            .conn
            .prepare_cached(&sql)?
            .query_row([name], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn create_reference(
        &self,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<Option<i64>, StoreError> {
        let sql = format!(
            "INSERT INTO {} (name) VALUES (?1) ON CONFLICT DO NOTHING RETURNING id",
            reference_table(kind)
        );
        let id = self
            .conn
            .prepare_cached(&sql)?
            .query_row([name], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn insert_image(&self, path: &Path, owner_id: i64) -> Result<Option<i64>, StoreError> {
        let id = self
            .conn
            .prepare_cached(
                "INSERT INTO images (path, user_id) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING RETURNING id",
            )?
            .query_row(params![path.to_string_lossy(), owner_id], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn insert_modified_image(
        &self,
        path: &Path,
        image_id: i64,
        modification_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        let id = self
            .conn
            .prepare_cached(
                "INSERT INTO modified_images (path, image_id, modification_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT DO NOTHING RETURNING id",
            )?
            .query_row(
                params![path.to_string_lossy(), image_id, modification_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn insert_hash(
        &self,
        value: &str,
        modified_image_id: i64,
        hash_method_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        let id = self
            .conn
            .prepare_cached(
                "INSERT INTO hashes (value, modified_image_id, hash_method_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT DO NOTHING RETURNING id",
            )?
            .query_row(params![value, modified_image_id, hash_method_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(id)
    }

    fn insert_match(
        &self,
        hamming_distance: f64,
        hash_id_a: i64,
        hash_id_b: i64,
    ) -> Result<Option<i64>, StoreError> {
        if hash_id_a == hash_id_b {
            return Ok(None);
        }
        let (low, high) = (hash_id_a.min(hash_id_b), hash_id_a.max(hash_id_b));

        let id = self
            .conn
            .prepare_cached(
                "INSERT INTO matches (hamming_distance, hash_id1, hash_id2) VALUES (?1, ?2, ?3)
                 ON CONFLICT DO NOTHING RETURNING id",
            )?
            .query_row(params![hamming_distance, low, high], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn hash_methods_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<HashMethodRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, name FROM hash_methods WHERE id > ?1 ORDER BY id LIMIT ?2")?;
        let rows = stmt
            .query_map(params![after_id, limit as i64], |row| {
                Ok(HashMethodRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn hashes_after(
        &self,
        hash_method_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ImageHash>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, value, modified_image_id, hash_method_id FROM hashes
             WHERE hash_method_id = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![hash_method_id, after_id, limit as i64], |row| {
                Ok(ImageHash {
                    id: row.get(0)?,
                    value: row.get(1)?,
                    modified_image_id: row.get(2)?,
                    hash_method_id: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn begin(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn count(&self, table: Table) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Opens [`SqliteStore`] connections, retrying transient failures
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(30),
            attempts: 10,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Connection attempts and the fixed delay between them
    pub fn retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection with the concrete type
    pub fn open(&self) -> Result<SqliteStore, StoreError> {
        let mut attempt = 1;
        loop {
            match SqliteStore::open(&self.path, self.busy_timeout) {
                Ok(store) => return Ok(store),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "Database unavailable, retrying"
                    );
                    attempt += 1;
                    std::thread::sleep(self.retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl StoreConnector for SqliteConnector {
    fn connect(&self) -> Result<Box<dyn Store>, StoreError> {
        Ok(Box::new(self.open()?))
    }
}
