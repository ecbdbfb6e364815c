//! Keyset pagination over id-ordered rows.

use crate::core::model::{HashMethodRow, ImageHash};

/// Rows with a monotonically assigned id
pub trait Keyed {
    fn key(&self) -> i64;
}

impl Keyed for ImageHash {
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for HashMethodRow {
    fn key(&self) -> i64 {
        self.id
    }
}

/// Position in an id-ordered sequence
///
/// Each batch asks for rows with `id > last_seen_id`; the cursor then
/// advances past the largest id it received. A page shorter than
/// `page_size` marks the sequence as exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    last_seen_id: i64,
    page_size: usize,
    exhausted: bool,
}

impl Cursor {
    /// Cursor at the start of the sequence
    pub fn new(page_size: usize) -> Self {
        Self::starting_after(0, page_size)
    }

    /// Cursor that skips every row with `id <= id`
    pub fn starting_after(id: i64, page_size: usize) -> Self {
        Self {
            last_seen_id: id,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    /// Fetch the next page. `fetch` receives `(after_id, limit)`.
    pub fn next_batch<T, E, F>(&mut self, fetch: F) -> Result<Vec<T>, E>
    where
        T: Keyed,
        F: FnOnce(i64, usize) -> Result<Vec<T>, E>,
    {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let batch = fetch(self.last_seen_id, self.page_size)?;

        if let Some(max) = batch.iter().map(Keyed::key).max() {
            self.last_seen_id = self.last_seen_id.max(max);
        }
        if batch.len() < self.page_size {
            self.exhausted = true;
        }

        Ok(batch)
    }

    pub fn last_seen_id(&self) -> i64 {
        self.last_seen_id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
