//! # Matcher Module
//!
//! Pairwise comparison of every hash against every other hash of the same
//! method.
//!
//! ## How It Works
//! 1. Page through hash methods in id order
//! 2. For each method, page through its hashes (the outer hash)
//! 3. For each outer hash, page through the hashes with a strictly greater
//!    id and compute their distances in parallel
//! 4. Persist each pair as `(lower id, higher id)` with conflict-ignore
//!
//! Each unordered pair is visited exactly once, from its lower id, and a
//! hash is never paired with itself. The engine is a resumable state
//! machine: [`MatchEngine::next_comparison`] does one comparison's worth
//! of work, so callers can interleave status reporting and yielding.
//!
//! ## Distance
//! `popcount(a XOR b) / (4 * hex_len)`, see [`hamming_distance`].

mod distance;
mod status;

pub use distance::{hamming_distance, hash_distance, DistanceError, Side};
pub use status::StatusHandle;

use crate::core::model::{HashMethodRow, ImageHash, MatchResult};
use crate::core::store::{Cursor, Session};
use crate::error::MatchError;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::VecDeque;

/// Paging and batching knobs for a match run
#[derive(Debug, Clone, Copy)]
pub struct MatchConfig {
    /// Rows per cursor page (methods, outer and inner hashes)
    pub page_size: usize,
    /// Matches per transaction
    pub batch_size: usize,
    /// Comparisons between cooperative yields
    pub yield_every: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            batch_size: 500,
            yield_every: 50,
        }
    }
}

/// Outcome of one pair
#[derive(Debug)]
pub enum Comparison {
    /// New row written
    Persisted(MatchResult),
    /// The pair was already stored by an earlier run
    Duplicate,
    /// The pair could not be compared (logged and skipped)
    Skipped(MatchError),
}

/// Totals of a finished (or partial) run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub persisted: u64,
    pub duplicates: u64,
    pub skipped: u64,
}

impl MatchSummary {
    fn record(&mut self, comparison: &Comparison) {
        match comparison {
            Comparison::Persisted(_) => self.persisted += 1,
            Comparison::Duplicate => self.duplicates += 1,
            Comparison::Skipped(_) => self.skipped += 1,
        }
    }
}

/// Resumable pairwise matcher
pub struct MatchEngine {
    session: Session,
    page_size: usize,
    methods: Cursor,
    method_queue: VecDeque<HashMethodRow>,
    method: Option<HashMethodRow>,
    outer: Option<Cursor>,
    outer_queue: VecDeque<ImageHash>,
    current: Option<ImageHash>,
    inner: Option<Cursor>,
    distances: VecDeque<(i64, Result<f64, MatchError>)>,
    summary: MatchSummary,
    finished: bool,
}

impl MatchEngine {
    /// `session` should be a dedicated connection; writes are batched on it
    pub fn new(session: Session, config: MatchConfig) -> Self {
        let page_size = config.page_size.max(1);
        Self {
            session,
            page_size,
            methods: Cursor::new(page_size),
            method_queue: VecDeque::new(),
            method: None,
            outer: None,
            outer_queue: VecDeque::new(),
            current: None,
            inner: None,
            distances: VecDeque::new(),
            summary: MatchSummary::default(),
            finished: false,
        }
    }

    /// Totals so far
    pub fn summary(&self) -> MatchSummary {
        self.summary
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Advance to the next pair and persist it.
    ///
    /// Returns `Ok(None)` once every pair has been visited, after the final
    /// batch is committed. Store errors are returned as `Err` and end the run.
    pub fn next_comparison(&mut self) -> Result<Option<Comparison>, MatchError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            // Persist the next computed distance
            if let Some((other_id, distance)) = self.distances.pop_front() {
                let comparison = self.persist(other_id, distance)?;
                self.summary.record(&comparison);
                return Ok(Some(comparison));
            }

            // Next inner page for the current hash
            if let (Some(current), Some(inner)) = (self.current.as_ref(), self.inner.as_mut()) {
                let method_id = current.hash_method_id;
                let store = self.session.store();
                let page = inner.next_batch(|after, limit| {
                    store.hashes_after(method_id, after, limit)
                })?;

                if !page.is_empty() {
                    let computed: Vec<(i64, Result<f64, MatchError>)> = page
                        .par_iter()
                        .map(|other| (other.id, hash_distance(current, other)))
                        .collect();
                    self.distances.extend(computed);
                    continue;
                }

                self.current = None;
                self.inner = None;
            }

            // Next outer hash
            if let Some(next) = self.outer_queue.pop_front() {
                self.inner = Some(Cursor::starting_after(next.id, self.page_size));
                self.current = Some(next);
                continue;
            }

            // Next outer page for the current method
            if let (Some(method), Some(outer)) = (self.method.as_ref(), self.outer.as_mut()) {
                let method_id = method.id;
                let store = self.session.store();
                let page = outer.next_batch(|after, limit| {
                    store.hashes_after(method_id, after, limit)
                })?;

                if !page.is_empty() {
                    self.outer_queue.extend(page);
                    continue;
                }

                tracing::debug!(method = %method.name, "Finished matching method");
                self.method = None;
                self.outer = None;
            }

            // Next method
            if let Some(method) = self.method_queue.pop_front() {
                tracing::info!(method = %method.name, "Matching hashes");
                self.outer = Some(Cursor::new(self.page_size));
                self.method = Some(method);
                continue;
            }

            let store = self.session.store();
            let page = self
                .methods
                .next_batch(|after, limit| store.hash_methods_after(after, limit))?;
            if !page.is_empty() {
                self.method_queue.extend(page);
                continue;
            }

            self.session.flush()?;
            self.finished = true;
            return Ok(None);
        }
    }

    fn persist(
        &mut self,
        other_id: i64,
        distance: Result<f64, MatchError>,
    ) -> Result<Comparison, MatchError> {
        let current_id = match self.current.as_ref() {
            Some(current) => current.id,
            None => return Ok(Comparison::Duplicate),
        };

        let distance = match distance {
            Ok(distance) => distance,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping comparison");
                return Ok(Comparison::Skipped(e));
            }
        };

        let id = self
            .session
            .write(|store| store.insert_match(distance, current_id, other_id))?;

        Ok(match id {
            Some(id) => Comparison::Persisted(MatchResult {
                id,
                hamming_distance: distance,
                hash_id_a: current_id.min(other_id),
                hash_id_b: current_id.max(other_id),
            }),
            None => Comparison::Duplicate,
        })
    }

    /// Run at most `max_steps` comparisons.
    ///
    /// Returns `true` when the run has finished.
    pub fn run_steps(
        &mut self,
        max_steps: usize,
        mut observe: impl FnMut(&Comparison),
    ) -> Result<bool, MatchError> {
        for _ in 0..max_steps {
            match self.next_comparison()? {
                Some(comparison) => observe(&comparison),
                None => return Ok(true),
            }
        }
        Ok(self.finished)
    }

    /// Run until every pair has been visited
    pub fn run_to_completion(
        &mut self,
        mut observe: impl FnMut(&Comparison),
    ) -> Result<MatchSummary, MatchError> {
        while let Some(comparison) = self.next_comparison()? {
            observe(&comparison);
        }

        let summary = self.summary;
        tracing::info!(
            persisted = summary.persisted,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            "Matching complete"
        );
        Ok(summary)
    }
}
