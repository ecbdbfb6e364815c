//! Record types passed between stages and returned by the store.
//!
//! Every record is immutable once emitted. Downstream stages receive
//! clones and never write back to rows owned by an upstream stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A file discovered in the input tree, before it has a database id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePath {
    /// Path to the image file
    pub path: PathBuf,
    /// Owner name (parent directory of the file)
    pub owner: String,
}

/// A registered source image (output of the loader)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceImage {
    pub id: i64,
    pub path: PathBuf,
    pub owner_id: i64,
}

/// A content-addressed derivative of a source image (output of the modifier)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedImage {
    pub id: i64,
    pub path: PathBuf,
    pub source_image_id: i64,
    pub modification_id: i64,
}

/// A perceptual hash of a modified image (output of the hasher)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHash {
    pub id: i64,
    /// Lowercase hex, fixed length per hash method
    pub value: String,
    pub modified_image_id: i64,
    pub hash_method_id: i64,
}

/// A hash method reference row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMethodRow {
    pub id: i64,
    pub name: String,
}

/// A persisted pairwise comparison
///
/// `hash_id_a < hash_id_b` always holds, so each unordered pair has
/// exactly one possible row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub id: i64,
    /// Fraction of differing bits, in `[0, 1]`
    pub hamming_distance: f64,
    pub hash_id_a: i64,
    pub hash_id_b: i64,
}

/// Lifecycle of a long-running stage (match engine, remote loader, orchestrator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Stopped,
    InProgress,
    Done,
    Failed,
}

impl StageState {
    /// Done and Failed are terminal for one run
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Done | StageState::Failed)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Stopped => write!(f, "stopped"),
            StageState::InProgress => write!(f, "in progress"),
            StageState::Done => write!(f, "done"),
            StageState::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a stage's state and how many records it has produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub state: StageState,
    pub processed: u64,
}

impl StageStatus {
    pub fn stopped() -> Self {
        Self {
            state: StageState::Stopped,
            processed: 0,
        }
    }
}
