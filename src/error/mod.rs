//! # Error Module
//!
//! Error types for the benchmark pipeline.
//!
//! ## Design Principles
//! - **Per-record errors are local** - a malformed image is logged and skipped
//! - **Per-stage errors propagate** - they cancel the run and surface once
//! - **Include context** - stage names, record ids, paths
//!
//! `StageError::is_fatal` is the single place that decides between
//! "skip this record" and "abort the run".

use std::path::PathBuf;
use thiserror::Error;

/// Top-level application error
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Matching error: {0}")]
    Match(#[from] MatchError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("Scanning error: {0}")]
    Scan(#[from] ScanError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    /// Busy, locked or dropped connection. Retried before surfacing.
    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Database query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Whether a retry at the connection level may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors raised while a stage processes a record
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The record itself is unusable (unreadable image, bad path).
    #[error("Skipping {record}: {reason}")]
    PermanentInput { record: String, reason: String },

    #[error("Lost the get-or-create race for {kind} '{name}' twice")]
    ReferenceRowRace { kind: &'static str, name: String },

    #[error("No algorithms registered for the {stage} stage")]
    NoAlgorithmsRegistered { stage: &'static str },

    #[error("Failed to write artifact {path}: {reason}")]
    Artifact { path: PathBuf, reason: String },

    #[error("Worker in the {stage} stage crashed: {reason}")]
    Crash { stage: String, reason: String },
}

impl StageError {
    /// Fatal errors abort the whole run; everything else skips one record.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StageError::PermanentInput { .. })
    }
}

/// Errors raised by hash methods
#[derive(Error, Debug)]
pub enum HashError {
    #[error("Failed to decode image {path}: {reason}")]
    DecodeError { path: PathBuf, reason: String },

    #[error("Failed to open image file {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Hash computation failed: {0}")]
    ComputationFailed(String),
}

/// Errors raised by the match engine
#[derive(Error, Debug)]
pub enum MatchError {
    #[error("Hash {left_id} has {left_len} hex digits but hash {right_id} has {right_len}")]
    HashLengthMismatch {
        left_id: i64,
        right_id: i64,
        left_len: usize,
        right_len: usize,
    },

    #[error("Hash {hash_id} is not valid hex: {value}")]
    InvalidHex { hash_id: i64, value: String },

    #[error("{0}")]
    Store(#[from] StoreError),
}

impl MatchError {
    /// Comparison-level errors skip one pair; store errors end the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MatchError::Store(_))
    }
}

/// Errors raised while talking to remote stage services
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed healthcheck for {stage}")]
    HealthCheck { stage: String },

    #[error("Could not reach {stage}: {reason}")]
    Transport { stage: String, reason: String },

    #[error("{stage} answered with HTTP {status}")]
    Status { stage: String, status: u16 },

    #[error("Unexpected response from {stage}: {reason}")]
    Decode { stage: String, reason: String },

    #[error("{stage} reported a failed state")]
    StageFailed { stage: String },
}

/// Errors that occur while walking the input tree
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Input directory not found: {path}")]
    DirectoryNotFound { path: PathBuf },

    #[error("Failed to read {path}: {reason}")]
    ReadEntry { path: PathBuf, reason: String },
}

/// The single terminal failure of a pipeline run
#[derive(Error, Debug)]
#[error("Pipeline failed in stage '{stage}': {cause}")]
pub struct PipelineError {
    /// Stage (or edge) that failed first
    pub stage: String,
    /// What went wrong
    #[source]
    pub cause: FailureCause,
}

impl PipelineError {
    pub fn new(stage: impl Into<String>, cause: impl Into<FailureCause>) -> Self {
        Self {
            stage: stage.into(),
            cause: cause.into(),
        }
    }
}

/// Underlying cause of a [`PipelineError`]
#[derive(Error, Debug)]
pub enum FailureCause {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Run was cancelled")]
    Cancelled,
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_permanent_input_is_skippable() {
        let skip = StageError::PermanentInput {
            record: "image 4".to_string(),
            reason: "truncated PNG".to_string(),
        };
        assert!(!skip.is_fatal());

        let race = StageError::ReferenceRowRace {
            kind: "modification",
            name: "rotate_90".to_string(),
        };
        assert!(race.is_fatal());
        assert!(StageError::Store(StoreError::Transient("locked".to_string())).is_fatal());
    }

    #[test]
    fn health_check_error_names_stage() {
        let error = RemoteError::HealthCheck {
            stage: "hasher".to_string(),
        };
        assert_eq!(error.to_string(), "Failed healthcheck for hasher");
    }

    #[test]
    fn pipeline_error_includes_stage_and_cause() {
        let error = PipelineError::new(
            "modifier",
            StageError::NoAlgorithmsRegistered { stage: "modifier" },
        );
        let message = error.to_string();
        assert!(message.contains("'modifier'"));
        assert!(message.contains("No algorithms registered"));
    }

    #[test]
    fn length_mismatch_is_not_fatal() {
        let error = MatchError::HashLengthMismatch {
            left_id: 1,
            right_id: 2,
            left_len: 16,
            right_len: 64,
        };
        assert!(!error.is_fatal());
        assert!(error.to_string().contains("16 hex digits"));
    }
}
