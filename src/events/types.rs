//! Event type definitions for progress reporting.

use serde::{Deserialize, Serialize};

/// All events emitted by a benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Run-level events
    Pipeline(PipelineEvent),
    /// Loader, modifier and hasher events
    Stage(StageEvent),
    /// Match engine events
    Match(MatchEvent),
}

/// Run-level events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Run has started
    Started { run_id: String },
    /// Moving to a new phase
    PhaseChanged { phase: PipelinePhase },
    /// Run completed successfully
    Completed { summary: PipelineSummary },
    /// Run was cancelled before it finished
    Cancelled,
    /// Run failed; `stage` is the first stage that failed
    Error { stage: String, message: String },
}

/// Phases of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelinePhase {
    /// Load, modify and hash run concurrently
    Staging,
    /// Pairwise matching over the stored hashes
    Matching,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelinePhase::Staging => write!(f, "Staging"),
            PipelinePhase::Matching => write!(f, "Matching"),
        }
    }
}

/// Events from a stage's worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageEvent {
    /// A worker finished one input record
    Progress(StageProgress),
    /// A record was skipped but the stage continues
    Skipped { stage: String, message: String },
    /// Every worker of the stage has stopped and its sentinels were sent
    Drained { stage: String },
}

/// Progress of one worker after finishing an input record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: String,
    pub worker: usize,
    /// Records this worker emitted for the input
    pub produced: u64,
}

/// Events from the match engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MatchEvent {
    /// Matching has started
    Started,
    /// Periodic progress
    Progress(MatchProgress),
    /// Matching completed
    Completed(MatchProgress),
}

/// Match engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchProgress {
    /// New match rows written
    pub persisted: u64,
    /// Pairs already stored by an earlier run
    pub duplicates: u64,
    /// Pairs that could not be compared
    pub skipped: u64,
}

/// Summary of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub run_id: String,
    /// Source images registered by this run
    pub images: u64,
    /// Modified images written by this run
    pub modified_images: u64,
    /// Hashes written by this run
    pub hashes: u64,
    /// Match rows written by this run
    pub matches: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
}
