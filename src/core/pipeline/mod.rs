//! # Pipeline Module
//!
//! Runs the whole benchmark in one process.
//!
//! ## Topology
//! ```text
//! scanner → [paths] → loader ×N → [images] → modifier ×N → [modified] → hasher ×N → [hashes] → sink
//! ```
//! Every `[queue]` is bounded, so a slow stage blocks its producers instead
//! of buffering without limit. Matching runs after the sink has drained.
//!
//! ## Shutdown
//! The producer side of each queue is owned by one coordinator. Once all of
//! its workers have returned it sends one [`QueueItem::EndOfStream`] per
//! consumer of that queue. A fatal error or panic anywhere cancels the
//! shared [`CancellationToken`], which every blocking queue operation
//! polls, and the first failure is returned as a `PipelineError`.

mod cancel;
mod executor;
mod queue;

pub use cancel::CancellationToken;
pub use executor::{
    LocalPipeline, LocalPipelineBuilder, PipelineReport, StageStats, WorkerCounts, MATCHER,
    SCANNER,
};
pub use queue::{stage_queue, Inbox, Interrupted, Outbox, QueueItem};
