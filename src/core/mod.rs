//! # Core Module
//!
//! The transport-agnostic benchmark engine.
//!
//! ## Modules
//! - `scanner` - Discovers images in the input tree
//! - `decode` - Decodes image files
//! - `registry` - Ordered name → algorithm mappings
//! - `hasher` - Perceptual hash methods
//! - `modifier` - Image modifications and content-addressed artifacts
//! - `store` - Persistence gateway (SQLite)
//! - `stage` - Loader, Modifier and Hasher stages
//! - `matcher` - Pairwise Hamming distance over stored hashes
//! - `pipeline` - In-process runner with bounded queues

pub mod decode;
pub mod hasher;
pub mod matcher;
pub mod model;
pub mod modifier;
pub mod pipeline;
pub mod registry;
pub mod scanner;
pub mod stage;
pub mod store;

// Re-export commonly used types
pub use matcher::{MatchConfig, MatchEngine, MatchSummary, StatusHandle};
pub use model::{
    HashMethodRow, ImageHash, ImagePath, MatchResult, ModifiedImage, SourceImage, StageState,
    StageStatus,
};
pub use pipeline::{LocalPipeline, PipelineReport};
pub use stage::{Stage, StageContext};
