//! # phash-bench
//!
//! Benchmarks perceptual hash methods over an image corpus.
//!
//! ## Pipeline
//! Images flow through four ordered stages:
//! 1. **Load** - walk the input tree and register each source image
//! 2. **Modify** - apply every registered modification (rotate, blur, ...)
//! 3. **Hash** - apply every registered hash method to every modified image
//! 4. **Match** - normalized Hamming distance for every unordered hash pair
//!
//! ## Architecture
//! - `core` - stages, registries, persistence gateway, match engine and the
//!   in-process pipeline runner
//! - `remote` - the same stages as HTTP services plus the async orchestrator
//! - `events` - progress events for the CLI
//! - `config` - configuration file + environment overrides
//! - `error` - error taxonomy

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod remote;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{BenchError, Result};

/// Initialize tracing for the binary
///
/// Reads the filter from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default tracing subscriber");
}
