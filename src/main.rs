//! # phash-bench CLI
//!
//! ## Usage
//! ```bash
//! phash-bench run --input ~/corpus
//! phash-bench serve all --bind 0.0.0.0:8000
//! phash-bench orchestrate
//! ```

mod cli;

use phash_bench::Result;

fn main() -> Result<()> {
    phash_bench::init_tracing();
    cli::run()
}
