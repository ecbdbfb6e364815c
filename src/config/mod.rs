//! # Config Module
//!
//! Run configuration, resolved in three layers:
//! 1. Built-in defaults (every field has one)
//! 2. An optional TOML file
//! 3. Environment variables (`INPUT_IMG_PATH`, `MOD_IMG_PATH`,
//!    `DATABASE_PATH`, `LOADER_URL`, `MODIFIER_URL`, `HASHER_URL`,
//!    `MATCHER_URL`, `ORCHESTRATOR_URL`)
//!
//! CLI flags are applied on top by the binary.
//!
//! ## Example
//! ```toml
//! [paths]
//! input = "/data/images"
//!
//! [pipeline]
//! modifier_workers = 4
//! hasher_workers = 4
//! ```

use crate::core::matcher::MatchConfig;
use crate::core::pipeline::WorkerCounts;
use crate::core::stage::StageContext;
use crate::core::store::SqliteConnector;
use crate::core::{hasher, modifier};
use crate::error::{BenchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const APP_DIR: &str = "phash-bench";

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
    pub matcher: MatcherConfig,
    pub remote: RemoteConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Input tree, one directory per user
    pub input: PathBuf,
    /// Where modified images are written
    pub modified: PathBuf,
    /// SQLite database file
    pub database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let cache = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self {
            input: data.join("images"),
            modified: cache.join("modified"),
            database: data.join("phash.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub loader_workers: usize,
    pub modifier_workers: usize,
    pub hasher_workers: usize,
    /// Capacity of every inter-stage queue
    pub queue_capacity: usize,
    /// Writes per transaction in each stage
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            loader_workers: 1,
            modifier_workers: 2,
            hasher_workers: 2,
            queue_capacity: 100,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            retry_delay_ms: 1000,
            busy_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub page_size: usize,
    /// Comparisons between status updates
    pub yield_every: usize,
    pub batch_size: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        let defaults = MatchConfig::default();
        Self {
            page_size: defaults.page_size,
            yield_every: defaults.yield_every,
            batch_size: defaults.batch_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub loader_url: String,
    pub modifier_url: String,
    pub hasher_url: String,
    pub matcher_url: String,
    /// Orchestrator service, for `orchestrate --via-service`
    pub orchestrator_url: String,
    /// `limit` sent with every `/next` request
    pub page_size: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Attempts per request when the connection fails
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    pub health_attempts: u32,
    pub health_delay_ms: u64,
    /// Wait after an empty page before polling the loader again
    pub idle_interval_ms: u64,
    /// Wait between `/match/status` polls
    pub status_interval_ms: u64,
    pub image_queue_capacity: usize,
    pub modified_queue_capacity: usize,
    pub hash_queue_capacity: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        let local = "http://127.0.0.1:8000".to_string();
        Self {
            loader_url: local.clone(),
            modifier_url: local.clone(),
            hasher_url: local.clone(),
            matcher_url: local,
            orchestrator_url: "http://127.0.0.1:8005".to_string(),
            page_size: 10,
            request_timeout_secs: 10,
            connect_timeout_secs: 5,
            connect_retries: 5,
            retry_delay_ms: 5000,
            health_attempts: 10,
            health_delay_ms: 5000,
            idle_interval_ms: 10_000,
            status_interval_ms: 5000,
            image_queue_capacity: 100,
            modified_queue_capacity: 200,
            hash_queue_capacity: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the stage services listen on
    pub bind: String,
    /// Address the orchestrator service listens on
    pub orchestrator_bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            orchestrator_bind: "0.0.0.0:8005".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then `path` (if any), then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BenchError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| BenchError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("INPUT_IMG_PATH") {
            self.paths.input = PathBuf::from(v);
        }
        if let Some(v) = non_empty("MOD_IMG_PATH") {
            self.paths.modified = PathBuf::from(v);
        }
        if let Some(v) = non_empty("DATABASE_PATH") {
            self.paths.database = PathBuf::from(v);
        }
        if let Some(v) = non_empty("LOADER_URL") {
            self.remote.loader_url = v;
        }
        if let Some(v) = non_empty("MODIFIER_URL") {
            self.remote.modifier_url = v;
        }
        if let Some(v) = non_empty("HASHER_URL") {
            self.remote.hasher_url = v;
        }
        if let Some(v) = non_empty("MATCHER_URL") {
            self.remote.matcher_url = v;
        }
        if let Some(v) = non_empty("ORCHESTRATOR_URL") {
            self.remote.orchestrator_url = v;
        }
    }

    /// Reject sizes that would stall or divide the work into nothing
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("pipeline.loader_workers", self.pipeline.loader_workers),
            ("pipeline.modifier_workers", self.pipeline.modifier_workers),
            ("pipeline.hasher_workers", self.pipeline.hasher_workers),
            ("pipeline.queue_capacity", self.pipeline.queue_capacity),
            ("pipeline.batch_size", self.pipeline.batch_size),
            ("matcher.page_size", self.matcher.page_size),
            ("matcher.yield_every", self.matcher.yield_every),
            ("matcher.batch_size", self.matcher.batch_size),
            ("remote.page_size", self.remote.page_size),
            ("remote.image_queue_capacity", self.remote.image_queue_capacity),
            ("remote.modified_queue_capacity", self.remote.modified_queue_capacity),
            ("remote.hash_queue_capacity", self.remote.hash_queue_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(BenchError::Config(format!("{} must be > 0", name)));
            }
        }

        if self.store.connect_attempts == 0 {
            return Err(BenchError::Config(
                "store.connect_attempts must be > 0".to_string(),
            ));
        }
        if self.remote.health_attempts == 0 || self.remote.connect_retries == 0 {
            return Err(BenchError::Config(
                "remote.health_attempts and remote.connect_retries must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn worker_counts(&self) -> WorkerCounts {
        WorkerCounts {
            loader: self.pipeline.loader_workers,
            modifier: self.pipeline.modifier_workers,
            hasher: self.pipeline.hasher_workers,
        }
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            page_size: self.matcher.page_size,
            batch_size: self.matcher.batch_size,
            yield_every: self.matcher.yield_every,
        }
    }

    /// Connector for the configured database
    pub fn connector(&self) -> SqliteConnector {
        SqliteConnector::new(&self.paths.database)
            .busy_timeout(Duration::from_millis(self.store.busy_timeout_ms))
            .retry(
                self.store.connect_attempts,
                Duration::from_millis(self.store.retry_delay_ms),
            )
    }

    /// Stage context over the configured database with the default registries
    pub fn stage_context(&self) -> Result<StageContext> {
        Ok(StageContext::new(
            Arc::new(self.connector()),
            self.paths.modified.clone(),
            modifier::default_registry()?,
            hasher::default_registry()?,
        )
        .with_batch_size(self.pipeline.batch_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.worker_counts(), WorkerCounts::default());
        assert_eq!(config.remote.hash_queue_capacity, 300);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pipeline]\nhasher_workers = 8\n\n[paths]\ninput = \"/data/in\""
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pipeline.hasher_workers, 8);
        assert_eq!(config.pipeline.modifier_workers, 2);
        assert_eq!(config.paths.input, PathBuf::from("/data/in"));
        assert_eq!(config.matcher, MatcherConfig::default());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline\nhasher_workers = ").unwrap();

        assert!(matches!(
            Config::from_file(file.path()),
            Err(BenchError::Config(_))
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("INPUT_IMG_PATH", "/env/in"),
            ("DATABASE_PATH", "/env/db.sqlite"),
            ("HASHER_URL", "http://hasher:8000"),
            ("MODIFIER_URL", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.paths.input, PathBuf::from("/env/in"));
        assert_eq!(config.paths.database, PathBuf::from("/env/db.sqlite"));
        assert_eq!(config.remote.hasher_url, "http://hasher:8000");
        // Blank values are ignored
        assert_eq!(config.remote.modifier_url, RemoteConfig::default().modifier_url);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut config = Config::default();
        config.pipeline.queue_capacity = 0;
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("pipeline.queue_capacity"));

        let mut config = Config::default();
        config.matcher.page_size = 0;
        assert!(config.validate().is_err());
    }
}
