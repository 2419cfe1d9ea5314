//! Configuration parsing and validation.
//!
//! vidgraph is configured via a TOML file (default: `config/vidgraph.toml`).
//! Only `[db]` and `[storage]` are required; every other section has
//! defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/vidgraph.sqlite"
//!
//! [storage]
//! root = "./data/uploads"
//!
//! [upload]
//! max_bytes = 536870912
//! allowed_types = ["video/mp4", "video/webm"]
//!
//! [extraction]
//! extractor = "container"     # or "ffprobe"
//! timeout_secs = 60
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 500
//! max_delay_ms = 30000
//! jitter = 0.2
//!
//! [jobs]
//! backend = "sqlite"          # or "memory"
//! max_concurrent = 4
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! cors_origins = ["http://localhost:5173"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vidgraph_core::retry::{RetryPolicy, MAX_JITTER};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Where staged uploads live (`<root>/tmp`, `<root>/objects`).
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            allowed_types: default_allowed_types(),
        }
    }
}

fn default_max_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_allowed_types() -> Vec<String> {
    [
        "video/mp4",
        "video/webm",
        "video/quicktime",
        "video/x-matroska",
        "video/x-msvideo",
        "video/ogg",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extractor")]
    pub extractor: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            extractor: default_extractor(),
            timeout_secs: default_timeout_secs(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_extractor() -> String {
    "container".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

/// Per-stage retry settings for transient failures.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}

/// In-writer retries of conflicting transactions.
#[derive(Debug, Deserialize, Clone)]
pub struct WriterConfig {
    #[serde(default = "default_conflict_attempts")]
    pub conflict_attempts: u32,
    #[serde(default = "default_conflict_base_delay_ms")]
    pub conflict_base_delay_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            conflict_attempts: default_conflict_attempts(),
            conflict_base_delay_ms: default_conflict_base_delay_ms(),
        }
    }
}

impl WriterConfig {
    pub fn policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.conflict_base_delay_ms);
        RetryPolicy {
            max_attempts: self.conflict_attempts,
            base_delay: base,
            max_delay: base * 16,
            jitter: 0.5,
        }
    }
}

fn default_conflict_attempts() -> u32 {
    3
}
fn default_conflict_base_delay_ms() -> u64 {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_jobs_backend")]
    pub backend: String,
    /// Row limit of the in-memory backend.
    #[serde(default = "default_jobs_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            backend: default_jobs_backend(),
            capacity: default_jobs_capacity(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_jobs_backend() -> String {
    "sqlite".to_string()
}
fn default_jobs_capacity() -> usize {
    10_000
}
fn default_max_concurrent() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:5173".to_string()]
}

impl Config {
    /// Default configuration rooted at `dir`: database at
    /// `<dir>/vidgraph.sqlite`, uploads under `<dir>/uploads`.
    pub fn minimal(dir: &Path) -> Self {
        Self {
            db: DbConfig {
                path: dir.join("vidgraph.sqlite"),
                max_connections: default_max_connections(),
            },
            storage: StorageConfig {
                root: dir.join("uploads"),
            },
            upload: UploadConfig::default(),
            extraction: ExtractionConfig::default(),
            retry: RetryConfig::default(),
            writer: WriterConfig::default(),
            jobs: JobsConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Check value ranges and enumerations.
    pub fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            bail!("db.max_connections must be > 0");
        }
        if self.upload.max_bytes == 0 {
            bail!("upload.max_bytes must be > 0");
        }
        if self.upload.allowed_types.is_empty() {
            bail!("upload.allowed_types must not be empty");
        }

        match self.extraction.extractor.as_str() {
            "container" | "ffprobe" => {}
            other => bail!(
                "Unknown extractor: '{}'. Must be container or ffprobe.",
                other
            ),
        }
        if self.extraction.timeout_secs == 0 {
            bail!("extraction.timeout_secs must be > 0");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be >= 1");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
        }
        if !(0.0..=MAX_JITTER).contains(&self.retry.jitter) {
            bail!("retry.jitter must be in [0.0, {}]", MAX_JITTER);
        }

        if self.writer.conflict_attempts == 0 {
            bail!("writer.conflict_attempts must be >= 1");
        }

        match self.jobs.backend.as_str() {
            "sqlite" | "memory" => {}
            other => bail!("Unknown jobs backend: '{}'. Must be sqlite or memory.", other),
        }
        if self.jobs.capacity == 0 {
            bail!("jobs.capacity must be > 0");
        }
        if self.jobs.max_concurrent == 0 {
            bail!("jobs.max_concurrent must be > 0");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
