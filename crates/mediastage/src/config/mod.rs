use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StageError};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Placeholder substituted with the object ID in `fetch.url_template`
pub const ID_PLACEHOLDER: &str = "{id}";

/// Main configuration structure for mediastage
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Staging directory shared by ingestion and reclamation
    #[serde(default)]
    pub staging: StagingConfig,
    /// In-memory payload cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// Disk quota enforcement
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Background reclamation of stale staging files
    #[serde(default)]
    pub reclaim: ReclaimConfig,
    /// Remote source access
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Ingestion admission and deadlines
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Object store handoff
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Config {
    /// Load configuration from `path`, or from the first default location
    /// that exists, falling back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".mediastage").join("config.toml")),
            dirs::config_dir().map(|c| c.join("mediastage").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StageError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| StageError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cache.entry_limit_bytes > self.cache.total_limit_bytes {
            return Err(StageError::Config(format!(
                "cache.entry_limit_bytes ({}) exceeds cache.total_limit_bytes ({})",
                self.cache.entry_limit_bytes, self.cache.total_limit_bytes
            )));
        }
        if self.fetch.chunk_size_bytes == 0 {
            return Err(StageError::Config(
                "fetch.chunk_size_bytes must be positive".to_string(),
            ));
        }
        if !self.fetch.url_template.contains(ID_PLACEHOLDER) {
            return Err(StageError::Config(format!(
                "fetch.url_template must contain {ID_PLACEHOLDER}"
            )));
        }
        if self.reclaim.interval_secs == 0 {
            return Err(StageError::Config(
                "reclaim.interval_secs must be positive".to_string(),
            ));
        }
        if self.ingest.max_concurrent == 0 {
            return Err(StageError::Config(
                "ingest.max_concurrent must be positive".to_string(),
            ));
        }
        match self.upload.backend {
            UploadBackend::Local if self.upload.local_dir.is_none() => Err(StageError::Config(
                "upload.local_dir is required for the local backend".to_string(),
            )),
            UploadBackend::S3 if self.upload.bucket.is_none() => Err(StageError::Config(
                "upload.bucket is required for the s3 backend".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Staging directory configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Directory holding staged files; swept by the reclaimer
    #[serde(default = "default_staging_root")]
    pub root: PathBuf,
    /// Extension appended to staged filenames
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: default_staging_root(),
            extension: default_extension(),
        }
    }
}

fn default_staging_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mediastage")
        .join("staging")
}

fn default_extension() -> String {
    "mp4".to_string()
}

/// Memory cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Largest payload held for a single object; crossing it evicts the entry
    #[serde(default = "default_entry_limit_bytes")]
    pub entry_limit_bytes: u64,
    /// Budget across all entries, enforced least-recently-used first
    #[serde(default = "default_total_limit_bytes")]
    pub total_limit_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_limit_bytes: default_entry_limit_bytes(),
            total_limit_bytes: default_total_limit_bytes(),
        }
    }
}

fn default_entry_limit_bytes() -> u64 {
    100 * MIB
}

fn default_total_limit_bytes() -> u64 {
    512 * MIB
}

/// Which bytes count against the quota ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuotaScope {
    /// Used space of the whole volume holding the staging root
    #[default]
    Volume,
    /// Sum of file sizes under the staging root
    Directory,
}

/// Disk quota configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Usage at or above this many bytes refuses ingestion
    #[serde(default = "default_ceiling_bytes")]
    pub ceiling_bytes: u64,
    #[serde(default)]
    pub scope: QuotaScope,
    /// Refuse before downloading when the advertised length would not fit
    #[serde(default = "default_preflight")]
    pub preflight: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: default_ceiling_bytes(),
            scope: QuotaScope::default(),
            preflight: default_preflight(),
        }
    }
}

fn default_ceiling_bytes() -> u64 {
    GIB
}

fn default_preflight() -> bool {
    true
}

/// Reclaimer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReclaimConfig {
    /// Seconds between sweeps
    #[serde(default = "default_reclaim_interval_secs")]
    pub interval_secs: u64,
    /// Minimum file age before deletion; defaults to the interval
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

impl ReclaimConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs.unwrap_or(self.interval_secs))
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reclaim_interval_secs(),
            retention_secs: None,
        }
    }
}

fn default_reclaim_interval_secs() -> u64 {
    3600
}

/// Remote source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Source URL with `{id}` in place of the object ID
    #[serde(default = "default_url_template")]
    pub url_template: String,
    /// Size of chunks handed to the pipeline
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    /// Connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest wait for the next body chunk in seconds
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Extra attempts after a transport failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            chunk_size_bytes: default_chunk_size_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_url_template() -> String {
    "https://www.youtube.com/watch?v={id}".to_string()
}

fn default_chunk_size_bytes() -> usize {
    MIB as usize
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

/// Ingestion admission configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Fetches allowed to run at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Deadline for a whole ingestion call, unset for none
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl IngestConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            request_timeout_secs: None,
        }
    }
}

fn default_max_concurrent() -> usize {
    5
}

/// Object store selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploadBackend {
    /// Keep staged files local only
    #[default]
    None,
    /// In-process store, lost on exit
    Memory,
    /// Directory on the local filesystem
    Local,
    /// Amazon S3 bucket, credentials from the environment
    S3,
}

/// Object store handoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub backend: UploadBackend,
    /// Target directory for the local backend
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
    /// Bucket for the s3 backend
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix prepended to every object ID
    #[serde(default)]
    pub prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            backend: UploadBackend::default(),
            local_dir: None,
            bucket: None,
            region: default_region(),
            prefix: String::new(),
        }
    }
}

fn default_region() -> String {
    "us-west-2".to_string()
}
