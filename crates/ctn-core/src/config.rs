use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CtnError, CtnResult};

/// Environment variable that supplies master key material for `active_key_id`.
pub const MASTER_KEY_ENV: &str = "CTN_MASTER_KEY";

/// Top-level configuration (loaded from ctn.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CtnConfig {
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub compression: CompressionConfig,
    pub pipeline: PipelineConfig,
    pub log: LogConfig,
}

impl CtnConfig {
    /// Load configuration from a TOML file. A missing file yields defaults;
    /// reporting that is left to the caller, which may not have logging yet.
    pub fn load(path: &Path) -> CtnResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| CtnError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(toml_str: &str) -> CtnResult<Self> {
        let config: CtnConfig =
            toml::from_str(toml_str).map_err(|e| CtnError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the storage pipeline unusable.
    pub fn validate(&self) -> CtnResult<()> {
        if self.crypto.chunk_size == 0 {
            return Err(CtnError::Config("crypto.chunk_size must be > 0".into()));
        }
        if self.pipeline.pipe_capacity == 0 {
            return Err(CtnError::Config("pipeline.pipe_capacity must be > 0".into()));
        }
        if !(-7..=22).contains(&self.compression.level) {
            return Err(CtnError::Config(format!(
                "compression.level {} outside zstd range -7..=22",
                self.compression.level
            )));
        }
        if self.crypto.enabled
            && self.compression.enabled
            && self.crypto.priority == self.compression.priority
        {
            return Err(CtnError::Config(format!(
                "crypto and compression share priority {}",
                self.crypto.priority
            )));
        }
        let mut ids: Vec<i32> = self.crypto.keys.iter().map(|k| k.id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(CtnError::Config("crypto.keys contains duplicate ids".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Filesystem,
    Memory,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Which blob backend to use (default: filesystem)
    pub backend: BackendKind,
    /// Root directory for the filesystem backend
    pub root: PathBuf,
    /// Scratch directory for in-flight writes (default: `<root>/.scratch`)
    pub scratch_dir: Option<PathBuf>,
    /// S3-compatible object store (used when backend = "s3")
    pub s3: S3Config,
}

impl StorageConfig {
    /// Scratch directory, defaulting to a sibling of the blob tree so the
    /// final rename stays on one filesystem.
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.root.join(".scratch"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

/// One master key version.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub id: i32,
    /// Base64 of 32 raw bytes, or any string (derived via HKDF-SHA256)
    pub material: String,
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("id", &self.id)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// Envelope encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub enabled: bool,
    /// Key id used to wrap new data-encryption keys
    pub active_key_id: i32,
    /// Worker thread count for chunk sealing (0 = cpu_count)
    pub threads: usize,
    /// Plaintext bytes per sealed chunk
    pub chunk_size: usize,
    /// Processor priority (higher runs earlier on write)
    pub priority: i32,
    pub keys: Vec<KeyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// zstd compression level
    pub level: i32,
    /// Processor priority (higher runs earlier on write)
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent pipeline writes (0 = cpu_count)
    pub max_parallel_writes: usize,
    /// Segments buffered between a background stage and its reader
    pub pipe_capacity: usize,
    /// Hot cache budget in bytes (0 disables the cache)
    pub cache_max_bytes: u64,
    /// Largest blob admitted to the hot cache
    pub cache_item_max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Filesystem,
            root: PathBuf::from("/var/lib/ctn/blobs"),
            scratch_dir: None,
            s3: S3Config::default(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "ctn".into(),
            enforce_tls: false,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            active_key_id: 1,
            threads: 0,
            chunk_size: 1024 * 1024,
            priority: 10,
            keys: Vec::new(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 3,
            priority: 20,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_writes: 0,
            pipe_capacity: 8,
            cache_max_bytes: 100 * 1024 * 1024,
            cache_item_max_bytes: 1024 * 1024,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
