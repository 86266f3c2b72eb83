//! Strongly-typed configuration for the download center.
//!
//! Every option recognized by the center has a named field here; there is
//! no untyped metadata bag. All sections implement `Default` with the
//! values the center ships with, and serde round-trips the whole structure
//! so callers can persist overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default network operation timeout.
const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;

/// Default delay between per-chunk retry attempts.
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Default number of retries for both chunks and tasks.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default history retention window in days.
const DEFAULT_HISTORY_RETENTION_DAYS: u32 = 30;

/// Concurrency limits and adaptation toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Upper bound on simultaneously-downloading chunks per task and on
    /// tasks in flight across the center.
    pub max_concurrent: usize,
    /// When true, the concurrency adjuster may change the effective limit.
    pub auto_adjust: bool,
    /// When true, adjustment considers network speed and stability.
    pub network_aware: bool,
    /// When true, adjustment considers pending high-priority pressure.
    pub priority_based: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            auto_adjust: true,
            network_aware: true,
            priority_based: false,
        }
    }
}

/// Chunk layout and per-chunk retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Byte size of each chunk (the last chunk holds the remainder).
    pub size: u64,
    /// Retries allowed per chunk before the failure escalates to the task.
    pub max_retries: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Network timeouts and task-level retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout applied to every network operation, in seconds.
    pub timeout_secs: u64,
    /// Base delay between chunk retry attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Task-level retries before a task is marked failed.
    pub max_retries: u32,
}

impl NetworkConfig {
    /// Returns the operation timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the chunk retry delay as a [`Duration`].
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Where temp artifacts live and how long history is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding per-task chunk temp directories.
    pub temp_dir: PathBuf,
    /// History records older than this many days are pruned.
    pub history_retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("download-center"),
            history_retention_days: DEFAULT_HISTORY_RETENTION_DAYS,
        }
    }
}

/// Top-level download center configuration.
///
/// # Example
///
/// ```
/// use download_center::config::DownloadConfig;
///
/// let mut config = DownloadConfig::default();
/// config.concurrency.max_concurrent = 8;
/// config.chunk.size = 4 * 1024 * 1024;
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Concurrency limits and adaptation toggles.
    pub concurrency: ConcurrencyConfig,
    /// Chunk sizing and per-chunk retries.
    pub chunk: ChunkConfig,
    /// Timeouts and task-level retries.
    pub network: NetworkConfig,
    /// Temp storage and history retention.
    pub storage: StorageConfig,
}
