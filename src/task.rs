//! Task and chunk data model for the download center.
//!
//! A [`DownloadTask`] is created from a [`DownloadRequest`] when the caller
//! submits a transfer, lives in the in-memory queue/registry while the
//! center runs, and is mirrored to the persistence store at every status
//! transition. Tasks are shared between the orchestrator and the worker
//! executing them as [`SharedTask`] handles; everything handed outward is a
//! copy-on-read snapshot.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lifecycle states of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting in the queue for a free worker.
    Pending,
    /// Actively transferring.
    Downloading,
    /// Suspended by the caller; resumable.
    Paused,
    /// Finished and merged successfully. Terminal.
    Completed,
    /// Retries exhausted or fatal error. Terminal.
    Failed,
    /// Aborted by the caller. Terminal.
    Cancelled,
}

impl DownloadStatus {
    /// Returns the persisted string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for states that can never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// Lifecycle states of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Not yet downloaded (possibly partially written and resumable).
    Pending,
    /// A lane is currently fetching this chunk.
    Downloading,
    /// Fully written to its temp file.
    Completed,
    /// Gave up after per-chunk retries.
    Failed,
}

impl ChunkStatus {
    /// Returns the persisted string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid chunk status: {s}")),
        }
    }
}

/// One contiguous byte-range slice of a task.
///
/// Invariant: chunk `i + 1` starts at this chunk's `end + 1`, and the last
/// chunk's `end + 1` equals the task's total size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// 0-based, contiguous index.
    pub index: usize,
    /// First byte of the range (inclusive).
    pub start: u64,
    /// Last byte of the range (inclusive).
    pub end: u64,
    /// Total bytes in the range (`end - start + 1`).
    pub size: u64,
    /// Bytes written to the temp file so far.
    pub downloaded: u64,
    /// Current chunk state.
    pub status: ChunkStatus,
    /// Temp file holding this chunk's bytes.
    pub file_path: PathBuf,
}

impl ChunkInfo {
    /// Returns true when this chunk still needs bytes fetched.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        !matches!(self.status, ChunkStatus::Completed)
    }
}

/// Point-in-time progress for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Expected total bytes, once the size is known.
    pub total_size: Option<u64>,
    /// Bytes downloaded so far across all chunks.
    pub downloaded_size: u64,
    /// Smoothed transfer rate in bytes per second.
    pub speed: f64,
    /// Rounded completion percentage, clamped to 0..=100.
    pub percentage: u8,
    /// Estimated seconds remaining, when a rate and size are known.
    pub remaining_time_secs: Option<u64>,
}

impl DownloadProgress {
    /// Computes the rounded, clamped percentage for a byte pair.
    #[must_use]
    pub fn percentage_of(downloaded: u64, total: Option<u64>) -> u8 {
        match total {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Some(total) if total > 0 => {
                let pct = (downloaded as f64 / total as f64 * 100.0).round();
                pct.clamp(0.0, 100.0) as u8
            }
            _ => 0,
        }
    }
}

/// Which part of the application originated a download.
///
/// Feeds the priority calculator's module multiplier: user-triggered
/// transfers outrank background resource fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadModule {
    /// The user explicitly asked for this file.
    UserManual,
    /// A plugin installation fetch.
    PluginInstall,
    /// An application update payload.
    AppUpdate,
    /// A background resource fetch.
    ResourceDownload,
}

impl DownloadModule {
    /// Returns the persisted string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserManual => "user_manual",
            Self::PluginInstall => "plugin_install",
            Self::AppUpdate => "app_update",
            Self::ResourceDownload => "resource_download",
        }
    }
}

impl std::str::FromStr for DownloadModule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_manual" => Ok(Self::UserManual),
            "plugin_install" => Ok(Self::PluginInstall),
            "app_update" => Ok(Self::AppUpdate),
            "resource_download" => Ok(Self::ResourceDownload),
            _ => Err(format!("invalid download module: {s}")),
        }
    }
}

/// A caller's request for one transfer.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Caller-supplied id; generated when absent.
    pub id: Option<String>,
    /// Source URL.
    pub url: String,
    /// Directory the final file lands in.
    pub destination: PathBuf,
    /// Final filename; derived from the URL path when absent.
    pub filename: Option<String>,
    /// Originating module, for priority weighting.
    pub module: DownloadModule,
    /// Base priority before multipliers, 1..=100.
    pub base_priority: u8,
    /// Expected file size when the caller knows it; feeds the size
    /// multiplier only.
    pub file_size_hint: Option<u64>,
    /// Extra headers attached to every request for this task.
    pub headers: Vec<(String, String)>,
    /// Permit the single-stream fallback when the server reports no size.
    pub allow_unknown_size: bool,
    /// Optional hex-encoded SHA-256 the merged file must match.
    pub checksum: Option<String>,
    /// Suppress the history record for this task.
    pub hidden: bool,
}

impl DownloadRequest {
    /// Creates a request with defaults for everything but the essentials.
    #[must_use]
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            url: url.into(),
            destination: destination.into(),
            filename: None,
            module: DownloadModule::UserManual,
            base_priority: 50,
            file_size_hint: None,
            headers: Vec::new(),
            allow_unknown_size: false,
            checksum: None,
            hidden: false,
        }
    }
}

/// Monotonic suffix so ids generated in the same millisecond stay unique.
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a task id from the wall clock and a process-local counter.
#[must_use]
pub fn generate_task_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("task_{millis:x}_{seq:04x}")
}

/// Derives a filename from the last non-empty URL path segment.
///
/// Falls back to `download.bin` for URLs with no usable path.
#[must_use]
pub fn filename_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed.path_segments().and_then(|mut segments| {
                segments
                    .next_back()
                    .filter(|segment| !segment.is_empty())
                    .map(std::string::ToString::to_string)
            })
        })
        .unwrap_or_else(|| "download.bin".to_string())
}

/// One requested transfer with its full runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Opaque unique id.
    pub id: String,
    /// Source URL.
    pub url: String,
    /// Directory the final file lands in.
    pub destination: PathBuf,
    /// Final filename.
    pub filename: String,
    /// Effective priority, 1..=100, higher is more urgent.
    pub priority: u8,
    /// Originating module.
    pub module: DownloadModule,
    /// Current lifecycle state.
    pub status: DownloadStatus,
    /// Latest progress snapshot.
    pub progress: DownloadProgress,
    /// Byte-range layout; empty until the size is known.
    pub chunks: Vec<ChunkInfo>,
    /// Last user-facing error message, if the task has failed.
    pub error: Option<String>,
    /// Times this task has failed (feeds the priority penalty).
    pub failure_count: u32,
    /// Extra headers attached to every request.
    pub headers: Vec<(String, String)>,
    /// Permit the single-stream fallback for unknown sizes.
    pub allow_unknown_size: bool,
    /// Optional hex-encoded SHA-256 for the merged file.
    pub checksum: Option<String>,
    /// Suppress the history record.
    pub hidden: bool,
    /// Creation time, unix milliseconds.
    pub created_at: u64,
    /// Last mutation time, unix milliseconds.
    pub updated_at: u64,
    /// Completion time, unix milliseconds, for completed tasks.
    pub completed_at: Option<u64>,
}

impl DownloadTask {
    /// Builds a pending task from a request and a computed priority.
    #[must_use]
    pub fn from_request(request: &DownloadRequest, priority: u8) -> Self {
        let now = unix_millis();
        Self {
            id: request.id.clone().unwrap_or_else(generate_task_id),
            url: request.url.clone(),
            destination: request.destination.clone(),
            filename: request
                .filename
                .clone()
                .unwrap_or_else(|| filename_from_url(&request.url)),
            priority,
            module: request.module,
            status: DownloadStatus::Pending,
            progress: DownloadProgress::default(),
            chunks: Vec::new(),
            error: None,
            failure_count: 0,
            headers: request.headers.clone(),
            allow_unknown_size: request.allow_unknown_size,
            checksum: request.checksum.clone(),
            hidden: request.hidden,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Returns the final output path (`destination/filename`).
    #[must_use]
    pub fn final_path(&self) -> PathBuf {
        self.destination.join(&self.filename)
    }

    /// Stamps `updated_at` with the current wall clock.
    pub fn touch(&mut self) {
        self.updated_at = unix_millis();
    }
}

impl fmt::Display for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DownloadTask {{ id: {}, url: {}, status: {} }}",
            self.id, self.url, self.status
        )
    }
}

/// A completed/failed transfer as recorded in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadHistory {
    /// History row id.
    pub id: String,
    /// The task this record describes.
    pub task_id: String,
    /// Source URL.
    pub url: String,
    /// Final filename.
    pub filename: String,
    /// Originating module.
    pub module: DownloadModule,
    /// Terminal status the task reached.
    pub status: DownloadStatus,
    /// Expected total bytes, when known.
    pub total_size: Option<u64>,
    /// Bytes actually transferred.
    pub downloaded_size: u64,
    /// Wall-clock duration in seconds.
    pub duration_secs: u64,
    /// Average transfer rate in bytes per second, when computable.
    pub average_speed: Option<u64>,
    /// Task creation time, unix milliseconds.
    pub created_at: u64,
    /// Record time, unix milliseconds.
    pub completed_at: u64,
}

/// Aggregate counts over the task registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// All tracked tasks.
    pub total: usize,
    /// Tasks waiting for a worker.
    pub pending: usize,
    /// Tasks currently downloading.
    pub active: usize,
    /// Tasks finished successfully.
    pub completed: usize,
    /// Tasks that exhausted retries.
    pub failed: usize,
}

/// Shared handle to a task, mutated only by its owning component.
pub type SharedTask = Arc<RwLock<DownloadTask>>;

/// Wraps a task in a shared handle.
#[must_use]
pub fn shared(task: DownloadTask) -> SharedTask {
    Arc::new(RwLock::new(task))
}

/// Takes a copy-on-read snapshot of a shared task.
///
/// Lock poisoning is recovered rather than propagated: a panicked writer
/// leaves at worst a stale snapshot, never an inconsistent one.
#[must_use]
pub fn snapshot(task: &SharedTask) -> DownloadTask {
    task.read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Runs a closure with mutable access to a shared task.
pub fn with_task_mut<R>(task: &SharedTask, mutate: impl FnOnce(&mut DownloadTask) -> R) -> R {
    let mut guard = task.write().unwrap_or_else(PoisonError::into_inner);
    mutate(&mut guard)
}

/// Current wall clock in unix milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
