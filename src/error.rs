//! Error types for the download center.
//!
//! Every failure observed by the center is classified into a
//! [`DownloadError`] at the point it is first seen - transport errors,
//! filesystem errors, and HTTP statuses are pattern-matched into the
//! taxonomy here and never propagated as opaque boxed errors.
//!
//! Each variant maps to a stable [`ErrorKind`], a [`Severity`], and a
//! retryability flag consumed by the retry strategy:
//!
//! | Kind | Severity | Retryable |
//! |------|----------|-----------|
//! | `network` | medium | yes |
//! | `timeout` | medium | yes |
//! | `disk_space` | high | no |
//! | `permission` | high | no |
//! | `checksum` | medium | yes |
//! | `file_not_found` | high | no |
//! | `invalid_url` | high | no |
//! | `cancelled` | low | no |
//! | `unknown` | medium | yes |
//!
//! Unknown errors default to retryable, erring toward resilience over
//! silent data loss.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Stable kind identifiers for download failures.
///
/// The string form (snake_case) is what gets persisted alongside failed
/// tasks and rendered in user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport-level failure (DNS, connection refused, reset, bad status).
    Network,
    /// A network operation exceeded the configured timeout.
    Timeout,
    /// The local disk is full (or quota exhausted).
    DiskSpace,
    /// The process lacks permission to write the destination.
    Permission,
    /// Chunk validation or checksum verification failed.
    Checksum,
    /// The remote resource does not exist (404/410) or a required local
    /// file is missing.
    FileNotFound,
    /// The request URL could not be parsed.
    InvalidUrl,
    /// The task was cancelled by the caller.
    Cancelled,
    /// Anything that could not be classified.
    Unknown,
}

impl ErrorKind {
    /// Returns the persisted string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::DiskSpace => "disk_space",
            Self::Permission => "permission",
            Self::Checksum => "checksum",
            Self::FileNotFound => "file_not_found",
            Self::InvalidUrl => "invalid_url",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How serious a failure is, from "retry quietly" to "stop everything".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Expected during normal operation (e.g. cancellation).
    Low,
    /// Needs attention but usually recoverable.
    Medium,
    /// Requires user intervention (disk full, permissions).
    High,
    /// Never retried regardless of the error's own retry flag.
    Critical,
}

/// Errors that can occur while downloading.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS, or an
    /// unexpected HTTP status).
    #[error("network error downloading {url}: {detail}")]
    Network {
        /// The URL that failed.
        url: String,
        /// Human-readable description of the transport failure.
        detail: String,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The local disk is full.
    #[error("insufficient disk space writing {path}: {source}")]
    DiskSpace {
        /// Path being written when the disk filled up.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Permission denied writing a local file.
    #[error("permission denied for {path}: {source}")]
    Permission {
        /// Path the process could not write.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Chunk set failed validation, or a caller-supplied checksum did not
    /// match the merged file.
    #[error("checksum validation failed for {path}: {detail}")]
    Checksum {
        /// The file that failed verification.
        path: PathBuf,
        /// What exactly mismatched.
        detail: String,
    },

    /// The remote resource does not exist.
    #[error("file not found: {url}")]
    FileNotFound {
        /// The URL that returned 404/410.
        url: String,
    },

    /// The provided URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The task was cancelled. Never retried, never reported as a failure.
    #[error("download cancelled for task {task_id}")]
    Cancelled {
        /// The cancelled task's id.
        task_id: String,
    },

    /// Generic filesystem error that is neither disk-space nor permission.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Unclassified failure.
    #[error("{detail}")]
    Unknown {
        /// Whatever description is available.
        detail: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, promoting timeouts to
    /// their own kind.
    pub fn from_reqwest(url: impl Into<String>, source: &reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network {
                url,
                detail: source.to_string(),
            }
        }
    }

    /// Creates an error from an unexpected HTTP status code.
    ///
    /// 404 and 410 become [`DownloadError::FileNotFound`]; everything else
    /// is a network error carrying the status in its detail.
    pub fn from_status(url: impl Into<String>, status: u16) -> Self {
        let url = url.into();
        match status {
            404 | 410 => Self::FileNotFound { url },
            _ => Self::Network {
                url,
                detail: format!("HTTP {status}"),
            },
        }
    }

    /// Creates an error from a filesystem failure, classifying disk-full and
    /// permission conditions into their own kinds.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                Self::DiskSpace { path, source }
            }
            std::io::ErrorKind::PermissionDenied => Self::Permission { path, source },
            _ => Self::Io { path, source },
        }
    }

    /// Creates a network error with a free-form detail message.
    pub fn network(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a checksum/validation error.
    pub fn checksum(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Checksum {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a cancellation marker for a task.
    pub fn cancelled(task_id: impl Into<String>) -> Self {
        Self::Cancelled {
            task_id: task_id.into(),
        }
    }

    /// Creates an unclassified error.
    pub fn unknown(detail: impl Into<String>) -> Self {
        Self::Unknown {
            detail: detail.into(),
        }
    }

    /// Returns the taxonomy kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DiskSpace { .. } => ErrorKind::DiskSpace,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::Checksum { .. } => ErrorKind::Checksum,
            Self::FileNotFound { .. } => ErrorKind::FileNotFound,
            Self::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            // Generic IO is unclassified: retry in case the condition clears.
            Self::Io { .. } | Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Returns the severity associated with this error's kind.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self.kind() {
            ErrorKind::Cancelled => Severity::Low,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Checksum | ErrorKind::Unknown => {
                Severity::Medium
            }
            ErrorKind::DiskSpace
            | ErrorKind::Permission
            | ErrorKind::FileNotFound
            | ErrorKind::InvalidUrl => Severity::High,
        }
    }

    /// Returns whether the retry strategy may re-attempt after this error.
    ///
    /// Disk-space, permission, and file-not-found conditions are fatal
    /// regardless of attempt count; cancellation is terminal by definition.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        match self.kind() {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Checksum | ErrorKind::Unknown => {
                true
            }
            ErrorKind::DiskSpace
            | ErrorKind::Permission
            | ErrorKind::FileNotFound
            | ErrorKind::InvalidUrl
            | ErrorKind::Cancelled => false,
        }
    }

    /// Returns true if this error is the cancellation marker.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
