//! Chunk layout, resume, merge, and cleanup.
//!
//! [`ChunkManager`] owns everything about byte-range slices of a task: it
//! computes the layout for a known total size, rehydrates progress from
//! whatever temp files survive a restart, merges completed chunks into the
//! final file in strict index order, and cleans up the per-task temp
//! directory.
//!
//! # Filesystem layout
//!
//! ```text
//! {temp_dir}/{task_id}/{task_id}_chunk_{index}.tmp
//! ```
//!
//! Chunk temp paths are deterministic, which is what makes resume across
//! process restarts possible: the layout is recomputed (or loaded) and each
//! chunk's temp file is stat'd to discover how much of it already exists.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::task::{ChunkInfo, ChunkStatus, DownloadTask};

/// Buffer size for the merge copy loop.
const MERGE_BUF_SIZE: usize = 64 * 1024;

/// Aggregate byte/chunk progress over a chunk set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Sum of all chunk sizes.
    pub total_size: u64,
    /// Sum of bytes downloaded across chunks.
    pub downloaded_size: u64,
    /// Chunks in `completed` state.
    pub completed_chunks: usize,
    /// All chunks.
    pub total_chunks: usize,
}

/// Manages byte-range chunk layout and temp artifacts for tasks.
#[derive(Debug, Clone)]
pub struct ChunkManager {
    chunk_size: u64,
    base_temp_dir: PathBuf,
}

impl ChunkManager {
    /// Creates a manager with an explicit chunk size and temp root.
    #[must_use]
    pub fn new(chunk_size: u64, base_temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            base_temp_dir: base_temp_dir.into(),
        }
    }

    /// Creates a manager from the center configuration.
    #[must_use]
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(config.chunk.size, config.storage.temp_dir.clone())
    }

    /// Returns the configured chunk size in bytes.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Returns the temp root all task directories live under.
    #[must_use]
    pub fn base_temp_dir(&self) -> &Path {
        &self.base_temp_dir
    }

    /// Returns the temp directory for one task.
    #[must_use]
    pub fn task_temp_dir(&self, task_id: &str) -> PathBuf {
        self.base_temp_dir.join(task_id)
    }

    /// Returns the deterministic temp path for one chunk.
    #[must_use]
    pub fn chunk_path(&self, task_id: &str, index: usize) -> PathBuf {
        self.task_temp_dir(task_id)
            .join(format!("{task_id}_chunk_{index}.tmp"))
    }

    /// Creates the task temp directory if needed.
    ///
    /// # Errors
    ///
    /// Returns a classified filesystem error when the directory cannot be
    /// created.
    pub async fn ensure_temp_dir(&self, task_id: &str) -> Result<PathBuf, DownloadError> {
        let dir = self.task_temp_dir(task_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::from_io(dir.clone(), e))?;
        Ok(dir)
    }

    /// Partitions `[0, total_size)` into contiguous chunks.
    ///
    /// Every chunk is `chunk_size` bytes except the last, which holds the
    /// remainder. All chunks start out `pending` with zero bytes downloaded.
    #[must_use]
    pub fn create_chunks(&self, task_id: &str, total_size: u64) -> Vec<ChunkInfo> {
        let mut chunks = Vec::new();
        let mut start = 0u64;
        let mut index = 0usize;

        while start < total_size {
            let end = (start + self.chunk_size - 1).min(total_size - 1);
            chunks.push(ChunkInfo {
                index,
                start,
                end,
                size: end - start + 1,
                downloaded: 0,
                status: ChunkStatus::Pending,
                file_path: self.chunk_path(task_id, index),
            });
            start = end + 1;
            index += 1;
        }

        debug!(task_id, total_size, chunks = chunks.len(), "chunk layout created");
        chunks
    }

    /// Checks whether an existing layout still matches the reported size.
    ///
    /// Compatible means: non-empty, indexes contiguous from 0, each chunk
    /// starts at the previous chunk's `end + 1`, sizes are internally
    /// consistent, and the last chunk ends at `total_size - 1`. Anything
    /// else means the server-side file changed and the layout (including any
    /// resumed progress) must be discarded.
    #[must_use]
    pub fn is_compatible_layout(chunks: &[ChunkInfo], total_size: u64) -> bool {
        if chunks.is_empty() || total_size == 0 {
            return false;
        }

        let mut expected_start = 0u64;
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.index != i
                || chunk.start != expected_start
                || chunk.end < chunk.start
                || chunk.size != chunk.end - chunk.start + 1
            {
                return false;
            }
            expected_start = chunk.end + 1;
        }

        expected_start == total_size
    }

    /// Rehydrates per-chunk progress from temp files on disk.
    ///
    /// For each chunk: a missing file means no progress; a file at least as
    /// large as the chunk means completed; anything in between is a partial
    /// chunk safe to resume from its current length.
    #[instrument(skip(self, chunks), fields(chunks = chunks.len()))]
    pub async fn restore_chunk_progress(&self, chunks: &mut [ChunkInfo]) {
        for chunk in chunks.iter_mut() {
            match fs::metadata(&chunk.file_path).await {
                Ok(meta) if meta.len() >= chunk.size => {
                    chunk.downloaded = chunk.size;
                    chunk.status = ChunkStatus::Completed;
                }
                Ok(meta) => {
                    chunk.downloaded = meta.len();
                    chunk.status = ChunkStatus::Pending;
                }
                Err(_) => {
                    chunk.downloaded = 0;
                    chunk.status = ChunkStatus::Pending;
                }
            }
        }
    }

    /// Verifies that every chunk is completed and its temp file holds
    /// exactly the declared byte count.
    ///
    /// A single byte of difference anywhere invalidates the whole set,
    /// forcing a from-scratch re-chunk on the next attempt.
    #[instrument(skip(self, chunks), fields(chunks = chunks.len()))]
    pub async fn validate_chunks(&self, chunks: &[ChunkInfo]) -> bool {
        for chunk in chunks {
            if chunk.status != ChunkStatus::Completed {
                warn!(index = chunk.index, status = ?chunk.status, "chunk not completed");
                return false;
            }
            match fs::metadata(&chunk.file_path).await {
                Ok(meta) if meta.len() == chunk.size => {}
                Ok(meta) => {
                    warn!(
                        index = chunk.index,
                        expected = chunk.size,
                        actual = meta.len(),
                        "chunk size mismatch"
                    );
                    return false;
                }
                Err(error) => {
                    warn!(index = chunk.index, %error, "chunk file missing");
                    return false;
                }
            }
        }
        true
    }

    /// Appends completed chunks to the final file in strict index order.
    ///
    /// When the task carries a caller-supplied checksum, the merged bytes
    /// must hash to it or the merge fails (and the partial output is
    /// removed). On success, chunk temp files and the task temp directory
    /// are deleted.
    ///
    /// # Errors
    ///
    /// Returns a `checksum` error if any chunk is not completed or the
    /// digest mismatches, or a classified filesystem error for IO failures.
    #[instrument(skip(self, task, chunks), fields(task_id = %task.id, chunks = chunks.len()))]
    pub async fn merge_chunks(
        &self,
        task: &DownloadTask,
        chunks: &[ChunkInfo],
    ) -> Result<PathBuf, DownloadError> {
        let output_path = task.final_path();
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::from_io(parent.to_path_buf(), e))?;
        }

        let file = fs::File::create(&output_path)
            .await
            .map_err(|e| DownloadError::from_io(output_path.clone(), e))?;
        let mut writer = BufWriter::new(file);
        let mut hasher = task.checksum.as_ref().map(|_| Sha256::new());

        let merge_result = self
            .copy_chunks_in_order(chunks, &mut writer, hasher.as_mut())
            .await;

        if let Err(error) = merge_result {
            let _ = fs::remove_file(&output_path).await;
            return Err(error);
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::from_io(output_path.clone(), e))?;

        if let (Some(hasher), Some(expected)) = (hasher, task.checksum.as_deref()) {
            let actual = hex_digest(hasher);
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                let _ = fs::remove_file(&output_path).await;
                return Err(DownloadError::checksum(
                    output_path,
                    format!("expected sha256 {expected}, got {actual}"),
                ));
            }
        }

        self.cleanup_chunks(chunks).await;
        self.cleanup_task_temp_dir(&task.id).await;

        debug!(path = %output_path.display(), "merge complete");
        Ok(output_path)
    }

    async fn copy_chunks_in_order(
        &self,
        chunks: &[ChunkInfo],
        writer: &mut BufWriter<fs::File>,
        mut hasher: Option<&mut Sha256>,
    ) -> Result<(), DownloadError> {
        let mut buf = vec![0u8; MERGE_BUF_SIZE];
        for chunk in chunks {
            if chunk.status != ChunkStatus::Completed {
                return Err(DownloadError::checksum(
                    chunk.file_path.clone(),
                    format!("chunk {} is not completed", chunk.index),
                ));
            }

            let mut reader = fs::File::open(&chunk.file_path)
                .await
                .map_err(|e| DownloadError::from_io(chunk.file_path.clone(), e))?;
            loop {
                let read = reader
                    .read(&mut buf)
                    .await
                    .map_err(|e| DownloadError::from_io(chunk.file_path.clone(), e))?;
                if read == 0 {
                    break;
                }
                writer
                    .write_all(&buf[..read])
                    .await
                    .map_err(|e| DownloadError::from_io(chunk.file_path.clone(), e))?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&buf[..read]);
                }
            }
        }
        Ok(())
    }

    /// Deletes chunk temp files, ignoring those already gone.
    pub async fn cleanup_chunks(&self, chunks: &[ChunkInfo]) {
        for chunk in chunks {
            if let Err(error) = fs::remove_file(&chunk.file_path).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %chunk.file_path.display(), %error, "failed to remove chunk file");
                }
            }
        }
    }

    /// Removes a task's temp directory and everything in it.
    pub async fn cleanup_task_temp_dir(&self, task_id: &str) {
        let dir = self.task_temp_dir(task_id);
        if let Err(error) = fs::remove_dir_all(&dir).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), %error, "failed to remove task temp dir");
            }
        }
    }

    /// True when at least one chunk is completed or partially downloaded,
    /// meaning resume logic applies instead of a fresh start.
    #[must_use]
    pub fn can_resume(chunks: &[ChunkInfo]) -> bool {
        chunks
            .iter()
            .any(|chunk| chunk.status == ChunkStatus::Completed || chunk.downloaded > 0)
    }

    /// Aggregates byte and chunk counts over a set.
    #[must_use]
    pub fn chunk_progress(chunks: &[ChunkInfo]) -> ChunkProgress {
        let mut progress = ChunkProgress {
            total_chunks: chunks.len(),
            ..ChunkProgress::default()
        };
        for chunk in chunks {
            progress.total_size += chunk.size;
            progress.downloaded_size += chunk.downloaded;
            if chunk.status == ChunkStatus::Completed {
                progress.completed_chunks += 1;
            }
        }
        progress
    }
}

/// Hex-encodes a finished SHA-256 digest.
fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
