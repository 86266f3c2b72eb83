//! SQLite-backed persistence for tasks, chunks, and history.
//!
//! [`Store`] is the concrete persistence contract consumed by the
//! orchestrator: task records mirror every status transition, chunk rows
//! make resume-across-restart possible, and history keeps a bounded audit
//! of finished transfers.
//!
//! All timestamps are unix milliseconds stored as SQLite integers.

use std::path::PathBuf;
use std::str::FromStr;

use sqlx::Row;
use thiserror::Error;
use tracing::instrument;

use crate::db::Database;
use crate::task::{
    ChunkInfo, ChunkStatus, DownloadHistory, DownloadModule, DownloadProgress, DownloadStatus,
    DownloadTask, unix_millis,
};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An update/delete matched no row.
    #[error("task not found: {0}")]
    TaskNotFound(String),
}

/// Returns `Ok(())` if at least one row was affected; otherwise
/// [`StoreError::TaskNotFound`].
fn check_affected(id: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::TaskNotFound(id.to_string()))
    } else {
        Ok(())
    }
}

/// Persistence store for the download center.
#[derive(Debug, Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts or replaces a task record (chunks are saved separately).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn save_task(&self, task: &DownloadTask) -> Result<()> {
        sqlx::query(
            r"INSERT OR REPLACE INTO download_tasks (
                id, url, destination, filename, priority, module, status,
                downloaded_size, total_size, error, failure_count,
                created_at, updated_at, completed_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.url)
        .bind(task.destination.to_string_lossy().into_owned())
        .bind(&task.filename)
        .bind(i64::from(task.priority))
        .bind(task.module.as_str())
        .bind(task.status.as_str())
        .bind(to_i64(task.progress.downloaded_size))
        .bind(task.progress.total_size.map(to_i64))
        .bind(task.error.as_deref())
        .bind(i64::from(task.failure_count))
        .bind(to_i64(task.created_at))
        .bind(to_i64(task.updated_at))
        .bind(task.completed_at.map(to_i64))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Updates a task's status, stamping `completed_at` for completions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if no task exists with the id.
    #[instrument(skip(self))]
    pub async fn update_task_status(&self, task_id: &str, status: DownloadStatus) -> Result<()> {
        let now = to_i64(unix_millis());
        let completed_at = (status == DownloadStatus::Completed).then_some(now);
        let result = sqlx::query(
            r"UPDATE download_tasks
              SET status = ?, updated_at = ?,
                  completed_at = COALESCE(?, completed_at)
              WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(completed_at)
        .bind(task_id)
        .execute(self.db.pool())
        .await?;

        check_affected(task_id, result.rows_affected())
    }

    /// Updates a task's byte counters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if no task exists with the id.
    #[instrument(skip(self))]
    pub async fn update_progress(
        &self,
        task_id: &str,
        downloaded: u64,
        total: Option<u64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE download_tasks
              SET downloaded_size = ?, total_size = COALESCE(?, total_size), updated_at = ?
              WHERE id = ?",
        )
        .bind(to_i64(downloaded))
        .bind(total.map(to_i64))
        .bind(to_i64(unix_millis()))
        .bind(task_id)
        .execute(self.db.pool())
        .await?;

        check_affected(task_id, result.rows_affected())
    }

    /// Records a task's user-facing error message and failure count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if no task exists with the id.
    #[instrument(skip(self, error), fields(error = %error))]
    pub async fn update_task_error(
        &self,
        task_id: &str,
        error: &str,
        failure_count: u32,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE download_tasks
              SET error = ?, failure_count = ?, updated_at = ?
              WHERE id = ?",
        )
        .bind(error)
        .bind(i64::from(failure_count))
        .bind(to_i64(unix_millis()))
        .bind(task_id)
        .execute(self.db.pool())
        .await?;

        check_affected(task_id, result.rows_affected())
    }

    /// Replaces a task's chunk rows with the given layout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, chunks), fields(chunks = chunks.len()))]
    pub async fn save_chunks(&self, task_id: &str, chunks: &[ChunkInfo]) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(r"DELETE FROM download_chunks WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r"INSERT INTO download_chunks (
                    task_id, chunk_index, start_byte, end_byte, size,
                    downloaded, status, file_path
                  )
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(task_id)
            .bind(to_i64(chunk.index as u64))
            .bind(to_i64(chunk.start))
            .bind(to_i64(chunk.end))
            .bind(to_i64(chunk.size))
            .bind(to_i64(chunk.downloaded))
            .bind(chunk.status.as_str())
            .bind(chunk.file_path.to_string_lossy().into_owned())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Updates one chunk's status and byte counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self))]
    pub async fn update_chunk_status(
        &self,
        task_id: &str,
        index: usize,
        status: ChunkStatus,
        downloaded: u64,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE download_chunks
              SET status = ?, downloaded = ?
              WHERE task_id = ? AND chunk_index = ?",
        )
        .bind(status.as_str())
        .bind(to_i64(downloaded))
        .bind(task_id)
        .bind(to_i64(index as u64))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Loads one task with its chunk layout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_task(&self, task_id: &str) -> Result<Option<DownloadTask>> {
        let row = sqlx::query(r"SELECT * FROM download_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(self.db.pool())
            .await?;

        let Some(row) = row else { return Ok(None) };
        let mut task = task_from_row(&row);
        task.chunks = self.load_chunks(task_id).await?;
        Ok(Some(task))
    }

    /// Loads every persisted task (with chunks).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_all_tasks(&self) -> Result<Vec<DownloadTask>> {
        let rows = sqlx::query(
            r"SELECT * FROM download_tasks ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut task = task_from_row(row);
            task.chunks = self.load_chunks(&task.id).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Loads tasks that were pending, downloading, or paused - the set a
    /// restart should put back into the queue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_active_tasks(&self) -> Result<Vec<DownloadTask>> {
        let rows = sqlx::query(
            r"SELECT * FROM download_tasks
              WHERE status IN (?, ?, ?)
              ORDER BY priority DESC, created_at ASC",
        )
        .bind(DownloadStatus::Pending.as_str())
        .bind(DownloadStatus::Downloading.as_str())
        .bind(DownloadStatus::Paused.as_str())
        .fetch_all(self.db.pool())
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut task = task_from_row(row);
            task.chunks = self.load_chunks(&task.id).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Appends a history record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, record), fields(task_id = %record.task_id))]
    pub async fn save_to_history(&self, record: &DownloadHistory) -> Result<()> {
        sqlx::query(
            r"INSERT OR REPLACE INTO download_history (
                id, task_id, url, filename, module, status, total_size,
                downloaded_size, duration_secs, average_speed, created_at, completed_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.task_id)
        .bind(&record.url)
        .bind(&record.filename)
        .bind(record.module.as_str())
        .bind(record.status.as_str())
        .bind(record.total_size.map(to_i64))
        .bind(to_i64(record.downloaded_size))
        .bind(to_i64(record.duration_secs))
        .bind(record.average_speed.map(to_i64))
        .bind(to_i64(record.created_at))
        .bind(to_i64(record.completed_at))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Returns the most recent history records, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_history(&self, limit: u32) -> Result<Vec<DownloadHistory>> {
        let rows = sqlx::query(
            r"SELECT * FROM download_history ORDER BY completed_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(history_from_row).collect())
    }

    /// Removes all history records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn clear_history(&self) -> Result<u64> {
        let result = sqlx::query(r"DELETE FROM download_history")
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes a task and its chunk rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if no task exists with the id.
    #[instrument(skip(self))]
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        sqlx::query(r"DELETE FROM download_chunks WHERE task_id = ?")
            .bind(task_id)
            .execute(self.db.pool())
            .await?;
        let result = sqlx::query(r"DELETE FROM download_tasks WHERE id = ?")
            .bind(task_id)
            .execute(self.db.pool())
            .await?;

        check_affected(task_id, result.rows_affected())
    }

    /// Prunes history older than the retention window.
    ///
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn cleanup_expired_data(&self, retention_days: u32) -> Result<u64> {
        let cutoff =
            to_i64(unix_millis()) - i64::from(retention_days) * 24 * 60 * 60 * 1000;
        let result = sqlx::query(r"DELETE FROM download_history WHERE completed_at < ?")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn load_chunks(&self, task_id: &str) -> Result<Vec<ChunkInfo>> {
        let rows = sqlx::query(
            r"SELECT * FROM download_chunks WHERE task_id = ? ORDER BY chunk_index ASC",
        )
        .bind(task_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChunkInfo {
                index: usize::try_from(row.get::<i64, _>("chunk_index")).unwrap_or(0),
                start: to_u64(row.get("start_byte")),
                end: to_u64(row.get("end_byte")),
                size: to_u64(row.get("size")),
                downloaded: to_u64(row.get("downloaded")),
                status: ChunkStatus::from_str(row.get::<String, _>("status").as_str())
                    .unwrap_or(ChunkStatus::Pending),
                file_path: PathBuf::from(row.get::<String, _>("file_path")),
            })
            .collect())
    }
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> DownloadTask {
    DownloadTask {
        id: row.get("id"),
        url: row.get("url"),
        destination: PathBuf::from(row.get::<String, _>("destination")),
        filename: row.get("filename"),
        priority: u8::try_from(row.get::<i64, _>("priority")).unwrap_or(50),
        module: DownloadModule::from_str(row.get::<String, _>("module").as_str())
            .unwrap_or(DownloadModule::UserManual),
        status: DownloadStatus::from_str(row.get::<String, _>("status").as_str())
            .unwrap_or(DownloadStatus::Pending),
        progress: DownloadProgress {
            total_size: row.get::<Option<i64>, _>("total_size").map(to_u64),
            downloaded_size: to_u64(row.get("downloaded_size")),
            speed: 0.0,
            percentage: DownloadProgress::percentage_of(
                to_u64(row.get("downloaded_size")),
                row.get::<Option<i64>, _>("total_size").map(to_u64),
            ),
            remaining_time_secs: None,
        },
        chunks: Vec::new(),
        error: row.get("error"),
        failure_count: u32::try_from(row.get::<i64, _>("failure_count")).unwrap_or(0),
        headers: Vec::new(),
        allow_unknown_size: false,
        checksum: None,
        hidden: false,
        created_at: to_u64(row.get("created_at")),
        updated_at: to_u64(row.get("updated_at")),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(to_u64),
    }
}

fn history_from_row(row: &sqlx::sqlite::SqliteRow) -> DownloadHistory {
    DownloadHistory {
        id: row.get("id"),
        task_id: row.get("task_id"),
        url: row.get("url"),
        filename: row.get("filename"),
        module: DownloadModule::from_str(row.get::<String, _>("module").as_str())
            .unwrap_or(DownloadModule::UserManual),
        status: DownloadStatus::from_str(row.get::<String, _>("status").as_str())
            .unwrap_or(DownloadStatus::Completed),
        total_size: row.get::<Option<i64>, _>("total_size").map(to_u64),
        downloaded_size: to_u64(row.get("downloaded_size")),
        duration_secs: to_u64(row.get("duration_secs")),
        average_speed: row.get::<Option<i64>, _>("average_speed").map(to_u64),
        created_at: to_u64(row.get("created_at")),
        completed_at: to_u64(row.get("completed_at")),
    }
}

/// SQLite integers are i64; byte counts saturate rather than wrap.
fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
