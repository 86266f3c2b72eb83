//! Notification boundary for task lifecycle events.
//!
//! The orchestrator fans lifecycle events out through a
//! [`NotificationSink`] trait object, keeping UI/transport concerns outside
//! this crate. Every method has a no-op default so implementers subscribe
//! only to the events they care about. [`TracingNotifier`] is the built-in
//! sink that mirrors events onto the log stream.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::task::{DownloadProgress, DownloadTask};

/// Receives task lifecycle events from the download center.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// A task was accepted into the queue.
    async fn on_task_added(&self, task: &DownloadTask) {
        let _ = task;
    }

    /// Throttled progress for an executing task.
    async fn on_task_progress(&self, task_id: &str, progress: &DownloadProgress) {
        let _ = (task_id, progress);
    }

    /// A task finished and its file was merged successfully.
    async fn on_task_completed(&self, task: &DownloadTask) {
        let _ = task;
    }

    /// A task exhausted its retries or hit a fatal error.
    ///
    /// Never invoked for cancellations.
    async fn on_task_failed(&self, task: &DownloadTask) {
        let _ = task;
    }

    /// A task is about to be retried after a failed attempt.
    async fn on_task_retrying(&self, task_id: &str, attempt: u32, error: &str, delay: Duration) {
        let _ = (task_id, attempt, error, delay);
    }

    /// Any other status transition (paused, resumed, cancelled, priority
    /// change, removal).
    async fn on_task_updated(&self, task: &DownloadTask) {
        let _ = task;
    }
}

/// Sink that writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn on_task_added(&self, task: &DownloadTask) {
        info!(task_id = %task.id, url = %task.url, priority = task.priority, "task added");
    }

    async fn on_task_progress(&self, task_id: &str, progress: &DownloadProgress) {
        debug!(
            task_id,
            percentage = progress.percentage,
            downloaded = progress.downloaded_size,
            speed = format_args!("{:.0}", progress.speed),
            "task progress"
        );
    }

    async fn on_task_completed(&self, task: &DownloadTask) {
        info!(task_id = %task.id, path = %task.final_path().display(), "task completed");
    }

    async fn on_task_failed(&self, task: &DownloadTask) {
        warn!(
            task_id = %task.id,
            error = task.error.as_deref().unwrap_or("unknown"),
            failures = task.failure_count,
            "task failed"
        );
    }

    async fn on_task_retrying(&self, task_id: &str, attempt: u32, error: &str, delay: Duration) {
        warn!(
            task_id,
            attempt,
            delay_ms = delay.as_millis(),
            error,
            "retrying task"
        );
    }

    async fn on_task_updated(&self, task: &DownloadTask) {
        debug!(task_id = %task.id, status = %task.status, "task updated");
    }
}
