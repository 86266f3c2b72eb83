//! Download execution: sizing, chunk fan-out, merge, and validation.
//!
//! A [`DownloadWorker`] owns zero or more in-flight tasks. For each task it
//! walks the state machine `sizing -> chunking -> downloading (fan-out) ->
//! merging -> validating -> done`, with `failed`/`cancelled` reachable from
//! every state.
//!
//! # Concurrency model
//!
//! Chunks that still need bytes are distributed round-robin across a
//! bounded number of lanes - `min(adjusted concurrency, runnable chunks)` -
//! and each lane processes its chunks sequentially, one ranged request at a
//! time. At no point does a single task have more in-flight requests than
//! that bound. Each chunk is owned by exactly one lane, so chunk state has
//! a single writer; aggregate byte counts flow through an atomic counter.
//!
//! Cancellation is a per-task [`CancellationToken`]: cancelling aborts all
//! of the task's in-flight requests without touching other tasks.

mod client;

pub use client::HttpClient;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chunk::ChunkManager;
use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::network::ConcurrencyAdjuster;
use crate::progress::ProgressTracker;
use crate::retry::RetryStrategy;
use crate::task::{
    ChunkInfo, ChunkStatus, DownloadProgress, DownloadStatus, SharedTask, snapshot, with_task_mut,
};

/// Observer invoked with throttled progress snapshots for a task.
pub type ProgressSink = Arc<dyn Fn(&str, &DownloadProgress) + Send + Sync>;

/// Executes download tasks with bounded per-task chunk concurrency.
pub struct DownloadWorker {
    client: HttpClient,
    chunk_manager: ChunkManager,
    adjuster: Arc<ConcurrencyAdjuster>,
    chunk_retry: RetryStrategy,
    max_tasks: usize,
    active: DashMap<String, CancellationToken>,
}

impl std::fmt::Debug for DownloadWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadWorker")
            .field("max_tasks", &self.max_tasks)
            .field("active_tasks", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl DownloadWorker {
    /// Creates a worker wired to the shared adjuster.
    #[must_use]
    pub fn new(config: &DownloadConfig, adjuster: Arc<ConcurrencyAdjuster>) -> Self {
        Self {
            client: HttpClient::from_config(config),
            chunk_manager: ChunkManager::from_config(config),
            adjuster,
            chunk_retry: RetryStrategy::for_chunks(config),
            max_tasks: config.concurrency.max_concurrent.max(1),
            active: DashMap::new(),
        }
    }

    /// Whether this worker has a free task slot.
    #[must_use]
    pub fn can_accept_task(&self) -> bool {
        self.active.len() < self.max_tasks
    }

    /// Number of tasks currently executing.
    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.active.len()
    }

    /// Ids of tasks currently executing.
    #[must_use]
    pub fn active_task_ids(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Cancels a task's in-flight requests. Returns false when the task is
    /// not active on this worker.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        if let Some(entry) = self.active.get(task_id) {
            entry.value().cancel();
            true
        } else {
            false
        }
    }

    /// Runs one task to completion, failure, or cancellation.
    ///
    /// On success the merged file exists at the task's final path and the
    /// task's progress reads 100%. Chunk state is left on the shared task
    /// for the orchestrator to persist.
    ///
    /// # Errors
    ///
    /// Returns the classified error that ended the task. Cancellation
    /// surfaces as [`DownloadError::Cancelled`].
    #[instrument(skip(self, task, sink), fields(task_id))]
    pub async fn run_task(
        &self,
        task: SharedTask,
        sink: ProgressSink,
    ) -> Result<(), DownloadError> {
        let view = snapshot(&task);
        tracing::Span::current().record("task_id", view.id.as_str());

        // A pause or cancel can land between task-level retry attempts,
        // while no request is in flight to abort. Refuse to start.
        if view.status.is_terminal() || view.status == DownloadStatus::Paused {
            return Err(DownloadError::cancelled(&view.id));
        }

        if self.active.contains_key(&view.id) {
            return Err(DownloadError::unknown(format!(
                "task {} is already active",
                view.id
            )));
        }
        if !self.can_accept_task() {
            return Err(DownloadError::unknown(
                "maximum concurrent downloads reached",
            ));
        }

        let cancel = CancellationToken::new();
        self.active.insert(view.id.clone(), cancel.clone());
        let result = self.execute(&task, &view.id, &cancel, sink).await;
        self.active.remove(&view.id);

        match &result {
            Ok(()) => info!("task complete"),
            Err(error) if error.is_cancelled() => debug!("task cancelled"),
            Err(error) => warn!(%error, kind = %error.kind(), "task failed"),
        }
        result
    }

    async fn execute(
        &self,
        task: &SharedTask,
        task_id: &str,
        cancel: &CancellationToken,
        sink: ProgressSink,
    ) -> Result<(), DownloadError> {
        let view = snapshot(task);

        // Sizing: HEAD, falling back to a 0-0 ranged GET inside the client.
        let total_size = self
            .client
            .resolve_total_size(&view.url, &view.headers)
            .await?;

        let Some(total_size) = total_size else {
            if view.allow_unknown_size {
                return self.single_stream(task, task_id, cancel, sink).await;
            }
            return Err(DownloadError::network(
                &view.url,
                "cannot determine file size",
            ));
        };

        // Chunk resolution: reuse a compatible layout (resume across
        // restarts), otherwise re-chunk from scratch.
        let mut chunks = if !view.chunks.is_empty()
            && ChunkManager::is_compatible_layout(&view.chunks, total_size)
        {
            debug!(chunks = view.chunks.len(), "reusing existing chunk layout");
            view.chunks.clone()
        } else {
            if !view.chunks.is_empty() {
                warn!(
                    total_size,
                    "stored chunk layout incompatible with reported size; re-chunking"
                );
            }
            self.chunk_manager.create_chunks(task_id, total_size)
        };

        self.chunk_manager.ensure_temp_dir(task_id).await?;
        self.chunk_manager.restore_chunk_progress(&mut chunks).await;

        with_task_mut(task, |t| {
            t.progress.total_size = Some(total_size);
            t.chunks = chunks.clone();
            t.touch();
        });

        self.fan_out(task, task_id, total_size, chunks, cancel, &sink)
            .await?;

        // Every lane finished cleanly: validate and merge.
        let chunks = snapshot(task).chunks;
        if !self.chunk_manager.validate_chunks(&chunks).await {
            return Err(DownloadError::checksum(
                self.chunk_manager.task_temp_dir(task_id),
                "chunk validation failed",
            ));
        }

        let view = snapshot(task);
        self.chunk_manager.merge_chunks(&view, &chunks).await?;

        with_task_mut(task, |t| {
            t.progress = DownloadProgress {
                total_size: Some(total_size),
                downloaded_size: total_size,
                speed: t.progress.speed,
                percentage: 100,
                remaining_time_secs: None,
            };
            t.touch();
        });
        sink(task_id, &snapshot(task).progress);
        Ok(())
    }

    /// Downloads all runnable chunks through bounded lanes.
    async fn fan_out(
        &self,
        task: &SharedTask,
        task_id: &str,
        total_size: u64,
        chunks: Vec<ChunkInfo>,
        cancel: &CancellationToken,
        sink: &ProgressSink,
    ) -> Result<(), DownloadError> {
        let runnable: Vec<ChunkInfo> = chunks.iter().filter(|c| c.is_runnable()).cloned().collect();
        if runnable.is_empty() {
            return Ok(());
        }

        let lane_count = self
            .adjuster
            .current()
            .clamp(1, self.max_tasks)
            .min(runnable.len());
        debug!(
            chunks = runnable.len(),
            lanes = lane_count,
            "starting chunk fan-out"
        );

        let already_downloaded: u64 = chunks.iter().map(|c| c.downloaded).sum();
        let downloaded = Arc::new(AtomicU64::new(already_downloaded));
        let tracker = Arc::new(Mutex::new(ProgressTracker::new(task_id)));
        {
            let task = SharedTask::clone(task);
            let sink = Arc::clone(sink);
            let callback_task_id = task_id.to_string();
            let mut guard = tracker.lock().unwrap_or_else(PoisonError::into_inner);
            guard.set_callback(Box::new(move |progress| {
                with_task_mut(&task, |t| {
                    t.progress = progress.clone();
                    t.touch();
                });
                sink(&callback_task_id, progress);
            }));
        }

        // Round-robin assignment: lane i owns runnable[i], runnable[i+n], ...
        let mut lanes: Vec<Vec<ChunkInfo>> = vec![Vec::new(); lane_count];
        for (position, chunk) in runnable.into_iter().enumerate() {
            lanes[position % lane_count].push(chunk);
        }

        let mut handles = Vec::with_capacity(lane_count);
        for lane_chunks in lanes {
            let worker_client = self.client.clone();
            let retry = self.chunk_retry.clone();
            let task = SharedTask::clone(task);
            let task_id = task_id.to_string();
            let url = snapshot(&task).url;
            let headers = snapshot(&task).headers;
            let cancel = cancel.clone();
            let downloaded = Arc::clone(&downloaded);
            let tracker = Arc::clone(&tracker);

            handles.push(tokio::spawn(async move {
                run_lane(
                    &worker_client,
                    &retry,
                    &task,
                    &task_id,
                    &url,
                    &headers,
                    lane_chunks,
                    &cancel,
                    &downloaded,
                    &tracker,
                    total_size,
                )
                .await
            }));
        }

        let mut first_error: Option<DownloadError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(join_error) => {
                    warn!(error = %join_error, "chunk lane panicked");
                    if first_error.is_none() {
                        first_error = Some(DownloadError::unknown("chunk lane panicked"));
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            // Cancellation wins over whatever error a lane surfaced.
            return Err(DownloadError::cancelled(task_id));
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Single-stream, non-chunked fallback: no ranges, no resume.
    async fn single_stream(
        &self,
        task: &SharedTask,
        task_id: &str,
        cancel: &CancellationToken,
        sink: ProgressSink,
    ) -> Result<(), DownloadError> {
        let view = snapshot(task);
        debug!("size unknown; using single-stream fallback");

        self.chunk_manager.ensure_temp_dir(task_id).await?;
        let temp_path = self
            .chunk_manager
            .task_temp_dir(task_id)
            .join(format!("{task_id}_single.tmp"));

        let downloaded = Arc::new(AtomicU64::new(0));
        let tracker = Arc::new(Mutex::new(ProgressTracker::new(task_id)));
        {
            let task = SharedTask::clone(task);
            let sink = Arc::clone(&sink);
            let callback_task_id = task_id.to_string();
            let mut guard = tracker.lock().unwrap_or_else(PoisonError::into_inner);
            guard.set_callback(Box::new(move |progress| {
                with_task_mut(&task, |t| {
                    t.progress = progress.clone();
                    t.touch();
                });
                sink(&callback_task_id, progress);
            }));
        }

        let on_bytes = {
            let downloaded = Arc::clone(&downloaded);
            let tracker = Arc::clone(&tracker);
            move |n: u64| {
                let total = downloaded.fetch_add(n, Ordering::Relaxed) + n;
                tracker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(total, None);
            }
        };

        let written = self
            .client
            .fetch_single_stream(task_id, &view.url, &view.headers, &temp_path, cancel, &on_bytes)
            .await?;

        let final_path = view.final_path();
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::from_io(parent.to_path_buf(), e))?;
        }
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| DownloadError::from_io(final_path.clone(), e))?;
        self.chunk_manager.cleanup_task_temp_dir(task_id).await;

        with_task_mut(task, |t| {
            t.progress = DownloadProgress {
                total_size: Some(written),
                downloaded_size: written,
                speed: t.progress.speed,
                percentage: 100,
                remaining_time_secs: None,
            };
            t.touch();
        });
        sink(task_id, &snapshot(task).progress);
        info!(bytes = written, "single-stream download complete");
        Ok(())
    }
}

/// Processes one lane's chunks sequentially with per-chunk retries.
#[allow(clippy::too_many_arguments)]
async fn run_lane(
    client: &HttpClient,
    retry: &RetryStrategy,
    task: &SharedTask,
    task_id: &str,
    url: &str,
    headers: &[(String, String)],
    lane_chunks: Vec<ChunkInfo>,
    cancel: &CancellationToken,
    downloaded: &Arc<AtomicU64>,
    tracker: &Arc<Mutex<ProgressTracker>>,
    total_size: u64,
) -> Result<(), DownloadError> {
    let mut lane_error: Option<DownloadError> = None;

    for mut chunk in lane_chunks {
        if cancel.is_cancelled() {
            mark_cancelled_chunk(task, &mut chunk);
            continue;
        }

        set_chunk_state(task, &chunk, ChunkStatus::Downloading, chunk.downloaded);

        let mut attempt = 0u32;
        let outcome = loop {
            let on_bytes = {
                let downloaded = Arc::clone(downloaded);
                let tracker = Arc::clone(tracker);
                move |n: u64| {
                    let total = downloaded.fetch_add(n, Ordering::Relaxed) + n;
                    tracker
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record(total, Some(total_size));
                }
            };

            match client
                .fetch_chunk(task_id, url, headers, &mut chunk, cancel, &on_bytes)
                .await
            {
                Ok(()) => break Ok(()),
                Err(error) if error.is_cancelled() => break Err(error),
                Err(error) => {
                    if !retry.should_retry(&error, attempt) {
                        break Err(error);
                    }
                    let delay = retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        index = chunk.index,
                        attempt,
                        delay_ms = delay.as_millis(),
                        %error,
                        "retrying chunk"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        match outcome {
            Ok(()) => {
                set_chunk_state(task, &chunk, ChunkStatus::Completed, chunk.size);
                // Milestone: chunk completion bypasses the throttle.
                tracker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .force_update();
            }
            Err(error) if error.is_cancelled() => {
                mark_cancelled_chunk(task, &mut chunk);
                if lane_error.is_none() {
                    lane_error = Some(error);
                }
            }
            Err(error) => {
                set_chunk_state(task, &chunk, ChunkStatus::Failed, chunk.downloaded);
                if lane_error.is_none() {
                    lane_error = Some(error);
                }
            }
        }
    }

    match lane_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Cancellation semantics: a chunk with progress stays `pending`
/// (resumable), an untouched chunk is marked `failed`.
fn mark_cancelled_chunk(task: &SharedTask, chunk: &mut ChunkInfo) {
    let status = if chunk.downloaded > 0 {
        ChunkStatus::Pending
    } else {
        ChunkStatus::Failed
    };
    chunk.status = status;
    set_chunk_state(task, chunk, status, chunk.downloaded);
}

/// Writes one chunk's state back onto the shared task.
fn set_chunk_state(task: &SharedTask, chunk: &ChunkInfo, status: ChunkStatus, downloaded: u64) {
    with_task_mut(task, |t| {
        if let Some(entry) = t.chunks.iter_mut().find(|c| c.index == chunk.index) {
            entry.status = status;
            entry.downloaded = downloaded;
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::task::{DownloadRequest, DownloadTask, shared};

    fn worker_with_max(max: usize) -> DownloadWorker {
        let mut config = DownloadConfig::default();
        config.concurrency.max_concurrent = max;
        let monitor = Arc::new(crate::network::NetworkMonitor::with_probe_urls([]));
        let adjuster = Arc::new(ConcurrencyAdjuster::new(&config, monitor));
        DownloadWorker::new(&config, adjuster)
    }

    #[test]
    fn test_worker_accepts_tasks_up_to_limit() {
        let worker = worker_with_max(2);
        assert!(worker.can_accept_task());
        worker.active.insert("a".into(), CancellationToken::new());
        assert!(worker.can_accept_task());
        worker.active.insert("b".into(), CancellationToken::new());
        assert!(!worker.can_accept_task());
        assert_eq!(worker.active_task_count(), 2);
    }

    #[test]
    fn test_cancel_task_unknown_id_is_false() {
        let worker = worker_with_max(2);
        assert!(!worker.cancel_task("ghost"));
    }

    #[tokio::test]
    async fn test_run_task_rejects_duplicate_active_id() {
        let worker = worker_with_max(2);
        worker.active.insert("dup".into(), CancellationToken::new());

        let mut request = DownloadRequest::new("https://example.invalid/f.bin", "/tmp");
        request.id = Some("dup".to_string());
        let task = shared(DownloadTask::from_request(&request, 50));

        let sink: ProgressSink = Arc::new(|_, _| {});
        let error = worker.run_task(task, sink).await.unwrap_err();
        assert!(error.to_string().contains("already active"));
    }

    #[test]
    fn test_mark_cancelled_chunk_states() {
        let request = DownloadRequest::new("https://example.com/f.bin", "/tmp");
        let mut task_value = DownloadTask::from_request(&request, 50);
        let mut progressed = ChunkInfo {
            index: 0,
            start: 0,
            end: 9,
            size: 10,
            downloaded: 4,
            status: ChunkStatus::Downloading,
            file_path: "/tmp/c0".into(),
        };
        let mut untouched = ChunkInfo {
            index: 1,
            start: 10,
            end: 19,
            size: 10,
            downloaded: 0,
            status: ChunkStatus::Pending,
            file_path: "/tmp/c1".into(),
        };
        task_value.chunks = vec![progressed.clone(), untouched.clone()];
        let task = shared(task_value);

        mark_cancelled_chunk(&task, &mut progressed);
        mark_cancelled_chunk(&task, &mut untouched);

        let view = snapshot(&task);
        assert_eq!(view.chunks[0].status, ChunkStatus::Pending);
        assert_eq!(view.chunks[1].status, ChunkStatus::Failed);
    }
}
