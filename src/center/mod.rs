//! The download center orchestrator.
//!
//! [`DownloadCenter`] owns every component: the priority queue, the worker
//! pool, the network monitor and concurrency adjuster, the persistence
//! store, and the notification sink. A single cooperative scheduling loop
//! ticks once a second, pulling the highest-priority pending task whenever
//! a worker slot is free; a second loop refreshes network observations.
//!
//! Ownership rules (single-writer discipline):
//! - the queue is mutated only by the orchestrator, behind a mutex whose
//!   guard never crosses an await point;
//! - a task's chunks are mutated only by the worker executing it;
//! - everything handed to callers is a copy-on-read snapshot.
//!
//! Priority is advisory for scheduling order only: already-downloading
//! tasks are never preempted, and failed tasks are never re-queued by the
//! scheduler - only an explicit [`DownloadCenter::retry_task`] revives
//! them.

mod notify;

pub use notify::{NotificationSink, TracingNotifier};

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::chunk::ChunkManager;
use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::network::{ConcurrencyAdjuster, NetworkMonitor, NetworkQuality, NetworkStatus};
use crate::persist::{Store, StoreError};
use crate::priority::{PriorityCalculator, UserAction};
use crate::queue::TaskQueue;
use crate::retry::RetryStrategy;
use crate::task::{
    DownloadHistory, DownloadProgress, DownloadRequest, DownloadStatus, DownloadTask, QueueStats,
    SharedTask, snapshot, unix_millis, with_task_mut,
};
use crate::worker::{DownloadWorker, ProgressSink};

/// Scheduler tick interval.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Network monitoring cadence.
const NETWORK_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Default history page size.
const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Errors surfaced by the orchestrator API.
#[derive(Debug, Error)]
pub enum CenterError {
    /// No task with the given id is tracked.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The operation does not apply to the task's current state.
    #[error("task {id} is not {expected} (status: {actual})")]
    InvalidState {
        /// The task in question.
        id: String,
        /// What the operation required.
        expected: &'static str,
        /// The status it actually had.
        actual: DownloadStatus,
    },

    /// A download-classified failure (e.g. invalid URL on submission).
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// A persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a temp-file sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Orphaned entries removed.
    pub removed: usize,
    /// Bytes reclaimed.
    pub freed_bytes: u64,
}

/// One scheduling of a task onto a worker. The run id distinguishes a
/// fresh assignment from a stale execution still winding down after a
/// pause/resume cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TaskAssignment {
    worker: usize,
    run: u64,
}

struct CenterInner {
    config: DownloadConfig,
    queue: Mutex<TaskQueue>,
    store: Store,
    notifier: Arc<dyn NotificationSink>,
    monitor: Arc<NetworkMonitor>,
    adjuster: Arc<ConcurrencyAdjuster>,
    priority: PriorityCalculator,
    chunk_manager: ChunkManager,
    workers: Vec<Arc<DownloadWorker>>,
    task_retry: RetryStrategy,
    /// task id -> the worker assignment currently executing it.
    task_worker: DashMap<String, TaskAssignment>,
    run_counter: std::sync::atomic::AtomicU64,
    shutdown: CancellationToken,
}

impl CenterInner {
    fn lock_queue(&self) -> MutexGuard<'_, TaskQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unified download management: priority scheduling, chunked transfer,
/// persistence, and lifecycle notifications.
#[derive(Clone)]
pub struct DownloadCenter {
    inner: Arc<CenterInner>,
}

impl std::fmt::Debug for DownloadCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCenter")
            .field("workers", &self.inner.workers.len())
            .field("active", &self.inner.task_worker.len())
            .finish_non_exhaustive()
    }
}

impl DownloadCenter {
    /// Creates a center with the default network monitor.
    #[must_use]
    pub fn new(config: DownloadConfig, store: Store, notifier: Arc<dyn NotificationSink>) -> Self {
        Self::with_monitor(config, store, notifier, Arc::new(NetworkMonitor::new()))
    }

    /// Creates a center with an injected network monitor (deterministic
    /// tests point the monitor at a mock server or feed samples directly).
    #[must_use]
    pub fn with_monitor(
        config: DownloadConfig,
        store: Store,
        notifier: Arc<dyn NotificationSink>,
        monitor: Arc<NetworkMonitor>,
    ) -> Self {
        let adjuster = Arc::new(ConcurrencyAdjuster::new(&config, Arc::clone(&monitor)));
        let worker_count = config.concurrency.max_concurrent.max(1);
        let workers = (0..worker_count)
            .map(|_| Arc::new(DownloadWorker::new(&config, Arc::clone(&adjuster))))
            .collect();

        Self {
            inner: Arc::new(CenterInner {
                chunk_manager: ChunkManager::from_config(&config),
                task_retry: RetryStrategy::for_tasks(&config),
                priority: PriorityCalculator::default(),
                queue: Mutex::new(TaskQueue::new()),
                task_worker: DashMap::new(),
                run_counter: std::sync::atomic::AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                config,
                store,
                notifier,
                monitor,
                adjuster,
                workers,
            }),
        }
    }

    /// Starts the scheduling and network-monitoring loops.
    ///
    /// Also restores persisted tasks (crash recovery: tasks left
    /// `downloading` return to `pending` with their chunk layouts intact)
    /// and sweeps orphaned temp directories.
    ///
    /// # Errors
    ///
    /// Returns a classified error when the temp directory cannot be created
    /// or persisted state cannot be read.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), CenterError> {
        let temp_dir = self.inner.config.storage.temp_dir.clone();
        fs::create_dir_all(&temp_dir)
            .await
            .map_err(|e| DownloadError::from_io(temp_dir, e))?;

        self.restore_persisted_tasks().await?;
        let swept = self.cleanup_temp_files().await;
        if swept.removed > 0 {
            info!(
                removed = swept.removed,
                freed_bytes = swept.freed_bytes,
                "temp sweep complete"
            );
        }

        let scheduler = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = scheduler.shutdown.cancelled() => break,
                    () = tokio::time::sleep(SCHEDULER_TICK) => {
                        schedule_pending(&scheduler).await;
                    }
                }
            }
            debug!("scheduler loop stopped");
        });

        let network = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let status = network.monitor.monitor_network().await;
                network.priority.set_network_status(status);

                if network.config.concurrency.auto_adjust {
                    let (high, total) = {
                        let queue = network.lock_queue();
                        let pending = queue.pending_tasks();
                        let high = pending
                            .iter()
                            .filter(|t| t.priority >= ConcurrencyAdjuster::high_priority_threshold())
                            .count();
                        (high, pending.len())
                    };
                    network.adjuster.adjust(high, total);
                }

                tokio::select! {
                    () = network.shutdown.cancelled() => break,
                    () = tokio::time::sleep(NETWORK_MONITOR_INTERVAL) => {}
                }
            }
            debug!("network monitor loop stopped");
        });

        info!(workers = self.inner.workers.len(), "download center started");
        Ok(())
    }

    /// Stops the loops and aborts all in-flight transfers.
    ///
    /// Interrupted tasks keep their on-disk chunk progress and return to
    /// the queue on the next start.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for entry in &self.inner.task_worker {
            if let Some(worker) = self.inner.workers.get(entry.value().worker) {
                worker.cancel_task(entry.key());
            }
        }
        info!("download center shut down");
    }

    /// Submits a download request. Returns the task id.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] for unparseable URLs and
    /// persistence errors from the initial save.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn add_task(&self, request: DownloadRequest) -> Result<String, CenterError> {
        if Url::parse(&request.url).is_err() {
            return Err(DownloadError::invalid_url(&request.url).into());
        }

        let priority = self.inner.priority.calculate(&request);
        let task = DownloadTask::from_request(&request, priority);
        let task_id = task.id.clone();

        self.inner.store.save_task(&task).await?;
        let view = task.clone();
        self.inner.lock_queue().enqueue(task);
        self.inner.notifier.on_task_added(&view).await;

        Ok(task_id)
    }

    /// Pauses a task. Downloading tasks abort their in-flight requests;
    /// progressed chunks stay on disk for resume.
    ///
    /// # Errors
    ///
    /// Returns [`CenterError::TaskNotFound`] or [`CenterError::InvalidState`]
    /// for terminal tasks.
    #[instrument(skip(self))]
    pub async fn pause_task(&self, task_id: &str) -> Result<(), CenterError> {
        let handle = self.handle(task_id)?;
        let status = snapshot(&handle).status;
        if status.is_terminal() {
            return Err(CenterError::InvalidState {
                id: task_id.to_string(),
                expected: "pausable",
                actual: status,
            });
        }

        // Must flip the status before aborting the worker so the completion
        // handler can tell a pause from a cancellation.
        with_task_mut(&handle, |t| {
            t.status = DownloadStatus::Paused;
            t.touch();
        });

        if status == DownloadStatus::Downloading {
            self.cancel_in_worker(task_id);
        } else {
            self.inner.lock_queue().unqueue(task_id);
        }

        self.inner
            .store
            .update_task_status(task_id, DownloadStatus::Paused)
            .await?;
        self.notify_updated(&handle).await;
        Ok(())
    }

    /// Returns a paused (or failed) task to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns [`CenterError::InvalidState`] for completed or cancelled
    /// tasks, which are not resumable.
    #[instrument(skip(self))]
    pub async fn resume_task(&self, task_id: &str) -> Result<(), CenterError> {
        let handle = self.handle(task_id)?;
        let status = snapshot(&handle).status;
        if matches!(
            status,
            DownloadStatus::Completed | DownloadStatus::Cancelled
        ) {
            return Err(CenterError::InvalidState {
                id: task_id.to_string(),
                expected: "resumable",
                actual: status,
            });
        }
        if status == DownloadStatus::Downloading || status == DownloadStatus::Pending {
            return Ok(());
        }

        with_task_mut(&handle, |t| {
            t.status = DownloadStatus::Pending;
            t.touch();
        });
        self.inner.lock_queue().requeue(task_id);

        self.inner
            .store
            .update_task_status(task_id, DownloadStatus::Pending)
            .await?;
        self.notify_updated(&handle).await;
        Ok(())
    }

    /// Cancels a task, aborting in-flight requests.
    ///
    /// No merge is attempted; completed chunk files stay on disk until the
    /// next temp sweep, so an identical re-submission could resume them.
    ///
    /// # Errors
    ///
    /// Returns [`CenterError::TaskNotFound`] for unknown ids.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), CenterError> {
        let handle = self.handle(task_id)?;
        let status = snapshot(&handle).status;
        if status.is_terminal() {
            return Ok(());
        }

        with_task_mut(&handle, |t| {
            t.status = DownloadStatus::Cancelled;
            t.touch();
        });

        if status == DownloadStatus::Downloading {
            self.cancel_in_worker(task_id);
        } else {
            self.inner.lock_queue().unqueue(task_id);
        }

        self.inner
            .store
            .update_task_status(task_id, DownloadStatus::Cancelled)
            .await?;
        self.notify_updated(&handle).await;
        Ok(())
    }

    /// Re-queues a failed task from scratch: error cleared, progress and
    /// chunk layout discarded, temp artifacts removed.
    ///
    /// This is the only path that revives a failed task - the scheduler
    /// itself never re-queues failures.
    ///
    /// # Errors
    ///
    /// Returns [`CenterError::InvalidState`] when the task has not failed.
    #[instrument(skip(self))]
    pub async fn retry_task(&self, task_id: &str) -> Result<(), CenterError> {
        let handle = self.handle(task_id)?;
        let view = snapshot(&handle);
        if view.status != DownloadStatus::Failed {
            return Err(CenterError::InvalidState {
                id: task_id.to_string(),
                expected: "failed",
                actual: view.status,
            });
        }

        self.inner.chunk_manager.cleanup_chunks(&view.chunks).await;
        self.inner.chunk_manager.cleanup_task_temp_dir(task_id).await;

        with_task_mut(&handle, |t| {
            t.status = DownloadStatus::Pending;
            t.error = None;
            t.chunks.clear();
            t.progress = DownloadProgress {
                total_size: t.progress.total_size,
                ..DownloadProgress::default()
            };
            t.touch();
        });

        let view = snapshot(&handle);
        self.inner.store.save_task(&view).await?;
        self.inner.store.save_chunks(task_id, &[]).await?;
        self.inner.lock_queue().requeue(task_id);
        self.notify_updated(&handle).await;
        Ok(())
    }

    /// Pauses every pending or downloading task.
    pub async fn pause_all(&self) {
        for task in self.all_tasks() {
            if matches!(
                task.status,
                DownloadStatus::Pending | DownloadStatus::Downloading
            ) {
                if let Err(error) = self.pause_task(&task.id).await {
                    warn!(task_id = %task.id, %error, "failed to pause task");
                }
            }
        }
    }

    /// Resumes every paused task.
    pub async fn resume_all(&self) {
        for task in self.tasks_by_status(DownloadStatus::Paused) {
            if let Err(error) = self.resume_task(&task.id).await {
                warn!(task_id = %task.id, %error, "failed to resume task");
            }
        }
    }

    /// Cancels every non-terminal task.
    pub async fn cancel_all(&self) {
        for task in self.all_tasks() {
            if !task.status.is_terminal() {
                if let Err(error) = self.cancel_task(&task.id).await {
                    warn!(task_id = %task.id, %error, "failed to cancel task");
                }
            }
        }
    }

    /// Changes a task's priority, re-ordering the queue and applying the
    /// user-action delta semantics when `action` is given.
    ///
    /// # Errors
    ///
    /// Returns [`CenterError::TaskNotFound`] for unknown ids.
    #[instrument(skip(self))]
    pub async fn update_task_priority(
        &self,
        task_id: &str,
        priority: u8,
    ) -> Result<(), CenterError> {
        let updated = self.inner.lock_queue().update_priority(task_id, priority.clamp(1, 100));
        if !updated {
            return Err(CenterError::TaskNotFound(task_id.to_string()));
        }

        let handle = self.handle(task_id)?;
        self.inner.store.save_task(&snapshot(&handle)).await?;
        self.notify_updated(&handle).await;
        Ok(())
    }

    /// Applies a user action (pause press, manual start, ...) to a task's
    /// priority.
    ///
    /// # Errors
    ///
    /// Returns [`CenterError::TaskNotFound`] for unknown ids.
    pub async fn apply_user_action(
        &self,
        task_id: &str,
        action: UserAction,
    ) -> Result<(), CenterError> {
        let handle = self.handle(task_id)?;
        let current = snapshot(&handle).priority;
        let adjusted = PriorityCalculator::adjust_for_user_action(current, action);
        self.update_task_priority(task_id, adjusted).await
    }

    /// Drops a task from the center entirely: persistence rows, temp
    /// artifacts, and registry entry. The merged file (if any) stays.
    ///
    /// # Errors
    ///
    /// Returns [`CenterError::TaskNotFound`] for unknown ids.
    #[instrument(skip(self))]
    pub async fn remove_task(&self, task_id: &str) -> Result<(), CenterError> {
        let handle = self.handle(task_id)?;
        self.cancel_in_worker(task_id);

        let view = snapshot(&handle);
        self.inner.chunk_manager.cleanup_chunks(&view.chunks).await;
        self.inner.chunk_manager.cleanup_task_temp_dir(task_id).await;

        self.inner.lock_queue().remove(task_id);
        match self.inner.store.delete_task(task_id).await {
            Ok(()) | Err(StoreError::TaskNotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }
        self.notify_updated(&handle).await;
        Ok(())
    }

    /// Snapshot of one task.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<DownloadTask> {
        self.inner
            .lock_queue()
            .task(task_id)
            .map(|handle| snapshot(&handle))
    }

    /// Snapshots of every tracked task.
    #[must_use]
    pub fn all_tasks(&self) -> Vec<DownloadTask> {
        self.inner.lock_queue().all_tasks()
    }

    /// Snapshots filtered by status.
    #[must_use]
    pub fn tasks_by_status(&self, status: DownloadStatus) -> Vec<DownloadTask> {
        self.inner.lock_queue().tasks_by_status(status)
    }

    /// Aggregate queue counts.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.lock_queue().stats()
    }

    /// Recent history records, newest first.
    ///
    /// # Errors
    ///
    /// Returns persistence errors.
    pub async fn history(&self, limit: Option<u32>) -> Result<Vec<DownloadHistory>, CenterError> {
        Ok(self
            .inner
            .store
            .get_history(limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
            .await?)
    }

    /// Removes all history records.
    ///
    /// # Errors
    ///
    /// Returns persistence errors.
    pub async fn clear_history(&self) -> Result<u64, CenterError> {
        Ok(self.inner.store.clear_history().await?)
    }

    /// Prunes history past the configured retention window.
    ///
    /// # Errors
    ///
    /// Returns persistence errors.
    pub async fn cleanup_expired_history(&self) -> Result<u64, CenterError> {
        Ok(self
            .inner
            .store
            .cleanup_expired_data(self.inner.config.storage.history_retention_days)
            .await?)
    }

    /// Sweeps temp entries that belong to no active task.
    ///
    /// Active means pending, downloading, or paused; anything else under
    /// the temp root is an orphan and is removed.
    #[instrument(skip(self))]
    pub async fn cleanup_temp_files(&self) -> SweepStats {
        let active: std::collections::HashSet<String> = {
            let queue = self.inner.lock_queue();
            queue
                .all_tasks()
                .into_iter()
                .filter(|t| {
                    matches!(
                        t.status,
                        DownloadStatus::Pending
                            | DownloadStatus::Downloading
                            | DownloadStatus::Paused
                    )
                })
                .map(|t| t.id)
                .collect()
        };

        let mut stats = SweepStats::default();
        let temp_dir = &self.inner.config.storage.temp_dir;
        let Ok(mut entries) = fs::read_dir(temp_dir).await else {
            return stats;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);

            if is_dir {
                if active.contains(&name) {
                    continue;
                }
                stats.freed_bytes += dir_size(path.clone()).await;
                if fs::remove_dir_all(&path).await.is_ok() {
                    stats.removed += 1;
                    debug!(path = %path.display(), "removed orphaned temp directory");
                }
            } else {
                // Stray top-level files under the temp root are always orphans.
                if let Ok(meta) = entry.metadata().await {
                    stats.freed_bytes += meta.len();
                }
                if fs::remove_file(&path).await.is_ok() {
                    stats.removed += 1;
                }
            }
        }

        stats
    }

    /// Latest network observation.
    #[must_use]
    pub fn network_status(&self) -> NetworkStatus {
        self.inner.monitor.current_status()
    }

    /// Latest network quality tier.
    #[must_use]
    pub fn network_quality(&self) -> NetworkQuality {
        self.inner.monitor.network_quality()
    }

    /// The configuration this center runs with.
    #[must_use]
    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    /// Loads persisted active tasks back into the queue.
    ///
    /// Tasks left `downloading` by a crash return to `pending`; their chunk
    /// layouts ride along so the worker can resume from disk.
    async fn restore_persisted_tasks(&self) -> Result<(), CenterError> {
        let tasks = self.inner.store.get_active_tasks().await?;
        let count = tasks.len();

        for mut task in tasks {
            match task.status {
                DownloadStatus::Downloading => {
                    task.status = DownloadStatus::Pending;
                    self.inner
                        .store
                        .update_task_status(&task.id, DownloadStatus::Pending)
                        .await?;
                    self.inner.lock_queue().enqueue(task);
                }
                DownloadStatus::Pending => {
                    self.inner.lock_queue().enqueue(task);
                }
                // Paused tasks are visible but not schedulable.
                _ => {
                    self.inner.lock_queue().track(task);
                }
            }
        }

        if count > 0 {
            info!(count, "restored persisted tasks");
        }
        Ok(())
    }

    fn handle(&self, task_id: &str) -> Result<SharedTask, CenterError> {
        self.inner
            .lock_queue()
            .task(task_id)
            .ok_or_else(|| CenterError::TaskNotFound(task_id.to_string()))
    }

    fn cancel_in_worker(&self, task_id: &str) {
        if let Some(entry) = self.inner.task_worker.get(task_id) {
            if let Some(worker) = self.inner.workers.get(entry.value().worker) {
                worker.cancel_task(task_id);
            }
        }
    }

    async fn notify_updated(&self, handle: &SharedTask) {
        self.inner.notifier.on_task_updated(&snapshot(handle)).await;
    }
}

/// One scheduler tick: assign pending tasks to free workers, highest
/// priority first.
async fn schedule_pending(inner: &Arc<CenterInner>) {
    loop {
        if inner.task_worker.len() >= inner.config.concurrency.max_concurrent {
            break;
        }

        let Some(worker_index) = pick_worker(inner) else {
            break;
        };

        let Some(handle) = inner.lock_queue().dequeue() else {
            break;
        };
        let view = snapshot(&handle);
        if view.status != DownloadStatus::Pending {
            // Stale heap entry (task was paused/cancelled while queued).
            continue;
        }

        let run = inner
            .run_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let assignment = TaskAssignment {
            worker: worker_index,
            run,
        };
        inner.task_worker.insert(view.id.clone(), assignment);
        with_task_mut(&handle, |t| {
            t.status = DownloadStatus::Downloading;
            t.touch();
        });

        if let Err(error) = inner
            .store
            .update_task_status(&view.id, DownloadStatus::Downloading)
            .await
        {
            warn!(task_id = %view.id, %error, "failed to persist downloading status");
        }
        inner.notifier.on_task_updated(&snapshot(&handle)).await;

        let runner = Arc::clone(inner);
        tokio::spawn(async move {
            execute_task(runner, assignment, handle).await;
        });
    }
}

/// Least-loaded worker that can still accept a task.
fn pick_worker(inner: &Arc<CenterInner>) -> Option<usize> {
    inner
        .workers
        .iter()
        .enumerate()
        .filter(|(_, worker)| worker.can_accept_task())
        .min_by_key(|(_, worker)| worker.active_task_count())
        .map(|(index, _)| index)
}

/// Runs one task through the worker with task-level retries, then persists
/// and broadcasts the outcome.
async fn execute_task(inner: Arc<CenterInner>, assignment: TaskAssignment, handle: SharedTask) {
    let task_id = snapshot(&handle).id;
    let Some(worker) = inner.workers.get(assignment.worker).cloned() else {
        inner
            .task_worker
            .remove_if(&task_id, |_, current| *current == assignment);
        return;
    };

    let sink = make_progress_sink(&inner);
    let result = {
        let worker = Arc::clone(&worker);
        let handle = SharedTask::clone(&handle);
        let retry_inner = Arc::clone(&inner);
        let retry_task_id = task_id.clone();
        inner
            .task_retry
            .execute_with_retry(
                move || {
                    let worker = Arc::clone(&worker);
                    let handle = SharedTask::clone(&handle);
                    let sink = Arc::clone(&sink);
                    async move { worker.run_task(handle, sink).await }
                },
                move |attempt, error, delay| {
                    let notifier = Arc::clone(&retry_inner.notifier);
                    let task_id = retry_task_id.clone();
                    let message = error.to_string();
                    tokio::spawn(async move {
                        notifier
                            .on_task_retrying(&task_id, attempt, &message, delay)
                            .await;
                    });
                },
            )
            .await
    };

    match result {
        Ok(()) => {
            let now = unix_millis();
            with_task_mut(&handle, |t| {
                t.status = DownloadStatus::Completed;
                t.completed_at = Some(now);
                t.touch();
            });
            let view = snapshot(&handle);

            persist_outcome(&inner, &view).await;
            if !view.hidden {
                if let Err(error) = inner.store.save_to_history(&history_record(&view)).await {
                    warn!(task_id = %view.id, %error, "failed to record history");
                }
            }
            inner.notifier.on_task_completed(&view).await;
        }
        Err(error) if error.is_cancelled() => {
            // Pause or cancel already set the terminal status and notified;
            // just persist the chunk states so resume survives a restart.
            let view = snapshot(&handle);
            if let Err(persist_error) = inner.store.save_chunks(&view.id, &view.chunks).await {
                warn!(task_id = %view.id, %persist_error, "failed to persist chunk state");
            }
        }
        Err(download_error) => {
            with_task_mut(&handle, |t| {
                t.status = DownloadStatus::Failed;
                t.failure_count += 1;
                t.error = Some(download_error.to_string());
                t.touch();
            });
            let view = snapshot(&handle);

            if let Err(error) = inner
                .store
                .update_task_status(&view.id, DownloadStatus::Failed)
                .await
            {
                warn!(task_id = %view.id, %error, "failed to persist failed status");
            }
            if let Err(error) = inner
                .store
                .update_task_error(
                    &view.id,
                    view.error.as_deref().unwrap_or("download failed"),
                    view.failure_count,
                )
                .await
            {
                warn!(task_id = %view.id, %error, "failed to persist error");
            }
            if let Err(error) = inner.store.save_chunks(&view.id, &view.chunks).await {
                warn!(task_id = %view.id, %error, "failed to persist chunk state");
            }

            error!(task_id = %view.id, kind = %download_error.kind(), %download_error, "task failed");
            inner.notifier.on_task_failed(&view).await;
        }
    }

    // Only this run's own assignment may be removed: a pause/resume cycle
    // can already have re-scheduled the task onto another run.
    inner
        .task_worker
        .remove_if(&task_id, |_, current| *current == assignment);
}

/// Persists the terminal state of a completed task.
async fn persist_outcome(inner: &Arc<CenterInner>, view: &DownloadTask) {
    if let Err(error) = inner
        .store
        .update_task_status(&view.id, DownloadStatus::Completed)
        .await
    {
        warn!(task_id = %view.id, %error, "failed to persist completed status");
    }
    if let Err(error) = inner
        .store
        .update_progress(
            &view.id,
            view.progress.downloaded_size,
            view.progress.total_size,
        )
        .await
    {
        warn!(task_id = %view.id, %error, "failed to persist final progress");
    }
    // Chunk rows are spent once the merge consumed their files.
    if let Err(error) = inner.store.save_chunks(&view.id, &[]).await {
        warn!(task_id = %view.id, %error, "failed to clear chunk rows");
    }
}

/// Builds the history record for a finished task.
fn history_record(view: &DownloadTask) -> DownloadHistory {
    let completed_at = view.completed_at.unwrap_or_else(unix_millis);
    let duration_secs = completed_at.saturating_sub(view.created_at) / 1000;
    let average_speed = if duration_secs > 0 {
        Some(view.progress.downloaded_size / duration_secs)
    } else {
        None
    };

    DownloadHistory {
        id: format!("{}_history_{completed_at}", view.id),
        task_id: view.id.clone(),
        url: view.url.clone(),
        filename: view.filename.clone(),
        module: view.module,
        status: view.status,
        total_size: view.progress.total_size,
        downloaded_size: view.progress.downloaded_size,
        duration_secs,
        average_speed,
        created_at: view.created_at,
        completed_at,
    }
}

/// Builds the sink the worker reports throttled progress through:
/// persistence plus the outward notification, both off the hot path.
fn make_progress_sink(inner: &Arc<CenterInner>) -> ProgressSink {
    let inner = Arc::clone(inner);
    Arc::new(move |task_id: &str, progress: &DownloadProgress| {
        let inner = Arc::clone(&inner);
        let task_id = task_id.to_string();
        let progress = progress.clone();
        tokio::spawn(async move {
            if let Err(error) = inner
                .store
                .update_progress(&task_id, progress.downloaded_size, progress.total_size)
                .await
            {
                debug!(task_id, %error, "failed to persist progress");
            }
            inner.notifier.on_task_progress(&task_id, &progress).await;
        });
    })
}

/// Recursive directory size, best effort.
async fn dir_size(path: PathBuf) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![path];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
    }
    total
}
