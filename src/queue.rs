//! Priority-ordered task queue and in-memory task registry.
//!
//! [`TaskQueue`] keeps every tracked task (any status) in a registry of
//! shared handles, and the *pending* subset in a binary max-heap keyed by
//! `(priority desc, insertion sequence asc)`. Equal priorities therefore
//! dequeue in FIFO order, so old tasks are not starved by newer ones at the
//! same level.
//!
//! An id -> heap-position index map keeps `update_priority` and `remove` at
//! O(log n) instead of an O(n) scan followed by a re-heapify.
//!
//! The queue is a plain data structure with no interior locking: it is
//! mutated only by the orchestrator, which owns it behind a mutex.

use std::collections::HashMap;

use crate::task::{
    DownloadStatus, DownloadTask, QueueStats, SharedTask, shared, snapshot, with_task_mut,
};

/// Heap entry: the ordering key plus the id it belongs to.
#[derive(Debug, Clone)]
struct HeapNode {
    priority: u8,
    seq: u64,
    task_id: String,
}

impl HeapNode {
    /// Max-heap ordering: higher priority first, earlier insertion wins ties.
    fn precedes(&self, other: &Self) -> bool {
        self.priority > other.priority
            || (self.priority == other.priority && self.seq < other.seq)
    }
}

/// Priority queue over download tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    registry: HashMap<String, SharedTask>,
    heap: Vec<HeapNode>,
    positions: HashMap<String, usize>,
    next_seq: u64,
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task, returning its shared handle.
    ///
    /// A task with the same id already in the queue is removed first, so
    /// enqueueing is idempotent per id.
    pub fn enqueue(&mut self, task: DownloadTask) -> SharedTask {
        if self.registry.contains_key(&task.id) {
            self.remove(&task.id);
        }

        let id = task.id.clone();
        let handle = shared(task);
        self.registry.insert(id.clone(), SharedTask::clone(&handle));
        self.push_heap_entry(&id);
        handle
    }

    /// Registers a task without queueing it (paused/terminal tasks being
    /// restored at startup). A task with the same id is replaced.
    pub fn track(&mut self, task: DownloadTask) -> SharedTask {
        if self.registry.contains_key(&task.id) {
            self.remove(&task.id);
        }
        let id = task.id.clone();
        let handle = shared(task);
        self.registry.insert(id, SharedTask::clone(&handle));
        handle
    }

    /// Pushes an already-registered task back into the pending heap.
    ///
    /// Used when a paused or retried task returns to `pending`. No-op if the
    /// id is unknown or already queued.
    pub fn requeue(&mut self, task_id: &str) {
        if self.registry.contains_key(task_id) && !self.positions.contains_key(task_id) {
            self.push_heap_entry(task_id);
        }
    }

    /// Removes a task from the pending heap but keeps it in the registry.
    ///
    /// Used when a queued task is paused or cancelled: it stops being
    /// schedulable but remains visible for status queries.
    pub fn unqueue(&mut self, task_id: &str) {
        if let Some(index) = self.positions.remove(task_id) {
            let last = self.heap.len() - 1;
            self.heap.swap(index, last);
            self.heap.pop();
            if index < self.heap.len() {
                self.positions
                    .insert(self.heap[index].task_id.clone(), index);
                let index = self.sift_up(index);
                self.sift_down(index);
            }
        }
    }

    /// Removes and returns the highest-priority pending task.
    ///
    /// The task stays in the registry; the caller owns its status
    /// transition. Returns `None` when no pending tasks remain.
    pub fn dequeue(&mut self) -> Option<SharedTask> {
        if self.heap.is_empty() {
            return None;
        }

        let root = self.heap.swap_remove(0);
        self.positions.remove(&root.task_id);
        if let Some(moved) = self.heap.first() {
            self.positions.insert(moved.task_id.clone(), 0);
            self.sift_down(0);
        }

        self.registry.get(&root.task_id).cloned()
    }

    /// Changes a task's priority, re-heapifying if it is pending.
    ///
    /// Returns false when the id is unknown.
    pub fn update_priority(&mut self, task_id: &str, priority: u8) -> bool {
        let Some(handle) = self.registry.get(task_id) else {
            return false;
        };
        with_task_mut(handle, |task| {
            task.priority = priority;
            task.touch();
        });

        if let Some(&index) = self.positions.get(task_id) {
            self.heap[index].priority = priority;
            let index = self.sift_up(index);
            self.sift_down(index);
        }
        true
    }

    /// Removes a task from both the heap and the registry.
    pub fn remove(&mut self, task_id: &str) -> Option<SharedTask> {
        self.unqueue(task_id);
        self.registry.remove(task_id)
    }

    /// Returns the shared handle for a task, any status.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<SharedTask> {
        self.registry.get(task_id).cloned()
    }

    /// Returns a snapshot of every tracked task.
    #[must_use]
    pub fn all_tasks(&self) -> Vec<DownloadTask> {
        self.registry.values().map(snapshot).collect()
    }

    /// Returns snapshots of tasks in the given status.
    #[must_use]
    pub fn tasks_by_status(&self, status: DownloadStatus) -> Vec<DownloadTask> {
        self.registry
            .values()
            .map(snapshot)
            .filter(|task| task.status == status)
            .collect()
    }

    /// Returns snapshots of pending tasks, highest priority first.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks = self.tasks_by_status(DownloadStatus::Pending);
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
        tasks
    }

    /// Returns snapshots of tasks whose priority falls in `min..=max`.
    #[must_use]
    pub fn tasks_in_priority_band(&self, min: u8, max: u8) -> Vec<DownloadTask> {
        self.registry
            .values()
            .map(snapshot)
            .filter(|task| task.priority >= min && task.priority <= max)
            .collect()
    }

    /// Returns aggregate counts over the registry.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.registry.len(),
            ..QueueStats::default()
        };
        for handle in self.registry.values() {
            match snapshot(handle).status {
                DownloadStatus::Pending => stats.pending += 1,
                DownloadStatus::Downloading => stats.active += 1,
                DownloadStatus::Completed => stats.completed += 1,
                DownloadStatus::Failed => stats.failed += 1,
                DownloadStatus::Paused | DownloadStatus::Cancelled => {}
            }
        }
        stats
    }

    /// Number of pending (heap) entries.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.heap.len()
    }

    /// True when no pending tasks remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Priority of the next task `dequeue` would return.
    #[must_use]
    pub fn peek_priority(&self) -> Option<u8> {
        self.heap.first().map(|node| node.priority)
    }

    fn push_heap_entry(&mut self, task_id: &str) {
        let Some(handle) = self.registry.get(task_id) else {
            return;
        };
        let priority = snapshot(handle).priority;
        let node = HeapNode {
            priority,
            seq: self.next_seq,
            task_id: task_id.to_string(),
        };
        self.next_seq += 1;

        self.heap.push(node);
        let index = self.heap.len() - 1;
        self.positions.insert(task_id.to_string(), index);
        self.sift_up(index);
    }

    /// Moves the node at `index` up until its parent precedes it.
    /// Returns the final index.
    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].precedes(&self.heap[parent]) {
                self.swap_nodes(index, parent);
                index = parent;
            } else {
                break;
            }
        }
        index
    }

    /// Moves the node at `index` down until both children follow it.
    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut first = index;

            if left < self.heap.len() && self.heap[left].precedes(&self.heap[first]) {
                first = left;
            }
            if right < self.heap.len() && self.heap[right].precedes(&self.heap[first]) {
                first = right;
            }
            if first == index {
                break;
            }
            self.swap_nodes(index, first);
            index = first;
        }
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].task_id.clone(), a);
        self.positions.insert(self.heap[b].task_id.clone(), b);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::task::DownloadRequest;

    fn make_task(id: &str, priority: u8) -> DownloadTask {
        let mut request = DownloadRequest::new("https://example.com/f.bin", "/downloads");
        request.id = Some(id.to_string());
        DownloadTask::from_request(&request, priority)
    }

    fn dequeue_id(queue: &mut TaskQueue) -> String {
        let handle = queue.dequeue().unwrap();
        snapshot(&handle).id
    }

    // ==================== Ordering Tests ====================

    #[test]
    fn test_dequeue_returns_highest_priority() {
        let mut queue = TaskQueue::new();
        queue.enqueue(make_task("low", 10));
        queue.enqueue(make_task("high", 90));
        queue.enqueue(make_task("mid", 50));

        assert_eq!(dequeue_id(&mut queue), "high");
        assert_eq!(dequeue_id(&mut queue), "mid");
        assert_eq!(dequeue_id(&mut queue), "low");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_equal_priorities_dequeue_fifo() {
        let mut queue = TaskQueue::new();
        for id in ["first", "second", "third"] {
            queue.enqueue(make_task(id, 50));
        }
        assert_eq!(dequeue_id(&mut queue), "first");
        assert_eq!(dequeue_id(&mut queue), "second");
        assert_eq!(dequeue_id(&mut queue), "third");
    }

    #[test]
    fn test_heap_property_over_many_operations() {
        // Deterministic pseudo-random priorities via a simple LCG.
        let mut state: u64 = 42;
        let mut next = move || {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            u8::try_from((state >> 33) % 100).unwrap() + 1
        };

        let mut queue = TaskQueue::new();
        for i in 0..200 {
            queue.enqueue(make_task(&format!("task-{i}"), next()));
        }

        let mut last = u8::MAX;
        while let Some(handle) = queue.dequeue() {
            let priority = snapshot(&handle).priority;
            assert!(
                priority <= last,
                "dequeue order violated: {priority} after {last}"
            );
            last = priority;
        }
    }

    // ==================== Mutation Tests ====================

    #[test]
    fn test_enqueue_duplicate_id_replaces_prior() {
        let mut queue = TaskQueue::new();
        queue.enqueue(make_task("dup", 10));
        queue.enqueue(make_task("dup", 90));

        assert_eq!(queue.pending_len(), 1);
        let handle = queue.dequeue().unwrap();
        assert_eq!(snapshot(&handle).priority, 90);
    }

    #[test]
    fn test_update_priority_reorders_heap() {
        let mut queue = TaskQueue::new();
        queue.enqueue(make_task("a", 10));
        queue.enqueue(make_task("b", 20));
        queue.enqueue(make_task("c", 30));

        assert!(queue.update_priority("a", 99));
        assert_eq!(queue.peek_priority(), Some(99));
        assert_eq!(dequeue_id(&mut queue), "a");

        // sinking works too
        assert!(queue.update_priority("c", 1));
        assert_eq!(dequeue_id(&mut queue), "b");
        assert_eq!(dequeue_id(&mut queue), "c");
    }

    #[test]
    fn test_update_priority_unknown_id_returns_false() {
        let mut queue = TaskQueue::new();
        assert!(!queue.update_priority("ghost", 50));
    }

    #[test]
    fn test_remove_middle_keeps_heap_valid() {
        let mut queue = TaskQueue::new();
        for (id, priority) in [("a", 80), ("b", 60), ("c", 40), ("d", 20), ("e", 70)] {
            queue.enqueue(make_task(id, priority));
        }

        assert!(queue.remove("b").is_some());
        assert_eq!(dequeue_id(&mut queue), "a");
        assert_eq!(dequeue_id(&mut queue), "e");
        assert_eq!(dequeue_id(&mut queue), "c");
        assert_eq!(dequeue_id(&mut queue), "d");
    }

    #[test]
    fn test_remove_unknown_id_is_none() {
        let mut queue = TaskQueue::new();
        assert!(queue.remove("ghost").is_none());
    }

    #[test]
    fn test_dequeued_task_stays_in_registry() {
        let mut queue = TaskQueue::new();
        queue.enqueue(make_task("kept", 50));
        let handle = queue.dequeue().unwrap();
        with_task_mut(&handle, |task| task.status = DownloadStatus::Downloading);

        assert!(queue.task("kept").is_some());
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.tasks_by_status(DownloadStatus::Downloading).len(), 1);
    }

    #[test]
    fn test_requeue_returns_task_to_heap() {
        let mut queue = TaskQueue::new();
        queue.enqueue(make_task("again", 50));
        let handle = queue.dequeue().unwrap();
        assert!(queue.is_empty());

        with_task_mut(&handle, |task| task.status = DownloadStatus::Pending);
        queue.requeue("again");
        assert_eq!(queue.pending_len(), 1);

        // requeue is idempotent
        queue.requeue("again");
        assert_eq!(queue.pending_len(), 1);
    }

    // ==================== View Tests ====================

    #[test]
    fn test_views_and_stats() {
        let mut queue = TaskQueue::new();
        queue.enqueue(make_task("p1", 30));
        queue.enqueue(make_task("p2", 80));
        queue.enqueue(make_task("a1", 50));

        let top = queue.dequeue().unwrap();
        assert_eq!(snapshot(&top).id, "p2");
        with_task_mut(&top, |task| task.status = DownloadStatus::Downloading);

        let pending = queue.pending_tasks();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "a1"); // 50 > 30

        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.completed, 0);

        let band = queue.tasks_in_priority_band(40, 100);
        assert_eq!(band.len(), 2); // a1 (50) and p2 (80)
    }
}
