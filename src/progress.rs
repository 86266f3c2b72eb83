//! Per-task speed/ETA tracking with throttled outward callbacks.
//!
//! [`ProgressTracker`] keeps a sliding window of `(instant, bytes)` samples
//! and derives a smoothed transfer rate from the window's endpoints. Outward
//! callbacks are throttled to one per configured interval so a hot download
//! loop cannot flood observers; milestone events bypass the throttle via
//! [`ProgressTracker::force_update`].
//!
//! Samples normally use the wall clock; tests feed explicit instants
//! through [`ProgressTracker::record_at`] for deterministic assertions.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::task::DownloadProgress;

/// Default number of samples in the sliding window.
const DEFAULT_WINDOW_SIZE: usize = 10;

/// Minimum samples before a speed is reported.
const MIN_SPEED_SAMPLES: usize = 2;

/// Default throttle interval for outward callbacks.
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Callback invoked with throttled progress snapshots.
pub type ProgressCallback = Box<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Moving-average speed and ETA computation for one task.
pub struct ProgressTracker {
    task_id: String,
    window: VecDeque<(Instant, u64)>,
    window_size: usize,
    update_interval: Duration,
    last_emit: Option<Instant>,
    current: DownloadProgress,
    callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("task_id", &self.task_id)
            .field("samples", &self.window.len())
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// Creates a tracker with the default window (10 samples) and throttle
    /// interval (1 second).
    #[must_use]
    pub fn new(task_id: impl Into<String>) -> Self {
        Self::with_settings(task_id, DEFAULT_WINDOW_SIZE, DEFAULT_UPDATE_INTERVAL)
    }

    /// Creates a tracker with explicit window size and throttle interval.
    #[must_use]
    pub fn with_settings(
        task_id: impl Into<String>,
        window_size: usize,
        update_interval: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            window: VecDeque::with_capacity(window_size.max(MIN_SPEED_SAMPLES)),
            window_size: window_size.max(MIN_SPEED_SAMPLES),
            update_interval,
            last_emit: None,
            current: DownloadProgress::default(),
            callback: None,
        }
    }

    /// Registers the throttled callback.
    pub fn set_callback(&mut self, callback: ProgressCallback) {
        self.callback = Some(callback);
    }

    /// Returns the id of the task this tracker belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Records a sample at the current wall clock.
    ///
    /// Returns true when the throttle allowed a callback to fire.
    pub fn record(&mut self, downloaded: u64, total: Option<u64>) -> bool {
        self.record_at(Instant::now(), downloaded, total)
    }

    /// Records a sample with an explicit instant (deterministic tests).
    pub fn record_at(&mut self, now: Instant, downloaded: u64, total: Option<u64>) -> bool {
        self.window.push_back((now, downloaded));
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let speed = self.window_speed();
        self.current = DownloadProgress {
            total_size: total,
            downloaded_size: downloaded,
            speed,
            percentage: DownloadProgress::percentage_of(downloaded, total),
            remaining_time_secs: remaining_time(downloaded, total, speed),
        };

        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.update_interval);
        if due {
            self.last_emit = Some(now);
            if let Some(callback) = &self.callback {
                callback(&self.current);
            }
        }
        due
    }

    /// Returns the latest progress snapshot.
    #[must_use]
    pub fn progress(&self) -> DownloadProgress {
        self.current.clone()
    }

    /// Returns the current smoothed speed in bytes per second.
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.current.speed
    }

    /// Fires the callback immediately, bypassing the throttle.
    ///
    /// Used for milestone events (chunk completion, task completion) that
    /// must reach observers even inside a throttle window.
    pub fn force_update(&mut self) {
        if let Some(callback) = &self.callback {
            callback(&self.current);
        }
        self.last_emit = Some(Instant::now());
    }

    /// Clears all samples and the current snapshot.
    pub fn reset(&mut self) {
        self.window.clear();
        self.last_emit = None;
        self.current = DownloadProgress::default();
    }

    /// Speed across the window endpoints; zero until enough samples exist,
    /// never negative.
    fn window_speed(&self) -> f64 {
        if self.window.len() < MIN_SPEED_SAMPLES {
            return 0.0;
        }
        let Some(&(first_time, first_bytes)) = self.window.front() else {
            return 0.0;
        };
        let Some(&(last_time, last_bytes)) = self.window.back() else {
            return 0.0;
        };

        let elapsed = last_time.duration_since(first_time).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let delta = last_bytes as f64 - first_bytes as f64;
        (delta / elapsed).max(0.0)
    }
}

/// Seconds remaining at the given rate, when computable.
fn remaining_time(downloaded: u64, total: Option<u64>, speed: f64) -> Option<u64> {
    let total = total?;
    if speed <= 0.0 || downloaded >= total {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let remaining = (total - downloaded) as f64 / speed;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(remaining.ceil() as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn base() -> Instant {
        Instant::now()
    }

    // ==================== Speed Tests ====================

    #[test]
    fn test_speed_requires_two_samples() {
        let mut tracker = ProgressTracker::new("t");
        tracker.record_at(base(), 1000, Some(10_000));
        assert!((tracker.speed() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_speed_from_window_endpoints() {
        let start = base();
        let mut tracker = ProgressTracker::new("t");
        tracker.record_at(start, 0, Some(10_000));
        tracker.record_at(start + Duration::from_secs(2), 4000, Some(10_000));
        // 4000 bytes over 2 seconds
        assert!((tracker.speed() - 2000.0).abs() < 1.0);
    }

    #[test]
    fn test_speed_never_negative() {
        let start = base();
        let mut tracker = ProgressTracker::new("t");
        tracker.record_at(start, 5000, Some(10_000));
        tracker.record_at(start + Duration::from_secs(1), 4000, Some(10_000));
        assert!((tracker.speed() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_slides() {
        let start = base();
        let mut tracker = ProgressTracker::with_settings("t", 3, Duration::from_secs(1));
        for i in 0..10u64 {
            tracker.record_at(start + Duration::from_secs(i), i * 100, Some(10_000));
        }
        // window covers samples 7..=9: 200 bytes over 2 seconds
        assert!((tracker.speed() - 100.0).abs() < 1.0);
    }

    // ==================== Monotonicity Tests ====================

    #[test]
    fn test_percentage_never_decreases_for_increasing_samples() {
        let start = base();
        let mut tracker = ProgressTracker::new("t");
        let mut last_pct = 0u8;
        for i in 0..50u64 {
            tracker.record_at(start + Duration::from_secs(i), i * 200, Some(10_000));
            let progress = tracker.progress();
            assert!(progress.speed >= 0.0);
            assert!(
                progress.percentage >= last_pct,
                "percentage decreased at sample {i}"
            );
            last_pct = progress.percentage;
        }
    }

    // ==================== Remaining Time Tests ====================

    #[test]
    fn test_remaining_time_computation() {
        let start = base();
        let mut tracker = ProgressTracker::new("t");
        tracker.record_at(start, 0, Some(10_000));
        tracker.record_at(start + Duration::from_secs(1), 1000, Some(10_000));
        // 9000 bytes remain at 1000 B/s
        assert_eq!(tracker.progress().remaining_time_secs, Some(9));
    }

    #[test]
    fn test_remaining_time_undefined_without_size_or_speed() {
        let start = base();
        let mut tracker = ProgressTracker::new("t");
        tracker.record_at(start, 0, None);
        tracker.record_at(start + Duration::from_secs(1), 1000, None);
        assert_eq!(tracker.progress().remaining_time_secs, None);

        let mut stalled = ProgressTracker::new("t2");
        stalled.record_at(start, 500, Some(1000));
        stalled.record_at(start + Duration::from_secs(1), 500, Some(1000));
        assert_eq!(stalled.progress().remaining_time_secs, None);
    }

    // ==================== Throttle Tests ====================

    #[test]
    fn test_callbacks_are_throttled() {
        let start = base();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let mut tracker = ProgressTracker::with_settings("t", 10, Duration::from_secs(1));
        tracker.set_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // 5 samples within 400ms: only the first passes the throttle
        for i in 0..5u64 {
            tracker.record_at(start + Duration::from_millis(i * 100), i * 10, Some(1000));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // past the interval, the next sample emits again
        assert!(tracker.record_at(start + Duration::from_millis(1500), 100, Some(1000)));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_force_update_bypasses_throttle() {
        let start = base();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let mut tracker = ProgressTracker::with_settings("t", 10, Duration::from_secs(60));
        tracker.set_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tracker.record_at(start, 10, Some(1000));
        tracker.record_at(start + Duration::from_millis(10), 20, Some(1000));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tracker.force_update();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_clears_state() {
        let start = base();
        let mut tracker = ProgressTracker::new("t");
        tracker.record_at(start, 500, Some(1000));
        tracker.record_at(start + Duration::from_secs(1), 600, Some(1000));
        assert!(tracker.progress().downloaded_size > 0);

        tracker.reset();
        let progress = tracker.progress();
        assert_eq!(progress.downloaded_size, 0);
        assert!((progress.speed - 0.0).abs() < f64::EPSILON);
        assert_eq!(progress.percentage, 0);
    }
}
