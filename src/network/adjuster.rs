//! Adaptive concurrency with hysteresis.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, instrument};

use super::monitor::{NetworkMonitor, NetworkStatus};
use crate::config::DownloadConfig;

/// Bounded history of applied concurrency values, for diagnostics.
const MAX_HISTORY_SIZE: usize = 10;

/// Pending tasks at or above this priority count as "high priority" when
/// computing priority pressure.
const HIGH_PRIORITY_THRESHOLD: u8 = 70;

#[derive(Debug)]
struct AdjusterState {
    current: usize,
    history: Vec<usize>,
}

/// Derives the effective simultaneous-download limit from network
/// observations and configuration toggles.
///
/// Three independent multipliers apply on top of the configured base:
/// a speed tier, a stability tier, and (when `priority_based` is on) a
/// pressure bump for queues dominated by high-priority work. The result is
/// rounded and clamped to `[1, max_concurrent]`.
///
/// A recommendation only takes effect when it differs from the current
/// value by more than 1 - hysteresis that keeps the limit from thrashing
/// when measurements hover around a band edge.
#[derive(Debug)]
pub struct ConcurrencyAdjuster {
    monitor: Arc<NetworkMonitor>,
    max_concurrent: usize,
    auto_adjust: bool,
    network_aware: bool,
    priority_based: bool,
    state: Mutex<AdjusterState>,
}

impl ConcurrencyAdjuster {
    /// Creates an adjuster seeded with the configured maximum.
    #[must_use]
    pub fn new(config: &DownloadConfig, monitor: Arc<NetworkMonitor>) -> Self {
        Self {
            monitor,
            max_concurrent: config.concurrency.max_concurrent.max(1),
            auto_adjust: config.concurrency.auto_adjust,
            network_aware: config.concurrency.network_aware,
            priority_based: config.concurrency.priority_based,
            state: Mutex::new(AdjusterState {
                current: config.concurrency.max_concurrent.max(1),
                history: Vec::new(),
            }),
        }
    }

    /// Returns the concurrency currently in effect.
    #[must_use]
    pub fn current(&self) -> usize {
        self.lock_state().current
    }

    /// Computes the recommended concurrency without applying it.
    ///
    /// `high_priority_pending` / `total_pending` feed the optional priority
    /// pressure multiplier; pass zeros when the queue is empty.
    #[must_use]
    pub fn recommended(&self, high_priority_pending: usize, total_pending: usize) -> usize {
        if !self.auto_adjust {
            return self.max_concurrent;
        }

        #[allow(clippy::cast_precision_loss)]
        let mut value = self.max_concurrent as f64;
        let status = self.monitor.current_status();

        if self.network_aware {
            value *= speed_multiplier(&status);
            value *= stability_multiplier(&status);
        }
        if self.priority_based && priority_pressure(high_priority_pending, total_pending) {
            value *= 1.2;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rounded = value.round().max(0.0) as usize;
        rounded.clamp(1, self.max_concurrent)
    }

    /// Applies the recommendation when it clears the hysteresis band.
    ///
    /// Returns the concurrency in effect afterwards.
    #[instrument(skip(self))]
    pub fn adjust(&self, high_priority_pending: usize, total_pending: usize) -> usize {
        let recommended = self.recommended(high_priority_pending, total_pending);
        let mut state = self.lock_state();

        let delta = recommended.abs_diff(state.current);
        if delta > 1 {
            debug!(
                from = state.current,
                to = recommended,
                "concurrency adjusted"
            );
            state.current = recommended;
            state.history.push(recommended);
            while state.history.len() > MAX_HISTORY_SIZE {
                state.history.remove(0);
            }
        }
        state.current
    }

    /// Returns the bounded history of applied values.
    #[must_use]
    pub fn history(&self) -> Vec<usize> {
        self.lock_state().history.clone()
    }

    /// Average of the applied history, or the current value when empty.
    #[must_use]
    pub fn average(&self) -> usize {
        let state = self.lock_state();
        if state.history.is_empty() {
            return state.current;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let avg =
            (state.history.iter().sum::<usize>() as f64 / state.history.len() as f64).round();
        avg as usize
    }

    /// Resets the effective value back to the configured maximum.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.current = self.max_concurrent;
    }

    /// The high-priority threshold used for priority pressure.
    #[must_use]
    pub fn high_priority_threshold() -> u8 {
        HIGH_PRIORITY_THRESHOLD
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AdjusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Speed tier multiplier. The slowest band is checked first so that it is
/// actually reachable below the 1 MiB/s band.
fn speed_multiplier(status: &NetworkStatus) -> f64 {
    const MIB: f64 = 1024.0 * 1024.0;
    if status.speed > 10.0 * MIB {
        1.5
    } else if status.speed > 5.0 * MIB {
        1.3
    } else if status.speed > 2.0 * MIB {
        1.1
    } else if status.speed < 512.0 * 1024.0 {
        0.5
    } else if status.speed < MIB {
        0.7
    } else {
        1.0
    }
}

/// Stability tier multiplier.
fn stability_multiplier(status: &NetworkStatus) -> f64 {
    if status.stability > 0.8 {
        1.2
    } else if status.stability > 0.6 {
        1.0
    } else if status.stability > 0.4 {
        0.8
    } else {
        0.6
    }
}

/// True when more than half of the pending queue is high-priority.
fn priority_pressure(high_priority_pending: usize, total_pending: usize) -> bool {
    total_pending > 0 && high_priority_pending * 2 > total_pending
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MIB: f64 = 1024.0 * 1024.0;

    fn config(max: usize) -> DownloadConfig {
        let mut config = DownloadConfig::default();
        config.concurrency.max_concurrent = max;
        config
    }

    fn monitor_with(speed: f64, latency: f64, samples: usize) -> Arc<NetworkMonitor> {
        let monitor = Arc::new(NetworkMonitor::with_probe_urls([]));
        for _ in 0..samples {
            monitor.record_sample(speed, latency);
        }
        monitor
    }

    // ==================== Recommendation Tests ====================

    #[test]
    fn test_auto_adjust_off_returns_max() {
        let mut cfg = config(6);
        cfg.concurrency.auto_adjust = false;
        let adjuster = ConcurrencyAdjuster::new(&cfg, monitor_with(0.1 * MIB, 900.0, 5));
        assert_eq!(adjuster.recommended(0, 0), 6);
    }

    #[test]
    fn test_fast_stable_network_keeps_max() {
        // 1.5 (speed) * 1.2 (stability) on a base of 4 clamps back to 4.
        let adjuster = ConcurrencyAdjuster::new(&config(4), monitor_with(11.0 * MIB, 30.0, 5));
        assert_eq!(adjuster.recommended(0, 0), 4);
    }

    #[test]
    fn test_slow_network_reduces_concurrency() {
        // steady 256 KiB/s: 0.5 speed tier, 1.2 stability tier
        let adjuster = ConcurrencyAdjuster::new(&config(8), monitor_with(0.25 * MIB, 100.0, 5));
        assert_eq!(adjuster.recommended(0, 0), 5); // 8 * 0.5 * 1.2 = 4.8 -> 5
    }

    #[test]
    fn test_priority_pressure_multiplier() {
        let mut cfg = config(4);
        cfg.concurrency.priority_based = true;
        cfg.concurrency.network_aware = false;
        let adjuster = ConcurrencyAdjuster::new(&cfg, monitor_with(MIB, 100.0, 5));

        // no pressure: half or less of the queue is high priority
        assert_eq!(adjuster.recommended(1, 2), 4);
        // pressure: clamped to max anyway
        assert_eq!(adjuster.recommended(2, 3), 4);

        let mut big = config(10);
        big.concurrency.priority_based = true;
        big.concurrency.network_aware = false;
        let adjuster = ConcurrencyAdjuster::new(&big, monitor_with(MIB, 100.0, 5));
        // 10 * 1.2 = 12 clamps to 10; without pressure stays 10
        assert_eq!(adjuster.recommended(3, 4), 10);
    }

    #[test]
    fn test_recommendation_never_leaves_bounds() {
        let adjuster = ConcurrencyAdjuster::new(&config(3), monitor_with(0.05 * MIB, 2000.0, 8));
        let recommended = adjuster.recommended(0, 0);
        assert!((1..=3).contains(&recommended));
    }

    // ==================== Hysteresis Tests ====================

    #[test]
    fn test_adjust_ignores_small_deltas() {
        // base 4, recommendation 5 (delta 1): no change
        let mut cfg = config(5);
        cfg.concurrency.network_aware = true;
        let adjuster = ConcurrencyAdjuster::new(&cfg, monitor_with(1.5 * MIB, 100.0, 5));
        // 5 * 1.0 (speed 1-2MiB band) * 1.2 (stable) = 6 -> clamp 5; current 5, delta 0
        assert_eq!(adjuster.adjust(0, 0), 5);
        assert!(adjuster.history().is_empty());
    }

    #[test]
    fn test_adjust_applies_large_deltas_and_records_history() {
        let adjuster = ConcurrencyAdjuster::new(&config(8), monitor_with(0.25 * MIB, 100.0, 5));
        // current 8, recommended 5 (see above), delta 3 -> applied
        assert_eq!(adjuster.adjust(0, 0), 5);
        assert_eq!(adjuster.history(), vec![5]);
        assert_eq!(adjuster.current(), 5);

        // second call: recommendation unchanged, delta 0, nothing recorded
        assert_eq!(adjuster.adjust(0, 0), 5);
        assert_eq!(adjuster.history(), vec![5]);
    }

    #[test]
    fn test_reset_restores_configured_max() {
        let adjuster = ConcurrencyAdjuster::new(&config(8), monitor_with(0.25 * MIB, 100.0, 5));
        adjuster.adjust(0, 0);
        assert_ne!(adjuster.current(), 8);
        adjuster.reset();
        assert_eq!(adjuster.current(), 8);
    }

    #[test]
    fn test_average_over_history() {
        let adjuster = ConcurrencyAdjuster::new(&config(8), monitor_with(0.25 * MIB, 100.0, 5));
        assert_eq!(adjuster.average(), 8); // empty history -> current
        adjuster.adjust(0, 0);
        assert_eq!(adjuster.average(), 5);
    }
}
