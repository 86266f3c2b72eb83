//! Priority computation for download requests.
//!
//! A request's effective priority is its base priority scaled by three
//! multipliers - originating module, file size, and network conditions -
//! then rounded and clamped to `1..=100`. Secondary adjustments (age,
//! failure count, user actions) apply after the base calculation and are
//! each independently clamped to the same range.
//!
//! The module multiplier table is pluggable: callers that know nothing
//! about this application's modules can supply their own weights.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::network::NetworkStatus;
use crate::task::{DownloadModule, DownloadRequest};

/// Lowest and highest legal priorities.
const PRIORITY_MIN: u8 = 1;
const PRIORITY_MAX: u8 = 100;

/// Files smaller than this get the small-file bonus: 10 MiB.
const SMALL_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Files larger than this get the large-file penalty: 100 MiB.
const LARGE_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// Cap on the cumulative failure penalty.
const MAX_FAILURE_PENALTY: i32 = 30;

/// Penalty per recorded failure.
const FAILURE_PENALTY_STEP: i32 = 5;

/// A user interaction that shifts an existing task's priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// The user explicitly started the task.
    ManualStart,
    /// The user keeps retrying this task.
    FrequentRetry,
    /// The user dismissed the task.
    Ignore,
    /// The user paused the task.
    Pause,
    /// The user resumed the task.
    Resume,
}

impl UserAction {
    /// Signed priority delta for this action.
    #[must_use]
    pub fn delta(&self) -> i32 {
        match self {
            Self::ManualStart => 20,
            Self::FrequentRetry => 10,
            Self::Ignore => -30,
            Self::Pause => -10,
            Self::Resume => 5,
        }
    }
}

/// Pluggable multiplier table keyed by originating module.
///
/// Defaults reward user-triggered transfers over background fetches.
#[derive(Debug, Clone)]
pub struct ModuleWeights {
    weights: HashMap<DownloadModule, f64>,
}

impl Default for ModuleWeights {
    fn default() -> Self {
        let mut weights = HashMap::new();
        weights.insert(DownloadModule::UserManual, 1.2);
        weights.insert(DownloadModule::PluginInstall, 1.1);
        weights.insert(DownloadModule::AppUpdate, 1.0);
        weights.insert(DownloadModule::ResourceDownload, 0.9);
        Self { weights }
    }
}

impl ModuleWeights {
    /// Overrides one module's multiplier.
    #[must_use]
    pub fn with_weight(mut self, module: DownloadModule, weight: f64) -> Self {
        self.weights.insert(module, weight);
        self
    }

    /// Returns the multiplier for a module (1.0 when unconfigured).
    #[must_use]
    pub fn weight(&self, module: DownloadModule) -> f64 {
        self.weights.get(&module).copied().unwrap_or(1.0)
    }
}

/// Converts requests plus live signals into a bounded integer priority.
#[derive(Debug)]
pub struct PriorityCalculator {
    weights: ModuleWeights,
    network_status: RwLock<Option<NetworkStatus>>,
}

impl Default for PriorityCalculator {
    fn default() -> Self {
        Self::new(ModuleWeights::default())
    }
}

impl PriorityCalculator {
    /// Creates a calculator with the given module weights.
    #[must_use]
    pub fn new(weights: ModuleWeights) -> Self {
        Self {
            weights,
            network_status: RwLock::new(None),
        }
    }

    /// Publishes the latest network status for the network multiplier.
    pub fn set_network_status(&self, status: NetworkStatus) {
        *self
            .network_status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    /// Base priority: `clamp(1, 100, base * module * size * network)`.
    #[must_use]
    pub fn calculate(&self, request: &DownloadRequest) -> u8 {
        let base = f64::from(request.base_priority.clamp(PRIORITY_MIN, PRIORITY_MAX));
        let value = base
            * self.weights.weight(request.module)
            * size_multiplier(request.file_size_hint)
            * self.network_multiplier();
        clamp_priority(value)
    }

    /// Base calculation plus age, failure, and user-action adjustments.
    ///
    /// `created_at_millis` / `now_millis` are unix-millisecond timestamps;
    /// the explicit `now` keeps the age penalty deterministic in tests.
    #[must_use]
    pub fn calculate_comprehensive(
        &self,
        request: &DownloadRequest,
        created_at_millis: u64,
        now_millis: u64,
        failure_count: u32,
        user_action: Option<UserAction>,
    ) -> u8 {
        let mut priority = self.calculate(request);
        priority = Self::adjust_for_age(priority, created_at_millis, now_millis);
        priority = Self::adjust_for_failures(priority, failure_count);
        if let Some(action) = user_action {
            priority = Self::adjust_for_user_action(priority, action);
        }
        priority
    }

    /// Age penalty: tasks neglected past 6 h sink by 20, past 1 h by 10.
    ///
    /// Old tasks sink rather than rise - the starvation this prevents is of
    /// the queue, not of the individual task.
    #[must_use]
    pub fn adjust_for_age(priority: u8, created_at_millis: u64, now_millis: u64) -> u8 {
        const HOUR_MS: u64 = 60 * 60 * 1000;
        let age_ms = now_millis.saturating_sub(created_at_millis);

        if age_ms > 6 * HOUR_MS {
            apply_delta(priority, -20)
        } else if age_ms > HOUR_MS {
            apply_delta(priority, -10)
        } else {
            priority
        }
    }

    /// Failure penalty: -5 per failure, capped at -30.
    #[must_use]
    pub fn adjust_for_failures(priority: u8, failure_count: u32) -> u8 {
        if failure_count == 0 {
            return priority;
        }
        let penalty = (i32::try_from(failure_count).unwrap_or(i32::MAX))
            .saturating_mul(FAILURE_PENALTY_STEP)
            .min(MAX_FAILURE_PENALTY);
        apply_delta(priority, -penalty)
    }

    /// Applies a user-action delta.
    #[must_use]
    pub fn adjust_for_user_action(priority: u8, action: UserAction) -> u8 {
        apply_delta(priority, action.delta())
    }

    /// Network multiplier: slow networks raise priority (fairness), fast
    /// ones lower it; unknown conditions are neutral.
    fn network_multiplier(&self) -> f64 {
        const MIB: f64 = 1024.0 * 1024.0;
        let status = self
            .network_status
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match *status {
            Some(status) if status.speed < MIB => 1.2,
            Some(status) if status.speed > 10.0 * MIB => 0.8,
            Some(_) => 1.0,
            None => 1.0,
        }
    }
}

/// Size multiplier: small files edge ahead (fast perceived completion),
/// very large ones fall slightly behind.
fn size_multiplier(file_size: Option<u64>) -> f64 {
    match file_size {
        Some(size) if size < SMALL_FILE_BYTES => 1.1,
        Some(size) if size > LARGE_FILE_BYTES => 0.9,
        Some(_) => 1.0,
        None => 1.0,
    }
}

/// Rounds and clamps a raw priority value into `1..=100`.
fn clamp_priority(value: f64) -> u8 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rounded = value.round().clamp(f64::from(PRIORITY_MIN), f64::from(PRIORITY_MAX)) as u8;
    rounded
}

/// Applies a signed delta with saturation into `1..=100`.
fn apply_delta(priority: u8, delta: i32) -> u8 {
    let value = i32::from(priority) + delta;
    u8::try_from(value.clamp(i32::from(PRIORITY_MIN), i32::from(PRIORITY_MAX))).unwrap_or(PRIORITY_MIN)
}
