//! Retry eligibility and exponential backoff with jitter.
//!
//! [`RetryStrategy`] answers two questions: *may* this error be retried at
//! this attempt count, and *how long* to wait before the next attempt.
//! Delays grow exponentially and are perturbed by ±20% uniform jitter so
//! concurrent chunks that fail together do not hammer the server in
//! lockstep.
//!
//! Delay formula: `min(initial_delay * multiplier^attempt, max_delay)`,
//! multiplied by a jitter factor in `[0.8, 1.2]` and re-capped at
//! `max_delay`. Every computed delay is therefore `<= max_delay` and
//! `>= 0.8x` the capped base.
//!
//! Two presets exist: chunk-level retries use the configured network retry
//! delay, task-level retries start at 5 seconds.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::DownloadConfig;
use crate::error::{DownloadError, Severity};

/// Default task-level retry count.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial delay for task-level retries.
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Default delay cap.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default growth factor per attempt.
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Jitter amplitude as a fraction of the base delay.
const JITTER_FRACTION: f64 = 0.2;

/// Retry eligibility and backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }
}

impl RetryStrategy {
    /// Creates a strategy with explicit settings.
    #[must_use]
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter: true,
        }
    }

    /// Task-level preset: the configured task retry count over the default
    /// 5 s / 60 s / x2 curve.
    #[must_use]
    pub fn for_tasks(config: &DownloadConfig) -> Self {
        Self {
            max_retries: config.network.max_retries,
            ..Self::default()
        }
    }

    /// Chunk-level preset: per-chunk retry count and the configured
    /// inter-retry delay as the curve's starting point.
    #[must_use]
    pub fn for_chunks(config: &DownloadConfig) -> Self {
        Self {
            max_retries: config.chunk.max_retries,
            initial_delay: config.network.retry_delay(),
            ..Self::default()
        }
    }

    /// Disables jitter (deterministic tests).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the configured retry limit.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a failed operation may be retried after `attempt` failures.
    ///
    /// Refused once `attempt` reaches the retry limit, for errors that
    /// declare themselves non-retryable, and for critical severity
    /// regardless of the error's own flag.
    #[must_use]
    pub fn should_retry(&self, error: &DownloadError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            debug!(attempt, max = self.max_retries, "retries exhausted");
            return false;
        }
        if !error.can_retry() {
            return false;
        }
        if error.severity() == Severity::Critical {
            return false;
        }
        true
    }

    /// Computes the backoff delay for a 0-based attempt number.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let jittered_ms = if self.jitter {
            let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
            (capped_ms * factor).min(self.max_delay.as_millis() as f64)
        } else {
            capped_ms
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(jittered_ms as u64)
    }

    /// Runs an async operation, retrying per this strategy.
    ///
    /// The operation runs at most `max_retries` times in total: the
    /// `max_retries`-th failure is terminal. `on_retry` is invoked before
    /// each sleep with the failure count so far (1-based), the error that
    /// triggered it, and the chosen delay.
    ///
    /// # Errors
    ///
    /// Returns the final error once retries are exhausted or the error is
    /// not retryable.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        on_retry: impl Fn(u32, &DownloadError, Duration),
    ) -> Result<T, DownloadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let mut failures = 0u32;
        loop {
            match operation().await {
                Ok(value) => {
                    if failures > 0 {
                        debug!(failures, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    failures += 1;
                    if !self.should_retry(&error, failures) {
                        return Err(error);
                    }
                    let delay = self.delay_for(failures - 1);
                    on_retry(failures, &error, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
