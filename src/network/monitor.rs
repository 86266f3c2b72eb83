//! Network quality sampling and concurrency recommendation.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Ring buffer capacity for speed/latency histories.
const MAX_HISTORY_SIZE: usize = 10;

/// Samples required before stability is computed from data.
const MIN_STABILITY_SAMPLES: usize = 3;

/// Neutral stability reported while the history is too short.
const NEUTRAL_STABILITY: f64 = 0.5;

/// How long a probed status stays fresh.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback speed assumed when no measurement exists: 1 MiB/s.
const DEFAULT_SPEED: f64 = 1024.0 * 1024.0;

/// Fallback latency assumed when no measurement exists.
const DEFAULT_LATENCY_MS: f64 = 100.0;

/// Default probe endpoints: a small static asset for throughput and a
/// HEAD-able root for latency.
const DEFAULT_PROBE_URLS: &[&str] = &[
    "https://cdn.jsdelivr.net/gh/sindresorhus/github-markdown-css@4/github-markdown.css",
    "https://httpbin.org/bytes/262144",
];

/// A point-in-time view of network conditions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// Observed throughput in bytes per second.
    pub speed: f64,
    /// Observed round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Consistency of recent samples, 0..=1 (1 = perfectly steady).
    pub stability: f64,
    /// Suggested simultaneous downloads, 1..=10.
    pub recommended_concurrency: usize,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            speed: DEFAULT_SPEED,
            latency_ms: DEFAULT_LATENCY_MS,
            stability: NEUTRAL_STABILITY,
            recommended_concurrency: 2,
        }
    }
}

/// Human-readable quality tier derived from a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    /// Fast, low latency, steady.
    Excellent,
    /// Comfortable for parallel transfers.
    Good,
    /// Usable but conservative settings apply.
    Fair,
    /// Slow, laggy, or erratic.
    Poor,
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    speed_history: VecDeque<f64>,
    latency_history: VecDeque<f64>,
    cached: Option<(Instant, NetworkStatus)>,
}

/// Periodically samples network conditions via lightweight probes.
///
/// Probe URLs are injectable so tests can point the monitor at a local mock
/// server; sample histories can also be fed directly for fully
/// deterministic unit tests.
#[derive(Debug)]
pub struct NetworkMonitor {
    client: reqwest::Client,
    probe_urls: Vec<String>,
    cache_ttl: Duration,
    state: Mutex<MonitorState>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    /// Creates a monitor probing the default public endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::with_probe_urls(DEFAULT_PROBE_URLS.iter().map(|s| (*s).to_string()))
    }

    /// Creates a monitor probing the given URLs (first reachable wins).
    #[must_use]
    pub fn with_probe_urls(urls: impl IntoIterator<Item = String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            probe_urls: urls.into_iter().collect(),
            cache_ttl: DEFAULT_CACHE_TTL,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Overrides the probe cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Probes the network and returns the current status.
    ///
    /// A status probed within the cache TTL is returned as-is, so calling
    /// this on every scheduling tick does not generate probe traffic. Probe
    /// failures fall back to history averages, or to neutral defaults when
    /// no history exists.
    #[instrument(skip(self))]
    pub async fn monitor_network(&self) -> NetworkStatus {
        if let Some(cached) = self.fresh_cached_status() {
            return cached;
        }

        match self.probe().await {
            Some((speed, latency_ms)) => {
                let status = self.record_sample(speed, latency_ms);
                debug!(
                    speed = format_args!("{:.0}", status.speed),
                    latency_ms = format_args!("{:.0}", status.latency_ms),
                    stability = format_args!("{:.2}", status.stability),
                    concurrency = status.recommended_concurrency,
                    "network probe complete"
                );
                status
            }
            None => {
                warn!("network probe failed; using history fallback");
                let status = self.status_from_history();
                self.cache_status(status);
                status
            }
        }
    }

    /// Returns the last known status without probing.
    #[must_use]
    pub fn current_status(&self) -> NetworkStatus {
        let state = self.lock_state();
        state
            .cached
            .map_or_else(NetworkStatus::default, |(_, status)| status)
    }

    /// Feeds one measurement into the histories and refreshes the cache.
    ///
    /// This is the deterministic entry point used by tests and by callers
    /// that measure throughput themselves (e.g. from live transfers).
    pub fn record_sample(&self, speed: f64, latency_ms: f64) -> NetworkStatus {
        let mut state = self.lock_state();
        push_bounded(&mut state.speed_history, speed);
        push_bounded(&mut state.latency_history, latency_ms);

        let stability = calculate_stability(&state.speed_history, &state.latency_history);
        let status = NetworkStatus {
            speed,
            latency_ms,
            stability,
            recommended_concurrency: recommended_concurrency(speed, latency_ms, stability),
        };
        state.cached = Some((Instant::now(), status));
        status
    }

    /// Maps the current status to a quality tier.
    #[must_use]
    pub fn network_quality(&self) -> NetworkQuality {
        quality_of(&self.current_status())
    }

    /// Suggested concurrency for the current status, 1..=10.
    #[must_use]
    pub fn recommended_concurrency(&self) -> usize {
        self.current_status().recommended_concurrency
    }

    fn fresh_cached_status(&self) -> Option<NetworkStatus> {
        let state = self.lock_state();
        state
            .cached
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, status)| status)
    }

    fn cache_status(&self, status: NetworkStatus) {
        self.lock_state().cached = Some((Instant::now(), status));
    }

    fn status_from_history(&self) -> NetworkStatus {
        let state = self.lock_state();
        let speed = mean(&state.speed_history).unwrap_or(DEFAULT_SPEED);
        let latency_ms = mean(&state.latency_history).unwrap_or(DEFAULT_LATENCY_MS);
        let stability = calculate_stability(&state.speed_history, &state.latency_history);
        NetworkStatus {
            speed,
            latency_ms,
            stability,
            recommended_concurrency: recommended_concurrency(speed, latency_ms, stability),
        }
    }

    /// One probe round: timed GET for throughput, timed HEAD for latency.
    /// Tries each configured URL until one answers.
    async fn probe(&self) -> Option<(f64, f64)> {
        for url in &self.probe_urls {
            let started = Instant::now();
            let Ok(response) = self.client.get(url).timeout(PROBE_TIMEOUT).send().await else {
                continue;
            };
            if !response.status().is_success() {
                continue;
            }
            let Ok(body) = response.bytes().await else {
                continue;
            };
            let elapsed = started.elapsed();

            // Round-trip latency via a HEAD to the same endpoint.
            let head_started = Instant::now();
            let latency_ms = match self
                .client
                .head(url)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(_) => head_started.elapsed().as_secs_f64() * 1000.0,
                Err(_) => elapsed.as_secs_f64() * 1000.0,
            };

            let secs = elapsed.as_secs_f64().max(f64::EPSILON);
            #[allow(clippy::cast_precision_loss)]
            let speed = body.len() as f64 / secs;
            return Some((speed, latency_ms));
        }
        None
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn push_bounded(history: &mut VecDeque<f64>, value: f64) {
    history.push_back(value);
    while history.len() > MAX_HISTORY_SIZE {
        history.pop_front();
    }
}

fn mean(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Normalized standard deviation (sigma / mu), or `None` without data.
fn normalized_stddev(values: &VecDeque<f64>) -> Option<f64> {
    let mean = mean(values)?;
    if mean <= 0.0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt() / mean)
}

/// Stability score: `avg(1 - sigma/mu)` over both histories, each term
/// clamped to >= 0. Fewer than 3 samples in either history yields the
/// neutral 0.5.
fn calculate_stability(speeds: &VecDeque<f64>, latencies: &VecDeque<f64>) -> f64 {
    if speeds.len() < MIN_STABILITY_SAMPLES || latencies.len() < MIN_STABILITY_SAMPLES {
        return NEUTRAL_STABILITY;
    }

    let speed_term = normalized_stddev(speeds).map_or(NEUTRAL_STABILITY, |v| (1.0 - v).max(0.0));
    let latency_term =
        normalized_stddev(latencies).map_or(NEUTRAL_STABILITY, |v| (1.0 - v).max(0.0));
    (speed_term + latency_term) / 2.0
}

/// Threshold bands mapping (speed, latency, stability) to 1..=10.
fn recommended_concurrency(speed: f64, latency_ms: f64, stability: f64) -> usize {
    const MIB: f64 = 1024.0 * 1024.0;

    let mut concurrency: isize = if speed > 10.0 * MIB {
        5
    } else if speed > 5.0 * MIB {
        4
    } else if speed > 2.0 * MIB {
        3
    } else if speed > MIB {
        2
    } else {
        1
    };

    if latency_ms > 500.0 {
        concurrency -= 1;
    } else if latency_ms < 50.0 {
        concurrency += 1;
    }

    if stability < 0.3 {
        concurrency -= 1;
    } else if stability > 0.8 {
        concurrency += 1;
    }

    usize::try_from(concurrency.clamp(1, 10)).unwrap_or(1)
}

/// Quality tier thresholds.
fn quality_of(status: &NetworkStatus) -> NetworkQuality {
    const MIB: f64 = 1024.0 * 1024.0;

    if status.speed > 5.0 * MIB && status.latency_ms < 100.0 && status.stability > 0.8 {
        NetworkQuality::Excellent
    } else if status.speed > 2.0 * MIB && status.latency_ms < 200.0 && status.stability > 0.6 {
        NetworkQuality::Good
    } else if status.speed > MIB && status.latency_ms < 500.0 && status.stability > 0.4 {
        NetworkQuality::Fair
    } else {
        NetworkQuality::Poor
    }
}
