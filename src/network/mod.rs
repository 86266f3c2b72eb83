//! Network observation and adaptive concurrency.
//!
//! [`NetworkMonitor`] samples throughput and latency, derives a stability
//! score and a quality tier, and recommends a concurrency level.
//! [`ConcurrencyAdjuster`] turns those observations into the effective
//! simultaneous-download limit, with hysteresis so the limit does not
//! oscillate on noisy measurements.

mod adjuster;
mod monitor;

pub use adjuster::ConcurrencyAdjuster;
pub use monitor::{NetworkMonitor, NetworkQuality, NetworkStatus};
