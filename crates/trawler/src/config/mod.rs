//! Application settings.

mod settings;

pub use settings::{DispatcherSettings, QueueProviderKind, Settings, WorkerTuning};

use std::time::Duration;

/// Read a millisecond duration from an environment variable.
pub(crate) fn env_duration_ms(var: &str, default_ms: u64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(default_ms))
}

/// Read a fraction (0.0..=1.0) from an environment variable.
pub(crate) fn env_fraction(var: &str, default: f64) -> f64 {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| (0.0..=1.0).contains(v))
        .unwrap_or(default)
}

/// Read a plain value with a fallback.
pub(crate) fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
