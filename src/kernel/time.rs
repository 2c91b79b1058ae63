use std::time::{Duration, Instant};

use crate::error::{MonitorError, Result};

/// Cadence of the reactor's periodic evaluation.
pub const TICK_MS: u64 = 50;

/// Source of monotonic timestamps for event capture.
/// Sources stamp events with this at capture time, never at consumption.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Elapsed time from `since` to `now`, zero if `since` is in the future.
pub fn age(now: Instant, since: Instant) -> Duration {
    now.saturating_duration_since(since)
}

/// Converts a seconds option. Negative values clamp to zero; infinite or
/// oversized values are an `InvalidConfig` naming the option.
pub fn secs(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value.max(0.0))
        .map_err(|e| MonitorError::InvalidConfig(format!("{name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_convert_and_clamp() {
        assert_eq!(secs("timeout", 0.85).unwrap(), Duration::from_millis(850));
        assert_eq!(secs("timeout", -2.0).unwrap(), Duration::ZERO);
    }

    #[test]
    fn unrepresentable_seconds_are_config_errors() {
        for value in [f64::INFINITY, 1e300] {
            let err = secs("timeout", value).unwrap_err();
            assert!(matches!(err, MonitorError::InvalidConfig(_)));
            assert!(err.to_string().contains("timeout"), "{err}");
        }
    }

    #[test]
    fn future_timestamp_has_zero_age() {
        let now = Instant::now();
        assert_eq!(age(now, now + Duration::from_secs(1)), Duration::ZERO);
    }
}
