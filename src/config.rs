use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MonitorError, Result};
use crate::kernel::classifier::DEFAULT_ARM_TEMP_THRESHOLD;
use crate::kernel::reset::ResetPolicy;

/// Upper bound for every duration option. Deadlines are computed as
/// `Instant + Duration` and must not overflow.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Every option the monitor understands, validated once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    // Serial link
    pub port: PathBuf,
    pub baud: u32,

    // Digital inputs
    pub gpio_root: PathBuf,
    pub motion_gpio: u32,
    pub runout_gpio: u32,
    pub runout_active_high: bool,
    pub no_runout: bool,
    pub pulse_debounce: Duration,
    pub runout_debounce: Duration,
    pub poll_interval: Duration,

    // Detection
    pub timeout: Duration,
    pub arm_hold: Duration,
    pub require_active: bool,
    pub active_recent: Duration,
    pub arm_temp_threshold: f64,
    pub start_enabled: bool,

    // Auto-reset
    pub auto_reset: bool,
    pub reset_pulses: f64,
    pub reset_window: Duration,
    pub reset_min_pulses: u64,
    pub post_reset_grace: Duration,

    // Dispatch
    pub dry_run: bool,
    pub pause_command: String,
    pub dispatch_attempts: u32,
    pub dispatch_retry_interval: Duration,

    // Reporting
    pub heartbeat: Option<Duration>,
    pub printer_heartbeat: Option<Duration>,
    pub metrics_file: Option<PathBuf>,
    pub quiet_temps: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            port: PathBuf::from("/dev/ttyACM0"),
            baud: 115_200,
            gpio_root: PathBuf::from("/sys/class/gpio"),
            motion_gpio: 26,
            runout_gpio: 27,
            runout_active_high: false,
            no_runout: false,
            pulse_debounce: Duration::ZERO,
            runout_debounce: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(850),
            arm_hold: Duration::from_millis(1250),
            require_active: true,
            active_recent: Duration::from_secs(120),
            arm_temp_threshold: DEFAULT_ARM_TEMP_THRESHOLD,
            start_enabled: false,
            auto_reset: false,
            reset_pulses: 2.0,
            reset_window: Duration::from_millis(1500),
            reset_min_pulses: 25,
            post_reset_grace: Duration::from_millis(600),
            dry_run: false,
            pause_command: "M600".to_string(),
            dispatch_attempts: 3,
            dispatch_retry_interval: Duration::from_secs(2),
            heartbeat: Some(Duration::from_secs(30)),
            printer_heartbeat: None,
            metrics_file: None,
            quiet_temps: false,
        }
    }
}

impl MonitorConfig {
    pub fn reset_policy(&self) -> ResetPolicy {
        ResetPolicy {
            min_rate: self.reset_pulses,
            window: self.reset_window,
            min_pulses: self.reset_min_pulses,
            grace: self.post_reset_grace,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bounded = [
            ("timeout", Some(self.timeout)),
            ("arm_hold", Some(self.arm_hold)),
            ("active_recent", Some(self.active_recent)),
            ("reset_window", Some(self.reset_window)),
            ("post_reset_grace", Some(self.post_reset_grace)),
            ("dispatch_retry_interval", Some(self.dispatch_retry_interval)),
            ("pulse_debounce", Some(self.pulse_debounce)),
            ("runout_debounce", Some(self.runout_debounce)),
            ("poll_interval", Some(self.poll_interval)),
            ("heartbeat", self.heartbeat),
            ("printer_heartbeat", self.printer_heartbeat),
        ];
        for (name, value) in bounded {
            if value.is_some_and(|v| v > MAX_DURATION) {
                return Err(MonitorError::InvalidConfig(format!(
                    "{name} must not exceed {}s",
                    MAX_DURATION.as_secs()
                )));
            }
        }
        if self.timeout.is_zero() {
            return Err(MonitorError::InvalidConfig("timeout must be positive".into()));
        }
        if self.arm_hold < self.timeout {
            return Err(MonitorError::InvalidConfig(format!(
                "arm_hold ({:.3}s) must be >= timeout ({:.3}s)",
                self.arm_hold.as_secs_f64(),
                self.timeout.as_secs_f64()
            )));
        }
        if !self.reset_pulses.is_finite() || self.reset_pulses < 0.0 {
            return Err(MonitorError::InvalidConfig(
                "reset_pulses must be a non-negative rate".into(),
            ));
        }
        if self.auto_reset && self.reset_window.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "reset_window must be positive when auto_reset is on".into(),
            ));
        }
        if !self.arm_temp_threshold.is_finite() {
            return Err(MonitorError::InvalidConfig("arm_temp_threshold must be finite".into()));
        }
        if self.pause_command.trim().is_empty() {
            return Err(MonitorError::InvalidConfig("pause_command is empty".into()));
        }
        if self.pause_command.contains('\n') {
            return Err(MonitorError::InvalidConfig(
                "pause_command must be a single line".into(),
            ));
        }
        if self.dispatch_attempts == 0 {
            return Err(MonitorError::InvalidConfig(
                "dispatch_attempts must be at least 1".into(),
            ));
        }
        if !self.no_runout && self.motion_gpio == self.runout_gpio {
            return Err(MonitorError::InvalidConfig(format!(
                "motion and runout share GPIO {}",
                self.motion_gpio
            )));
        }
        if self.poll_interval > self.runout_debounce && !self.runout_debounce.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "poll_interval must not exceed runout_debounce".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MonitorConfig::default().validate().unwrap();
    }

    #[test]
    fn arm_hold_shorter_than_timeout_is_rejected() {
        let config = MonitorConfig {
            arm_hold: Duration::from_millis(500),
            ..MonitorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, MonitorError::InvalidConfig(_)));
        assert!(err.to_string().contains("arm_hold"));
    }

    #[test]
    fn shared_gpio_is_rejected_unless_runout_disabled() {
        let mut config = MonitorConfig {
            runout_gpio: 26,
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());
        config.no_runout = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let huge = Duration::from_secs_f64(1e19);
        let cases = [
            MonitorConfig { auto_reset: true, post_reset_grace: huge, ..MonitorConfig::default() },
            MonitorConfig { dispatch_retry_interval: huge, ..MonitorConfig::default() },
            MonitorConfig { active_recent: huge, ..MonitorConfig::default() },
            MonitorConfig { reset_window: huge, ..MonitorConfig::default() },
            MonitorConfig { timeout: huge, arm_hold: huge, ..MonitorConfig::default() },
            MonitorConfig { printer_heartbeat: Some(huge), ..MonitorConfig::default() },
        ];
        for config in cases {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, MonitorError::InvalidConfig(_)), "{err}");
        }

        let at_bound = MonitorConfig {
            post_reset_grace: MAX_DURATION,
            ..MonitorConfig::default()
        };
        assert!(at_bound.validate().is_ok());
    }

    #[test]
    fn multi_line_pause_command_is_rejected() {
        let config = MonitorConfig {
            pause_command: "M600\nM104 S0".into(),
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
