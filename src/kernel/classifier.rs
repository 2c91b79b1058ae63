//! Serial line classification.
//!
//! Every line the printer echoes back is sorted into exactly one
//! [`LineClass`]. Classification is pure and total: garbled or partial
//! lines come back as [`LineClass::Ignored`], never as an error, so a noisy
//! link can not stall the event stream.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::event::{ActivityKind, ControlKind};
use crate::error::MonitorError;

/// Hotend temperature that counts as evidence of a real print.
pub const DEFAULT_ARM_TEMP_THRESHOLD: f64 = 170.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Control(ControlKind),
    Activity(ActivityKind),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureReport {
    pub hotend_current: f64,
    pub hotend_target: f64,
    pub bed_current: f64,
    pub bed_target: f64,
}

impl TemperatureReport {
    /// Heating for a print: the hotend is targeted at or above the threshold,
    /// or it is already that hot while the bed is being held at temperature.
    pub fn indicates_printing(&self, threshold: f64) -> bool {
        self.hotend_target >= threshold
            || (self.hotend_current >= threshold && self.bed_target > 0.0)
    }
}

// Firmware echo of `M118 A1 sensor:<token>` arrives as `// sensor:<token>`.
// Case sensitive on purpose: a sloppy variant must never toggle protection.
fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*//\s*sensor:(enable|disable|reset)\b").expect("static marker pattern")
    })
}

fn marker_like_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)//\s*sensor:").expect("static marker-like pattern"))
}

fn temperature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?:ok\s+)?T:(?P<tcur>-?\d+(?:\.\d+)?)\s*/\s*(?P<ttgt>-?\d+(?:\.\d+)?)\s+B:(?P<bcur>-?\d+(?:\.\d+)?)\s*/\s*(?P<btgt>-?\d+(?:\.\d+)?)\b",
        )
        .expect("static temperature pattern")
    })
}

fn busy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*echo:busy:").expect("static busy pattern"))
}

pub fn parse_control(line: &str) -> Option<ControlKind> {
    let caps = marker_re().captures(line)?;
    match caps.get(1)?.as_str() {
        "enable" => Some(ControlKind::Enable),
        "disable" => Some(ControlKind::Disable),
        "reset" => Some(ControlKind::Reset),
        _ => None,
    }
}

pub fn parse_temperature(line: &str) -> Option<TemperatureReport> {
    let caps = temperature_re().captures(line)?;
    let field = |name: &str| caps.name(name)?.as_str().parse::<f64>().ok();
    Some(TemperatureReport {
        hotend_current: field("tcur")?,
        hotend_target: field("ttgt")?,
        bed_current: field("bcur")?,
        bed_target: field("btgt")?,
    })
}

/// Periodic temperature chatter that `quiet_temps` keeps out of the echo log.
pub fn is_temperature_chatter(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("T:") || trimmed.starts_with("ok T:")
}

/// Damage a line picked up in transit: bytes that did not decode, or a
/// temperature report cut short.
pub fn malformed(line: &str) -> Option<MonitorError> {
    if line.contains('\u{fffd}') {
        return Some(MonitorError::MalformedLine("undecodable bytes".into()));
    }
    if is_temperature_chatter(line) && parse_temperature(line).is_none() {
        return Some(MonitorError::MalformedLine("truncated temperature report".into()));
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub struct LineClassifier {
    arm_temp_threshold: f64,
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_ARM_TEMP_THRESHOLD)
    }
}

impl LineClassifier {
    pub fn new(arm_temp_threshold: f64) -> Self {
        Self { arm_temp_threshold }
    }

    pub fn classify(&self, line: &str) -> LineClass {
        if let Some(kind) = parse_control(line) {
            return LineClass::Control(kind);
        }
        if marker_like_re().is_match(line) {
            debug!(line, "unrecognized control marker variant ignored");
            return LineClass::Ignored;
        }
        if busy_re().is_match(line) {
            return LineClass::Activity(ActivityKind::BusyIndicator);
        }
        if let Some(report) = parse_temperature(line) {
            if report.indicates_printing(self.arm_temp_threshold) {
                return LineClass::Activity(ActivityKind::TemperatureReport);
            }
        }
        if let Some(e) = malformed(line) {
            debug!(line, error = %e, "malformed line ignored");
        }
        LineClass::Ignored
    }
}
