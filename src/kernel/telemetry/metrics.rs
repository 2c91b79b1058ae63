use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use crate::kernel::state::{StatusSnapshot, TriggerReason};

/// Gauges and counters exported to the node-exporter textfile collector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub connected: bool,
    pub enabled: bool,
    pub jam_latched: bool,
    pub armed: bool,
    pub pulse_total: u64,
    pub jam_count: u64,
    pub runout_asserted: bool,
    pub runout_count: u64,
    /// 0 none, 1 jam, 2 runout.
    pub trigger_reason: u8,
    pub last_pulse_age_seconds: f64,
}

impl From<&StatusSnapshot> for MetricsSnapshot {
    fn from(s: &StatusSnapshot) -> Self {
        Self {
            connected: s.connected,
            enabled: s.enabled,
            jam_latched: s.latched,
            armed: s.armed,
            pulse_total: s.pulse_count,
            jam_count: s.jam_count,
            runout_asserted: s.runout_asserted,
            runout_count: s.runout_count,
            trigger_reason: match s.last_trigger_reason {
                None => 0,
                Some(TriggerReason::Jam) => 1,
                Some(TriggerReason::Runout) => 2,
            },
            last_pulse_age_seconds: s.last_pulse_age_seconds.unwrap_or(0.0),
        }
    }
}

fn flag(v: bool) -> u8 {
    u8::from(v)
}

pub fn render_textfile(m: &MetricsSnapshot) -> String {
    let rows: [(&str, &str, &str, String); 10] = [
        ("sfs_connected", "gauge", "Serial connected (1/0)", flag(m.connected).to_string()),
        ("sfs_enabled", "gauge", "Monitor enabled (1/0)", flag(m.enabled).to_string()),
        ("sfs_jam_latched", "gauge", "Trigger latched (1/0)", flag(m.jam_latched).to_string()),
        ("sfs_armed", "gauge", "Jam detection armed (1/0)", flag(m.armed).to_string()),
        ("sfs_pulse_total", "counter", "Total pulses observed", m.pulse_total.to_string()),
        ("sfs_jam_count", "counter", "Total jam events observed", m.jam_count.to_string()),
        ("sfs_runout_asserted", "gauge", "Runout switch asserted (1/0)", flag(m.runout_asserted).to_string()),
        ("sfs_runout_count", "counter", "Total runout events observed", m.runout_count.to_string()),
        ("sfs_trigger_reason", "gauge", "Last trigger reason (0 none, 1 jam, 2 runout)", m.trigger_reason.to_string()),
        ("sfs_last_pulse_age_seconds", "gauge", "Seconds since last pulse", format!("{:.3}", m.last_pulse_age_seconds)),
    ];

    let mut out = String::new();
    for (name, kind, help, value) in rows {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
        let _ = writeln!(out, "{name} {value}");
    }
    out
}

/// Write through a sibling temp file and rename, so scrapers never see a
/// partial file.
pub fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::state::Phase;

    fn latched_runout() -> StatusSnapshot {
        StatusSnapshot {
            phase: Phase::LatchedRunout,
            enabled: true,
            latched: true,
            last_trigger_reason: Some(TriggerReason::Runout),
            pulse_count: 412,
            runout_asserted: true,
            connected: true,
            jam_count: 1,
            runout_count: 2,
            last_pulse_age_seconds: Some(3.25),
            ..StatusSnapshot::default()
        }
    }

    #[test]
    fn textfile_carries_every_series() {
        let text = render_textfile(&MetricsSnapshot::from(&latched_runout()));
        for line in [
            "sfs_connected 1",
            "sfs_enabled 1",
            "sfs_jam_latched 1",
            "sfs_armed 0",
            "sfs_pulse_total 412",
            "sfs_jam_count 1",
            "sfs_runout_asserted 1",
            "sfs_runout_count 2",
            "sfs_trigger_reason 2",
            "sfs_last_pulse_age_seconds 3.250",
        ] {
            assert!(text.lines().any(|l| l == line), "missing {line:?}");
        }
        assert!(text.contains("# TYPE sfs_pulse_total counter"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn no_pulse_yet_reports_zero_age() {
        let m = MetricsSnapshot::from(&StatusSnapshot::default());
        assert_eq!(m.last_pulse_age_seconds, 0.0);
        assert_eq!(m.trigger_reason, 0);
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node/sfs.prom");
        write_atomic(&path, "a 1\n").unwrap();
        write_atomic(&path, "a 2\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a 2\n");
        assert!(!dir.path().join("node/sfs.prom.tmp").exists());
    }
}
