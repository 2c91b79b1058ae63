use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::time::age;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No triggers of any kind until an Enable marker.
    Disabled,
    /// Enabled, not watching for pulse absence.
    Idle,
    /// Motion seen within `arm_hold`; pulse absence beyond `timeout` is a jam.
    Armed,
    LatchedJam,
    LatchedRunout,
    /// Settling period after an auto-reset.
    PostResetGrace,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Disabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Jam,
    Runout,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Jam => "jam",
            TriggerReason::Runout => "runout",
        }
    }

    pub fn latched_phase(&self) -> Phase {
        match self {
            TriggerReason::Jam => Phase::LatchedJam,
            TriggerReason::Runout => Phase::LatchedRunout,
        }
    }
}

/// Strict state delta. This is the ONLY way `MonitorState` mutates.
#[derive(Debug, Clone, PartialEq)]
pub enum StateDelta {
    Enabled { at: Instant },
    Disabled,
    ManualReset { at: Instant },
    PulseObserved { at: Instant },
    RunoutLevel { asserted: bool },
    Armed(bool),
    Latched { reason: TriggerReason },
    AutoReset { grace_until: Instant },
    GraceElapsed,
    Connected(bool),
}

/// The single long-lived safety state. Armed/latched/enabled are all
/// projections of `phase`, so `latched ⇒ ¬armed` and
/// `¬enabled ⇒ ¬armed ∧ ¬latched` hold by construction.
#[derive(Debug, Clone, Default)]
pub struct MonitorState {
    phase: Phase,
    grace_until: Option<Instant>,
    last_pulse_time: Option<Instant>,
    // Arming needs real motion after the latest Enable/Reset baseline.
    motion_since_baseline: bool,
    runout_asserted: bool,
    pulse_total: u64,
    pulses_since_reset: u64,
    jam_count: u64,
    runout_count: u64,
    last_trigger_reason: Option<TriggerReason>,
    connected: bool,
    /// Monotonic count of reductions.
    pub version: u64,
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure reduction: State + Delta -> Mutated State
    pub fn reduce(&mut self, delta: StateDelta) {
        self.version += 1;

        match delta {
            StateDelta::Enabled { at } => {
                self.phase = Phase::Idle;
                self.grace_until = None;
                self.last_pulse_time = Some(at);
                self.motion_since_baseline = false;
            }
            StateDelta::Disabled => {
                self.phase = Phase::Disabled;
                self.grace_until = None;
            }
            StateDelta::ManualReset { at } => {
                if self.phase != Phase::Disabled {
                    self.phase = Phase::Idle;
                }
                self.grace_until = None;
                self.pulses_since_reset = 0;
                self.last_pulse_time = Some(at);
                self.motion_since_baseline = false;
                self.last_trigger_reason = None;
            }
            StateDelta::PulseObserved { at } => {
                self.pulse_total += 1;
                self.pulses_since_reset += 1;
                self.motion_since_baseline = true;
                self.last_pulse_time = Some(match self.last_pulse_time {
                    Some(last) if last > at => last,
                    _ => at,
                });
            }
            StateDelta::RunoutLevel { asserted } => {
                self.runout_asserted = asserted;
            }
            StateDelta::Armed(armed) => match (self.phase, armed) {
                (Phase::Idle, true) => self.phase = Phase::Armed,
                (Phase::Armed, false) => self.phase = Phase::Idle,
                _ => {}
            },
            StateDelta::Latched { reason } => {
                self.phase = reason.latched_phase();
                self.grace_until = None;
                self.last_trigger_reason = Some(reason);
                match reason {
                    TriggerReason::Jam => self.jam_count += 1,
                    TriggerReason::Runout => self.runout_count += 1,
                }
            }
            StateDelta::AutoReset { grace_until } => {
                self.phase = Phase::PostResetGrace;
                self.grace_until = Some(grace_until);
                self.pulses_since_reset = 0;
            }
            StateDelta::GraceElapsed => {
                if self.phase == Phase::PostResetGrace {
                    self.phase = Phase::Idle;
                }
                self.grace_until = None;
            }
            StateDelta::Connected(connected) => {
                self.connected = connected;
            }
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn enabled(&self) -> bool {
        self.phase != Phase::Disabled
    }

    pub fn armed(&self) -> bool {
        self.phase == Phase::Armed
    }

    pub fn latched(&self) -> bool {
        matches!(self.phase, Phase::LatchedJam | Phase::LatchedRunout)
    }

    pub fn grace_until(&self) -> Option<Instant> {
        self.grace_until
    }

    pub fn last_pulse_time(&self) -> Option<Instant> {
        self.last_pulse_time
    }

    pub fn motion_since_baseline(&self) -> bool {
        self.motion_since_baseline
    }

    pub fn runout_asserted(&self) -> bool {
        self.runout_asserted
    }

    pub fn pulse_total(&self) -> u64 {
        self.pulse_total
    }

    pub fn pulses_since_reset(&self) -> u64 {
        self.pulses_since_reset
    }

    pub fn jam_count(&self) -> u64 {
        self.jam_count
    }

    pub fn runout_count(&self) -> u64 {
        self.runout_count
    }

    pub fn last_trigger_reason(&self) -> Option<TriggerReason> {
        self.last_trigger_reason
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn last_pulse_age(&self, now: Instant) -> Option<f64> {
        self.last_pulse_time.map(|at| age(now, at).as_secs_f64())
    }

    pub fn snapshot(&self, now: Instant) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.phase,
            enabled: self.enabled(),
            armed: self.armed(),
            latched: self.latched(),
            last_trigger_reason: self.last_trigger_reason,
            pulse_count: self.pulse_total,
            pulses_since_reset: self.pulses_since_reset,
            runout_asserted: self.runout_asserted,
            connected: self.connected,
            jam_count: self.jam_count,
            runout_count: self.runout_count,
            last_pulse_age_seconds: self.last_pulse_age(now),
            version: self.version,
        }
    }
}

/// Read-only view handed to reporting collaborators after every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub enabled: bool,
    pub armed: bool,
    pub latched: bool,
    pub last_trigger_reason: Option<TriggerReason>,
    pub pulse_count: u64,
    pub pulses_since_reset: u64,
    pub runout_asserted: bool,
    pub connected: bool,
    pub jam_count: u64,
    pub runout_count: u64,
    pub last_pulse_age_seconds: Option<f64>,
    /// Reductions applied so far; unchanged means nothing happened.
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_clears_latch_and_arm() {
        let now = Instant::now();
        let mut state = MonitorState::new();
        state.reduce(StateDelta::Enabled { at: now });
        state.reduce(StateDelta::Latched { reason: TriggerReason::Jam });
        assert!(state.latched());

        state.reduce(StateDelta::Disabled);
        assert!(!state.enabled());
        assert!(!state.armed());
        assert!(!state.latched());
        assert_eq!(state.last_trigger_reason(), Some(TriggerReason::Jam));
    }

    #[test]
    fn arming_only_moves_between_idle_and_armed() {
        let now = Instant::now();
        let mut state = MonitorState::new();
        state.reduce(StateDelta::Armed(true));
        assert_eq!(state.phase(), Phase::Disabled);

        state.reduce(StateDelta::Enabled { at: now });
        state.reduce(StateDelta::Armed(true));
        assert_eq!(state.phase(), Phase::Armed);

        state.reduce(StateDelta::Latched { reason: TriggerReason::Runout });
        state.reduce(StateDelta::Armed(true));
        assert_eq!(state.phase(), Phase::LatchedRunout);
        assert_eq!(state.runout_count(), 1);
    }

    #[test]
    fn reset_while_disabled_stays_disabled() {
        let now = Instant::now();
        let mut state = MonitorState::new();
        state.reduce(StateDelta::PulseObserved { at: now });
        state.reduce(StateDelta::ManualReset { at: now });
        assert_eq!(state.phase(), Phase::Disabled);
        assert_eq!(state.pulses_since_reset(), 0);
        assert_eq!(state.pulse_total(), 1);
    }

    #[test]
    fn late_pulse_never_rewinds_last_pulse_time() {
        let t0 = Instant::now();
        let later = t0 + std::time::Duration::from_millis(500);
        let mut state = MonitorState::new();
        state.reduce(StateDelta::PulseObserved { at: later });
        state.reduce(StateDelta::PulseObserved { at: t0 });
        assert_eq!(state.last_pulse_time(), Some(later));
    }

    #[test]
    fn snapshot_serializes_snake_case() {
        let now = Instant::now();
        let mut state = MonitorState::new();
        state.reduce(StateDelta::Enabled { at: now });
        state.reduce(StateDelta::Latched { reason: TriggerReason::Jam });
        let json = serde_json::to_value(state.snapshot(now)).unwrap();
        assert_eq!(json["phase"], "latched_jam");
        assert_eq!(json["last_trigger_reason"], "jam");
        assert_eq!(json["jam_count"], 1);
        assert_eq!(json["version"], 2);
    }
}
