//! The jam/runout state machine.
//!
//! `JamStateMachine` is the only writer of [`MonitorState`]. It is fed one
//! event at a time plus a periodic [`JamStateMachine::advance`] call, and
//! answers each with at most one [`Action`]. It never performs I/O.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::activity::ActivityTracker;
use super::classifier::{LineClass, LineClassifier};
use super::event::{ActivityEvidence, ControlKind, ControlMarker, Event, PulseEvent, RunoutEvent};
use super::reset::ResetAccumulator;
use super::state::{MonitorState, Phase, StateDelta, TriggerReason};
use super::time::age;
use crate::config::MonitorConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Latch edge: the print must be paused.
    Trigger {
        id: Uuid,
        reason: TriggerReason,
        at: Instant,
    },
    /// The latch cleared itself after sustained motion resumed.
    AutoReset { at: Instant },
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    timeout: Duration,
    arm_hold: Duration,
    require_active: bool,
    auto_reset: bool,
}

pub struct JamStateMachine {
    state: MonitorState,
    thresholds: Thresholds,
    classifier: LineClassifier,
    activity: ActivityTracker,
    accumulator: ResetAccumulator,
}

impl JamStateMachine {
    pub fn new(config: &MonitorConfig, now: Instant) -> Self {
        let mut machine = Self {
            state: MonitorState::new(),
            thresholds: Thresholds {
                timeout: config.timeout,
                arm_hold: config.arm_hold,
                require_active: config.require_active,
                auto_reset: config.auto_reset,
            },
            classifier: LineClassifier::new(config.arm_temp_threshold),
            activity: ActivityTracker::new(config.active_recent),
            accumulator: ResetAccumulator::new(config.reset_policy()),
        };
        if config.start_enabled {
            machine.apply_marker(ControlMarker {
                kind: ControlKind::Enable,
                at: now,
            });
        }
        machine
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn handle(&mut self, event: &Event) -> Option<Action> {
        match event {
            Event::Pulse(pulse) => {
                self.on_pulse(*pulse);
                None
            }
            Event::Runout(runout) => self.on_runout(*runout),
            Event::Line(line) => {
                match self.classifier.classify(&line.text) {
                    LineClass::Control(kind) => self.apply_marker(ControlMarker { kind, at: line.at }),
                    LineClass::Activity(kind) => self.activity.observe(ActivityEvidence { kind, at: line.at }),
                    LineClass::Ignored => {}
                }
                None
            }
            Event::Link(link) => {
                if link.connected != self.state.connected() {
                    self.state.reduce(StateDelta::Connected(link.connected));
                }
                None
            }
            // Dispatch outcomes belong to the dispatcher.
            Event::Dispatch(_) => None,
        }
    }

    pub fn apply_marker(&mut self, marker: ControlMarker) {
        let was = self.state.phase();
        match marker.kind {
            ControlKind::Enable => {
                self.state.reduce(StateDelta::Enabled { at: marker.at });
                self.accumulator.restart();
            }
            ControlKind::Disable => {
                self.state.reduce(StateDelta::Disabled);
            }
            ControlKind::Reset => {
                if matches!(was, Phase::LatchedJam | Phase::LatchedRunout) {
                    warn!(phase = ?was, "manual reset cleared an active latch");
                }
                self.state.reduce(StateDelta::ManualReset { at: marker.at });
                self.accumulator.restart();
            }
        }
        info!(marker = marker.kind.token(), from = ?was, to = ?self.state.phase(), "control marker");
    }

    fn on_pulse(&mut self, pulse: PulseEvent) {
        self.state.reduce(StateDelta::PulseObserved { at: pulse.at });
        self.accumulator.record_pulse(pulse.at);
    }

    fn on_runout(&mut self, runout: RunoutEvent) -> Option<Action> {
        self.state.reduce(StateDelta::RunoutLevel { asserted: runout.asserted });
        info!(asserted = runout.asserted, "runout switch changed");
        if runout.asserted && self.state.enabled() {
            return self.latch(TriggerReason::Runout, runout.at);
        }
        None
    }

    /// Periodic evaluation at `now`. Also called with each event's capture
    /// time before the event is applied.
    pub fn advance(&mut self, now: Instant) -> Option<Action> {
        match self.state.phase() {
            Phase::Disabled => None,
            Phase::LatchedJam | Phase::LatchedRunout => self.try_auto_reset(now),
            Phase::PostResetGrace => {
                let elapsed = self.state.grace_until().map_or(true, |until| now >= until);
                if !elapsed {
                    return None;
                }
                self.state.reduce(StateDelta::GraceElapsed);
                debug!("post-reset grace elapsed");
                self.evaluate(now)
            }
            Phase::Idle | Phase::Armed => self.evaluate(now),
        }
    }

    fn evaluate(&mut self, now: Instant) -> Option<Action> {
        let pulse_age = self.state.last_pulse_time().map(|at| age(now, at));
        let armed = self.state.motion_since_baseline()
            && pulse_age.map_or(false, |a| a <= self.thresholds.arm_hold);

        if armed != self.state.armed() {
            self.state.reduce(StateDelta::Armed(armed));
            debug!(armed, age_ms = pulse_age.map(|a| a.as_millis() as u64), "arm state changed");
        }
        if !armed {
            return None;
        }

        let pulse_age = pulse_age?;
        if pulse_age <= self.thresholds.timeout {
            return None;
        }
        if self.thresholds.require_active && !self.activity.recent(now) {
            return None;
        }
        self.latch(TriggerReason::Jam, now)
    }

    fn latch(&mut self, reason: TriggerReason, at: Instant) -> Option<Action> {
        let pulse_age = self.state.last_pulse_time().map(|p| age(at, p));

        if self.state.latched() {
            // Already paused: a runout during a jam latch only sharpens the
            // reason, it never sends a second pause.
            if reason == TriggerReason::Runout && self.state.phase() == Phase::LatchedJam {
                self.state.reduce(StateDelta::Latched { reason });
                warn!("runout asserted while jam latched; latch reason now runout");
            }
            return None;
        }

        self.state.reduce(StateDelta::Latched { reason });
        self.accumulator.restart();
        let id = Uuid::new_v4();
        warn!(
            trigger_id = %id,
            reason = reason.as_str(),
            age_ms = pulse_age.map(|a| a.as_millis() as u64),
            "filament {} detected",
            reason.as_str()
        );
        Some(Action::Trigger { id, reason, at })
    }

    fn try_auto_reset(&mut self, now: Instant) -> Option<Action> {
        if !self.thresholds.auto_reset {
            return None;
        }
        if self.state.phase() == Phase::LatchedRunout && self.state.runout_asserted() {
            return None;
        }
        if !self.accumulator.eligible(now) {
            return None;
        }

        let pulses = self.accumulator.pulses();
        let rate = self.accumulator.rate(now);
        let grace_until = now + self.accumulator.policy().grace;
        self.state.reduce(StateDelta::AutoReset { grace_until });
        self.accumulator.restart();
        info!(pulses, rate, "auto-reset after sustained motion");
        Some(Action::AutoReset { at: now })
    }
}
