use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use uuid::Uuid;

use super::event::DispatchOutcome;
use super::machine::Action;
use super::state::{MonitorState, TriggerReason};
use crate::config::MonitorConfig;

/// Work handed back to the driver. The kernel never touches the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Write the pause command. The link reports back with `Event::Dispatch`.
    SendPause { trigger_id: Uuid, command: String },
    /// Best-effort message on the printer console.
    Announce(String),
}

impl SideEffect {
    pub fn announce(message: impl AsRef<str>) -> Self {
        SideEffect::Announce(format!("M118 A1 {}", message.as_ref()))
    }
}

/// What was decided for the most recent trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub trigger_id: Uuid,
    pub reason: TriggerReason,
    pub at: Instant,
    pub dry_run: bool,
    pub attempts: u32,
    pub delivered: bool,
}

#[derive(Debug, Clone)]
struct Pending {
    trigger_id: Uuid,
    next_attempt: Instant,
    in_flight: bool,
    reported_unavailable: bool,
}

pub struct ActionDispatcher {
    pause_command: String,
    dry_run: bool,
    max_attempts: u32,
    retry_interval: Duration,
    pending: Option<Pending>,
    last: Option<DispatchRecord>,
}

impl ActionDispatcher {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            pause_command: config.pause_command.clone(),
            dry_run: config.dry_run,
            max_attempts: config.dispatch_attempts.max(1),
            retry_interval: config.dispatch_retry_interval,
            pending: None,
            last: None,
        }
    }

    pub fn last_record(&self) -> Option<&DispatchRecord> {
        self.last.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn dispatch(&mut self, action: &Action, state: &MonitorState) -> Vec<SideEffect> {
        match action {
            Action::Trigger { id, reason, at } => {
                let headline = match reason {
                    TriggerReason::Jam => "SFS: Jam detected",
                    TriggerReason::Runout => "SFS: Runout detected",
                };
                let mut effects = vec![SideEffect::announce(headline)];
                self.pending = None;
                self.last = Some(DispatchRecord {
                    trigger_id: *id,
                    reason: *reason,
                    at: *at,
                    dry_run: self.dry_run,
                    attempts: 0,
                    delivered: false,
                });

                if self.dry_run {
                    warn!(trigger_id = %id, command = %self.pause_command, "dry-run: would send pause command");
                    effects.push(SideEffect::announce("SFS: DRY-RUN (not sending pause)"));
                    return effects;
                }

                self.pending = Some(Pending {
                    trigger_id: *id,
                    next_attempt: *at,
                    in_flight: false,
                    reported_unavailable: false,
                });
                effects.extend(self.attempt(*at, state.connected()));
                effects
            }
            Action::AutoReset { .. } => {
                self.pending = None;
                vec![SideEffect::announce("SFS: auto-reset")]
            }
        }
    }

    /// Drives deferred retries. Called once per reactor step.
    pub fn poll(&mut self, now: Instant, state: &MonitorState) -> Vec<SideEffect> {
        let Some(pending) = &self.pending else {
            return Vec::new();
        };
        if !state.latched() {
            info!(trigger_id = %pending.trigger_id, "latch cleared, pending pause dropped");
            self.pending = None;
            return Vec::new();
        }
        if pending.in_flight || now < pending.next_attempt {
            return Vec::new();
        }
        self.attempt(now, state.connected())
    }

    /// A fresh connection is a retry opportunity right away.
    pub fn on_link(&mut self, connected: bool, at: Instant) {
        if let Some(pending) = self.pending.as_mut() {
            if connected {
                pending.next_attempt = at;
            } else if pending.in_flight {
                pending.in_flight = false;
            }
        }
    }

    pub fn on_outcome(&mut self, outcome: &DispatchOutcome) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.trigger_id != outcome.trigger_id {
            return;
        }
        pending.in_flight = false;
        let attempts = self.last.as_ref().map_or(0, |r| r.attempts);

        if outcome.sent {
            info!(trigger_id = %outcome.trigger_id, attempts, command = %self.pause_command, "pause command sent");
            if let Some(record) = self.last.as_mut() {
                record.delivered = true;
            }
            self.pending = None;
            return;
        }

        error!(
            trigger_id = %outcome.trigger_id,
            attempt = attempts,
            max_attempts = self.max_attempts,
            detail = outcome.detail.as_deref().unwrap_or("unknown"),
            "PAUSE COMMAND FAILED"
        );
        if attempts >= self.max_attempts {
            error!(trigger_id = %outcome.trigger_id, "giving up on pause command; print is NOT paused");
            self.pending = None;
        } else {
            pending.next_attempt = outcome.at + self.retry_interval;
        }
    }

    fn attempt(&mut self, now: Instant, connected: bool) -> Vec<SideEffect> {
        let Some(pending) = self.pending.as_mut() else {
            return Vec::new();
        };
        if !connected {
            if !pending.reported_unavailable {
                pending.reported_unavailable = true;
                error!(
                    trigger_id = %pending.trigger_id,
                    "serial transport unavailable; pause deferred until reconnect"
                );
            }
            return Vec::new();
        }
        let Some(record) = self.last.as_mut() else {
            return Vec::new();
        };
        if record.attempts >= self.max_attempts {
            self.pending = None;
            return Vec::new();
        }

        record.attempts += 1;
        pending.in_flight = true;
        pending.next_attempt = now + self.retry_interval;
        vec![SideEffect::SendPause {
            trigger_id: pending.trigger_id,
            command: self.pause_command.clone(),
        }]
    }
}
