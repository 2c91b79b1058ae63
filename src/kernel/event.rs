use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every producer speaks this one type. Timestamps are attached when the
/// signal is captured, so queueing delay never shifts timeout arithmetic.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Pulse(PulseEvent),
    Runout(RunoutEvent),
    /// Raw line received over the serial link.
    Line(LineEvent),
    Link(LinkEvent),
    /// Result of writing a pause command, reported back by the link.
    Dispatch(DispatchOutcome),
}

impl Event {
    pub fn at(&self) -> Instant {
        match self {
            Event::Pulse(e) => e.at,
            Event::Runout(e) => e.at,
            Event::Line(e) => e.at,
            Event::Link(e) => e.at,
            Event::Dispatch(e) => e.at,
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            Event::Pulse(_) => "pulse",
            Event::Runout(_) => "runout",
            Event::Line(_) => "serial",
            Event::Link(_) => "link",
            Event::Dispatch(_) => "dispatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseEvent {
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunoutEvent {
    pub asserted: bool,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    pub text: String,
    pub at: Instant,
}

impl LineEvent {
    pub fn new(text: impl Into<String>, at: Instant) -> Self {
        Self { text: text.into(), at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEvent {
    pub connected: bool,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub trigger_id: Uuid,
    pub sent: bool,
    pub detail: Option<String>,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Enable,
    Disable,
    Reset,
}

impl ControlKind {
    pub fn token(&self) -> &'static str {
        match self {
            ControlKind::Enable => "enable",
            ControlKind::Disable => "disable",
            ControlKind::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMarker {
    pub kind: ControlKind,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    TemperatureReport,
    BusyIndicator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityEvidence {
    pub kind: ActivityKind,
    pub at: Instant,
}
