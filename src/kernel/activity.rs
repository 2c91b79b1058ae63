use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::event::{ActivityEvidence, ActivityKind};
use super::time::age;

/// Remembers when real print activity was last evidenced, per kind.
/// Only the newest timestamp per kind is kept.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    window: Duration,
    last_seen: HashMap<ActivityKind, Instant>,
}

impl ActivityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    pub fn observe(&mut self, evidence: ActivityEvidence) {
        let slot = self.last_seen.entry(evidence.kind).or_insert(evidence.at);
        if evidence.at > *slot {
            *slot = evidence.at;
        }
    }

    pub fn last_evidence(&self) -> Option<Instant> {
        self.last_seen.values().copied().max()
    }

    pub fn last_seen(&self, kind: ActivityKind) -> Option<Instant> {
        self.last_seen.get(&kind).copied()
    }

    /// True iff the newest evidence of any kind is within the window.
    pub fn recent(&self, now: Instant) -> bool {
        self.last_evidence()
            .map(|at| age(now, at) <= self.window)
            .unwrap_or(false)
    }
}
