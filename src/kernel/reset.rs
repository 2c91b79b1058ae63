use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Auto-reset thresholds. Both must hold: rate alone is fooled by a short
/// hand-fed burst, a pulse count alone by slow creep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResetPolicy {
    /// Sustained pulse rate (pulses per second) required over `window`.
    pub min_rate: f64,
    pub window: Duration,
    /// Pulses that must be seen since the latch.
    pub min_pulses: u64,
    /// Quiet period after an auto-reset before detection re-arms.
    pub grace: Duration,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            min_rate: 2.0,
            window: Duration::from_millis(1500),
            min_pulses: 25,
            grace: Duration::from_millis(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResetAccumulator {
    policy: ResetPolicy,
    pulses: u64,
    first_pulse: Option<Instant>,
    recent: VecDeque<Instant>,
}

impl ResetAccumulator {
    pub fn new(policy: ResetPolicy) -> Self {
        Self {
            policy,
            pulses: 0,
            first_pulse: None,
            recent: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> &ResetPolicy {
        &self.policy
    }

    /// Start counting from zero. Called on every latch edge and reset.
    pub fn restart(&mut self) {
        self.pulses = 0;
        self.first_pulse = None;
        self.recent.clear();
    }

    pub fn record_pulse(&mut self, at: Instant) {
        self.pulses += 1;
        self.first_pulse = Some(self.first_pulse.map_or(at, |first| first.min(at)));
        self.recent.push_back(at);
        self.prune(at);
    }

    pub fn pulses(&self) -> u64 {
        self.pulses
    }

    /// Pulses per second over the trailing window ending at `now`.
    pub fn rate(&self, now: Instant) -> f64 {
        let window = self.policy.window;
        if window.is_zero() {
            return 0.0;
        }
        let in_window = match now.checked_sub(window) {
            Some(start) => self.recent.iter().filter(|at| **at > start && **at <= now).count(),
            None => self.recent.iter().filter(|at| **at <= now).count(),
        };
        in_window as f64 / window.as_secs_f64()
    }

    /// The trailing window only counts once motion has been observed for
    /// its full length; a burst younger than the window never qualifies.
    fn window_covered(&self, now: Instant) -> bool {
        match self.first_pulse {
            Some(first) => now.saturating_duration_since(first) >= self.policy.window,
            None => false,
        }
    }

    pub fn eligible(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.pulses >= self.policy.min_pulses
            && self.window_covered(now)
            && self.rate(now) >= self.policy.min_rate
    }

    fn prune(&mut self, now: Instant) {
        let Some(horizon) = now.checked_sub(self.policy.window) else {
            return;
        };
        while let Some(front) = self.recent.front() {
            if *front <= horizon {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}
