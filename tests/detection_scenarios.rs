use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use jamwatch::kernel::dispatch::SideEffect;
use jamwatch::kernel::event::{Event, LineEvent, LinkEvent, PulseEvent, RunoutEvent};
use jamwatch::kernel::state::{Phase, TriggerReason};
use jamwatch::{MonitorConfig, Reactor};

const TICK: u64 = 50;

/// Drives a reactor over synthetic time in 50ms steps.
struct Harness {
    reactor: Reactor,
    t0: Instant,
    now_ms: u64,
    effects: Vec<SideEffect>,
    phases: Vec<Phase>,
}

impl Harness {
    fn new(config: MonitorConfig) -> Self {
        let t0 = Instant::now();
        let (_tx, rx) = mpsc::channel(16);
        let mut reactor = Reactor::new(rx, &config, t0);
        reactor.tick_step(t0, vec![Event::Link(LinkEvent { connected: true, at: t0 })]);
        Self { reactor, t0, now_ms: 0, effects: Vec::new(), phases: vec![Phase::Disabled] }
    }

    fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    /// Steps until `end_ms`, delivering each pulse in the step that covers it.
    fn run(&mut self, end_ms: u64, pulses_ms: &[u64]) {
        while self.now_ms < end_ms {
            let from = self.now_ms;
            self.now_ms += TICK;
            let events = pulses_ms
                .iter()
                .filter(|p| **p > from && **p <= self.now_ms)
                .map(|p| Event::Pulse(PulseEvent { at: self.at(*p) }))
                .collect();
            self.step(events);
        }
    }

    fn step(&mut self, events: Vec<Event>) {
        let now = self.at(self.now_ms);
        let effects = self.reactor.tick_step(now, events);
        self.effects.extend(effects);
        let phase = self.reactor.machine().state().phase();
        if self.phases.last() != Some(&phase) {
            self.phases.push(phase);
        }
    }

    fn line(&mut self, text: &str) {
        let event = Event::Line(LineEvent::new(text, self.at(self.now_ms)));
        self.step(vec![event]);
    }

    fn pauses(&self) -> usize {
        self.effects
            .iter()
            .filter(|e| matches!(e, SideEffect::SendPause { .. }))
            .count()
    }

    fn announced(&self, text: &str) -> usize {
        self.effects
            .iter()
            .filter(|e| matches!(e, SideEffect::Announce(line) if line.ends_with(text)))
            .count()
    }

    fn phase(&self) -> Phase {
        self.reactor.machine().state().phase()
    }
}

fn ungated() -> MonitorConfig {
    MonitorConfig {
        require_active: false,
        ..MonitorConfig::default()
    }
}

fn every(start_ms: u64, step_ms: u64, count: u64) -> Vec<u64> {
    (0..count).map(|i| start_ms + i * step_ms).collect()
}

#[tokio::test]
async fn silence_after_steady_motion_latches_exactly_once() {
    let mut h = Harness::new(ungated());
    h.line("// sensor:enable");

    // Pulses every 0.3s, then 1.0s of silence.
    let pulses = every(300, 300, 10);
    h.run(3000, &pulses);
    assert_eq!(h.phase(), Phase::Armed);
    assert_eq!(h.pauses(), 0);

    // Last pulse at 3000ms: the age passes 0.85s after 3850ms, so the
    // latch lands on the 3900ms tick and not a tick later.
    let mut latched_at = None;
    while h.now_ms < 4000 {
        h.run(h.now_ms + TICK, &pulses);
        if latched_at.is_none() && h.phase() == Phase::LatchedJam {
            latched_at = Some(h.now_ms);
        }
    }
    assert_eq!(latched_at, Some(3900));
    assert_eq!(h.pauses(), 1);
    assert_eq!(h.announced("SFS: Jam detected"), 1);
    assert_eq!(h.phase(), Phase::LatchedJam);

    // Continued silence never re-triggers.
    h.run(10_000, &pulses);
    assert_eq!(h.pauses(), 1);
    let state = h.reactor.machine().state();
    assert_eq!(state.jam_count(), 1);
    assert!(!state.armed());
}

#[tokio::test]
async fn gaps_at_the_timeout_never_trigger() {
    let mut h = Harness::new(ungated());
    h.line("// sensor:enable");

    let pulses = every(850, 850, 12);
    h.run(850 * 12, &pulses);
    assert_eq!(h.pauses(), 0);
    assert!(!h.reactor.machine().state().latched());
    assert_eq!(h.phase(), Phase::Armed);
}

#[tokio::test]
async fn enable_without_motion_never_triggers() {
    let mut h = Harness::new(ungated());
    h.line("// sensor:enable");
    h.run(5000, &[]);
    assert_eq!(h.pauses(), 0);
    assert_eq!(h.phase(), Phase::Idle);
}

#[tokio::test]
async fn disabled_monitor_ignores_silence_and_runout() {
    let mut h = Harness::new(ungated());
    h.run(2000, &every(100, 300, 5));
    let at = h.at(h.now_ms);
    h.step(vec![Event::Runout(RunoutEvent { asserted: true, at })]);
    h.run(4000, &[]);
    assert_eq!(h.pauses(), 0);
    assert_eq!(h.phase(), Phase::Disabled);
}

#[tokio::test]
async fn activity_gate_blocks_trigger_without_print_evidence() {
    let mut h = Harness::new(MonitorConfig::default());
    h.line("// sensor:enable");
    let pulses = every(100, 300, 5);
    h.run(3000, &pulses);
    assert_eq!(h.pauses(), 0, "no temperature or busy evidence yet");

    h.line("ok T:215.0 /215.0 B:60.0 /60.0 @:0 B@:0");
    h.run(6000, &every(3100, 300, 5));
    assert_eq!(h.pauses(), 1);
}

#[tokio::test]
async fn runout_latches_with_runout_reason() {
    let mut h = Harness::new(ungated());
    h.line("// sensor:enable");
    h.run(1000, &every(100, 200, 5));

    let at = h.at(h.now_ms);
    h.step(vec![Event::Runout(RunoutEvent { asserted: true, at })]);
    assert_eq!(h.phase(), Phase::LatchedRunout);
    assert_eq!(h.pauses(), 1);
    assert_eq!(h.announced("SFS: Runout detected"), 1);

    // Silence while latched is not a second trigger.
    h.run(5000, &[]);
    assert_eq!(h.pauses(), 1);
    let state = h.reactor.machine().state();
    assert_eq!(state.runout_count(), 1);
    assert_eq!(state.jam_count(), 0);
    assert_eq!(state.last_trigger_reason(), Some(TriggerReason::Runout));
}

#[tokio::test]
async fn sustained_motion_auto_resets_through_grace() {
    let config = MonitorConfig {
        auto_reset: true,
        reset_min_pulses: 25,
        ..ungated()
    };
    let mut h = Harness::new(config);
    h.line("// sensor:enable");
    h.run(1500, &[500]);
    assert_eq!(h.phase(), Phase::LatchedJam);
    let latched_at = h.now_ms;

    // 30 pulses at 10/s after the latch.
    let pulses = every(latched_at + 100, 100, 30);
    let mut cleared_at = None;
    while h.now_ms < latched_at + 3000 {
        h.run(h.now_ms + TICK, &pulses);
        if cleared_at.is_none() && h.phase() == Phase::PostResetGrace {
            cleared_at = Some(h.now_ms);
            assert_eq!(h.reactor.machine().state().pulses_since_reset(), 0);
        }
    }

    let cleared_at = cleared_at.expect("latch never cleared");
    assert_eq!(cleared_at, latched_at + 2500, "cleared on the 25th pulse");
    assert_eq!(h.announced("SFS: auto-reset"), 1);

    h.run(latched_at + 3100, &pulses);
    assert!(!h.reactor.machine().state().latched());
    let grace = h.phases.iter().position(|p| *p == Phase::PostResetGrace).unwrap();
    assert_eq!(h.phases[grace - 1], Phase::LatchedJam);
    assert!(matches!(h.phases.get(grace + 1), Some(Phase::Idle | Phase::Armed)));
    assert_eq!(h.pauses(), 1);
}

#[tokio::test]
async fn too_few_pulses_never_clear_the_latch() {
    let config = MonitorConfig { auto_reset: true, ..ungated() };
    let mut h = Harness::new(config);
    h.line("// sensor:enable");
    h.run(1500, &[500]);
    assert_eq!(h.phase(), Phase::LatchedJam);

    h.run(6000, &every(1600, 100, 20));
    assert_eq!(h.phase(), Phase::LatchedJam);
    assert_eq!(h.announced("SFS: auto-reset"), 0);
}

#[tokio::test]
async fn disable_clears_every_state() {
    let setups: Vec<(&str, Box<dyn Fn(&mut Harness)>)> = vec![
        ("idle", Box::new(|_h: &mut Harness| {})),
        ("armed", Box::new(|h: &mut Harness| h.run(h.now_ms + 200, &[h.now_ms + 100]))),
        ("jam", Box::new(|h: &mut Harness| h.run(h.now_ms + 1500, &[h.now_ms + 100]))),
        ("runout", Box::new(|h: &mut Harness| {
            let at = h.at(h.now_ms);
            h.step(vec![Event::Runout(RunoutEvent { asserted: true, at })]);
        })),
    ];

    for (name, setup) in setups {
        let mut h = Harness::new(MonitorConfig { auto_reset: true, ..ungated() });
        h.line("// sensor:enable");
        setup(&mut h);
        h.line("// sensor:disable");
        let state = h.reactor.machine().state();
        assert_eq!(state.phase(), Phase::Disabled, "{name}");
        assert!(!state.armed(), "{name}");
        assert!(!state.latched(), "{name}");
    }
}

#[tokio::test]
async fn repeated_markers_are_idempotent() {
    let mut h = Harness::new(ungated());
    h.line("// sensor:enable");
    h.line("// sensor:enable");
    assert_eq!(h.phase(), Phase::Idle);

    h.line("// sensor:reset");
    h.line("// sensor:reset");
    assert_eq!(h.phase(), Phase::Idle);
    assert_eq!(h.reactor.machine().state().pulses_since_reset(), 0);

    h.line("// sensor:disable");
    h.line("// sensor:disable");
    assert_eq!(h.phase(), Phase::Disabled);
    assert_eq!(h.pauses(), 0);
}

#[tokio::test]
async fn near_miss_markers_are_ignored() {
    let mut h = Harness::new(ungated());
    for line in ["// Sensor:enable", "//sensor:enabled", "sensor:enable", "// sensor: enable"] {
        h.line(line);
    }
    assert_eq!(h.phase(), Phase::Disabled);
}

#[tokio::test]
async fn manual_reset_clears_a_latch() {
    let mut h = Harness::new(ungated());
    h.line("// sensor:enable");
    h.run(1500, &[100]);
    assert_eq!(h.phase(), Phase::LatchedJam);

    h.line("// sensor:reset");
    assert_eq!(h.phase(), Phase::Idle);
    assert_eq!(h.reactor.machine().state().last_trigger_reason(), None);
    assert_eq!(h.reactor.machine().state().jam_count(), 1);
}
