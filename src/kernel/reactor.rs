use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::classifier::is_temperature_chatter;
use super::dispatch::{ActionDispatcher, SideEffect};
use super::event::{DispatchOutcome, Event};
use super::machine::{Action, JamStateMachine};
use super::state::StatusSnapshot;
use super::time::{age, TICK_MS};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::io::serial::Outbound;

pub struct Reactor {
    pub receiver: mpsc::Receiver<Event>,
    machine: JamStateMachine,
    dispatcher: ActionDispatcher,
    status: watch::Sender<StatusSnapshot>,
    quiet_temps: bool,
    printer_heartbeat: Option<Duration>,
    last_printer_heartbeat: Option<Instant>,
}

impl Reactor {
    pub fn new(receiver: mpsc::Receiver<Event>, config: &MonitorConfig, now: Instant) -> Self {
        let machine = JamStateMachine::new(config, now);
        let (status, _) = watch::channel(machine.state().snapshot(now));
        Self {
            receiver,
            machine,
            dispatcher: ActionDispatcher::new(config),
            status,
            quiet_temps: config.quiet_temps,
            printer_heartbeat: config.printer_heartbeat,
            last_printer_heartbeat: None,
        }
    }

    pub fn machine(&self) -> &JamStateMachine {
        &self.machine
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// Snapshot published after every step.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Pure step: applies `events` in capture order, then evaluates at `now`.
    /// Returns the side effects for the driver. MUST NOT await I/O or timers.
    ///
    /// Before each event the machine is advanced to that event's capture
    /// time, so a gap is judged by when the signals happened, not by when
    /// the batch was drained.
    pub fn tick_step(&mut self, now: Instant, mut events: Vec<Event>) -> Vec<SideEffect> {
        events.sort_by_key(Event::at);
        let mut effects = Vec::new();

        for event in &events {
            trace!(source = event.source(), "event");
            let action = self.machine.advance(event.at());
            self.dispatch(action, &mut effects);

            let action = self.machine.handle(event);
            self.observe(event);
            self.dispatch(action, &mut effects);
        }

        let action = self.machine.advance(now);
        self.dispatch(action, &mut effects);
        effects.extend(self.dispatcher.poll(now, self.machine.state()));

        if let Some(effect) = self.printer_heartbeat(now) {
            effects.push(effect);
        }

        self.status.send_replace(self.machine.state().snapshot(now));
        effects
    }

    fn dispatch(&mut self, action: Option<Action>, effects: &mut Vec<SideEffect>) {
        if let Some(action) = action {
            effects.extend(self.dispatcher.dispatch(&action, self.machine.state()));
        }
    }

    fn observe(&mut self, event: &Event) {
        match event {
            Event::Line(line) => {
                if !(self.quiet_temps && is_temperature_chatter(&line.text)) {
                    info!(target: "printer", "<< {}", line.text);
                }
            }
            Event::Link(link) => self.dispatcher.on_link(link.connected, link.at),
            Event::Dispatch(outcome) => self.dispatcher.on_outcome(outcome),
            Event::Pulse(_) | Event::Runout(_) => {}
        }
    }

    fn printer_heartbeat(&mut self, now: Instant) -> Option<SideEffect> {
        let period = self.printer_heartbeat?;
        if self.last_printer_heartbeat.is_some_and(|last| age(now, last) < period) {
            return None;
        }
        self.last_printer_heartbeat = Some(now);
        let state = self.machine.state();
        Some(SideEffect::announce(format!(
            "SFS: OK enabled={} latched={} armed={} reason={} pulses={} runout={}",
            u8::from(state.enabled()),
            u8::from(state.latched()),
            u8::from(state.armed()),
            state.last_trigger_reason().map_or("none", |r| r.as_str()),
            state.pulse_total(),
            u8::from(state.runout_asserted()),
        )))
    }

    /// Reads the clock, then drains the queue behind `pending`. Every event
    /// captured before `now` is therefore part of the batch.
    fn drain_batch(&mut self, mut pending: Vec<Event>) -> (Instant, Vec<Event>) {
        let now = Instant::now();
        while let Ok(event) = self.receiver.try_recv() {
            pending.push(event);
        }
        (now, pending)
    }

    /// Async driver loop. Ends on cancellation, or with the fault when an
    /// input source dies.
    pub async fn run(
        mut self,
        outbound: mpsc::Sender<Outbound>,
        mut faults: mpsc::Receiver<MonitorError>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(tick_ms = TICK_MS, "reactor started");

        let mut cadence = interval(Duration::from_millis(TICK_MS));
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut feedback: Vec<Event> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reactor stopped");
                    return Ok(());
                }
                Some(fault) = faults.recv() => {
                    error!(error = %fault, "input fault, detection stopped");
                    let notice = SideEffect::announce("SFS: sensor fault, monitoring stopped");
                    execute(vec![notice], &outbound, Instant::now());
                    return Err(fault);
                }
                _ = cadence.tick() => {}
            }

            let (now, events) = self.drain_batch(std::mem::take(&mut feedback));
            let effects = self.tick_step(now, events);
            feedback = execute(effects, &outbound, now);
        }
    }
}

/// Hands effects to the serial link without blocking. A pause that can not
/// even be queued comes back as a failed outcome for the next step.
fn execute(effects: Vec<SideEffect>, outbound: &mpsc::Sender<Outbound>, now: Instant) -> Vec<Event> {
    let mut feedback = Vec::new();
    for effect in effects {
        match effect {
            SideEffect::SendPause { trigger_id, command } => {
                if let Err(e) = outbound.try_send(Outbound::pause(command, trigger_id)) {
                    feedback.push(Event::Dispatch(DispatchOutcome {
                        trigger_id,
                        sent: false,
                        detail: Some(format!("outbound queue: {e}")),
                        at: now,
                    }));
                }
            }
            SideEffect::Announce(line) => {
                if outbound.try_send(Outbound::line(line)).is_err() {
                    debug!("announcement dropped, outbound queue unavailable");
                }
            }
        }
    }
    feedback
}
