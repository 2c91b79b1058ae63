//! Edge sources for the motion and runout inputs.
//!
//! Both are lazy, infinite iterators: every `next()` samples the input until
//! a debounced edge appears and returns it stamped with the capture time.
//! They end only on cancellation or after yielding a `DigitalInputFault`.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::gpio::{Debouncer, DigitalInput};
use crate::error::{MonitorError, Result};
use crate::kernel::event::{Event, PulseEvent, RunoutEvent};
use crate::kernel::time::Clock;

#[derive(Debug, Clone, Copy)]
pub struct EdgeSettings {
    /// `true` when the electrically low level means "active".
    pub active_low: bool,
    pub debounce: Duration,
    pub poll_interval: Duration,
}

/// Debounced "active" level changes of one input.
struct EdgeReader<I, C> {
    input: I,
    clock: C,
    settings: EdgeSettings,
    debouncer: Option<Debouncer>,
    initial_active: Option<bool>,
    cancel: CancellationToken,
    finished: bool,
}

impl<I: DigitalInput, C: Clock> EdgeReader<I, C> {
    fn new(input: I, clock: C, settings: EdgeSettings, cancel: CancellationToken) -> Self {
        debug!(pin = input.label(), ?settings, "edge reader configured");
        Self {
            input,
            clock,
            settings,
            debouncer: None,
            initial_active: None,
            cancel,
            finished: false,
        }
    }

    /// Seed the stable level instead of taking it from the first sample.
    fn assume_initial(mut self, active: bool) -> Self {
        self.initial_active = Some(active);
        self
    }

    fn next_change(&mut self) -> Option<Result<(bool, std::time::Instant)>> {
        loop {
            if self.finished || self.cancel.is_cancelled() {
                return None;
            }
            let at = self.clock.now();
            let level = match self.input.read() {
                Ok(level) => level,
                Err(e) => {
                    debug!(pin = self.input.label(), "edge reader stopped on read error");
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            let active = level != self.settings.active_low;

            let settings = self.settings;
            let initial = self.initial_active;
            let debouncer = self
                .debouncer
                .get_or_insert_with(|| Debouncer::new(initial.unwrap_or(active), settings.debounce, at));
            if let Some(stable) = debouncer.update(active, at) {
                return Some(Ok((stable, at)));
            }

            if !self.settings.poll_interval.is_zero() {
                thread::sleep(self.settings.poll_interval);
            }
        }
    }
}

/// Motion pulses: one event per debounced transition into the active level.
pub struct PulseSource<I, C> {
    reader: EdgeReader<I, C>,
}

impl<I: DigitalInput, C: Clock> PulseSource<I, C> {
    pub fn new(input: I, clock: C, settings: EdgeSettings, cancel: CancellationToken) -> Self {
        Self {
            reader: EdgeReader::new(input, clock, settings, cancel),
        }
    }
}

impl<I: DigitalInput, C: Clock> Iterator for PulseSource<I, C> {
    type Item = Result<PulseEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reader.next_change()? {
                Ok((true, at)) => return Some(Ok(PulseEvent { at })),
                Ok((false, _)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Runout switch: both debounced edges. The switch is assumed clear at
/// start, so a switch already reporting runout yields an assert event once
/// it has been stable for the debounce window.
pub struct RunoutSource<I, C> {
    reader: EdgeReader<I, C>,
}

impl<I: DigitalInput, C: Clock> RunoutSource<I, C> {
    pub fn new(input: I, clock: C, settings: EdgeSettings, cancel: CancellationToken) -> Self {
        Self {
            reader: EdgeReader::new(input, clock, settings, cancel).assume_initial(false),
        }
    }
}

impl<I: DigitalInput, C: Clock> Iterator for RunoutSource<I, C> {
    type Item = Result<RunoutEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(
            self.reader
                .next_change()?
                .map(|(asserted, at)| RunoutEvent { asserted, at }),
        )
    }
}

/// Drain a source on a dedicated thread into the reactor queue. A fault is
/// forwarded on `faults` and ends the pump.
pub fn spawn_pump<S, T>(
    name: &str,
    source: S,
    events: mpsc::Sender<Event>,
    faults: mpsc::Sender<MonitorError>,
) -> std::io::Result<JoinHandle<()>>
where
    S: Iterator<Item = Result<T>> + Send + 'static,
    T: Into<Event>,
{
    let label = name.to_string();
    thread::Builder::new().name(format!("{name}-pump")).spawn(move || {
        for item in source {
            match item {
                Ok(event) => {
                    if events.blocking_send(event.into()).is_err() {
                        debug!(source = %label, "event queue closed");
                        break;
                    }
                }
                Err(e) => {
                    error!(source = %label, error = %e, "digital input failed");
                    let _ = faults.blocking_send(e);
                    break;
                }
            }
        }
        debug!(source = %label, "pump stopped");
    })
}

impl From<PulseEvent> for Event {
    fn from(e: PulseEvent) -> Self {
        Event::Pulse(e)
    }
}

impl From<RunoutEvent> for Event {
    fn from(e: RunoutEvent) -> Self {
        Event::Runout(e)
    }
}
