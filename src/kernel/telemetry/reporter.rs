use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metrics::{render_textfile, write_atomic, MetricsSnapshot};
use crate::kernel::state::StatusSnapshot;

pub const METRICS_INTERVAL: Duration = Duration::from_secs(5);

pub struct StatusReporter {
    status: watch::Receiver<StatusSnapshot>,
    heartbeat: Option<Duration>,
    metrics_file: Option<PathBuf>,
}

impl StatusReporter {
    pub fn new(
        status: watch::Receiver<StatusSnapshot>,
        heartbeat: Option<Duration>,
        metrics_file: Option<PathBuf>,
    ) -> Self {
        Self { status, heartbeat, metrics_file }
    }

    pub fn log_heartbeat(&self) {
        let s = self.status.borrow().clone();
        info!(
            phase = ?s.phase,
            enabled = s.enabled,
            armed = s.armed,
            latched = s.latched,
            reason = s.last_trigger_reason.map_or("none", |r| r.as_str()),
            connected = s.connected,
            pulses = s.pulse_count,
            jams = s.jam_count,
            runouts = s.runout_count,
            last_pulse_age = s.last_pulse_age_seconds.unwrap_or(-1.0),
            version = s.version,
            "heartbeat"
        );
    }

    pub fn write_metrics(&self) {
        let Some(path) = &self.metrics_file else {
            return;
        };
        let snapshot = MetricsSnapshot::from(&*self.status.borrow());
        if let Err(e) = write_atomic(path, &render_textfile(&snapshot)) {
            warn!(path = %path.display(), error = %e, "metrics write failed");
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut heartbeat = self.heartbeat.map(every);
        let mut metrics = self.metrics_file.as_ref().map(|_| every(METRICS_INTERVAL));
        self.write_metrics();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick(&mut heartbeat) => self.log_heartbeat(),
                _ = tick(&mut metrics) => self.write_metrics(),
            }
        }
        self.write_metrics();
        debug!("status reporter stopped");
    }
}

fn every(period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
