use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use jamwatch::io::gpio::SysfsPin;
use jamwatch::io::serial::SerialLink;
use jamwatch::io::sources::{spawn_pump, EdgeSettings, PulseSource, RunoutSource};
use jamwatch::kernel::telemetry::reporter::StatusReporter;
use jamwatch::kernel::time::{secs, MonotonicClock};
use jamwatch::{MonitorConfig, Reactor};

#[derive(Parser)]
#[command(name = "jamwatch")]
#[command(about = "Filament jam and runout monitor for serial-attached printers")]
struct Args {
    /// Printer serial port (prefer /dev/serial/by-id/...)
    #[arg(short, long)]
    port: PathBuf,

    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// GPIO line of the motion pulse output
    #[arg(long, default_value = "26")]
    motion_gpio: u32,

    /// GPIO line of the runout switch
    #[arg(long, default_value = "27")]
    runout_gpio: u32,

    #[arg(long, default_value = "/sys/class/gpio")]
    gpio_root: PathBuf,

    /// Runout switch reads high when filament is missing
    #[arg(long)]
    runout_active_high: bool,

    /// Ignore the runout switch
    #[arg(long)]
    no_runout: bool,

    /// Seconds without a pulse, while armed, that count as a jam
    #[arg(long, default_value = "0.85")]
    timeout: f64,

    /// Seconds the monitor stays armed after the last pulse
    #[arg(long, default_value = "1.25")]
    arm_hold: f64,

    #[arg(long, default_value = "0.10")]
    runout_debounce: f64,

    #[arg(long, default_value = "0")]
    pulse_debounce: f64,

    /// Input sampling interval in seconds
    #[arg(long, default_value = "0.001")]
    poll_interval: f64,

    /// Trigger on pulse loss even without printer activity evidence
    #[arg(long)]
    no_require_active: bool,

    /// Seconds a temperature/busy line counts as activity evidence
    #[arg(long, default_value = "120")]
    active_recent: f64,

    #[arg(long, default_value = "170")]
    arm_temp_threshold: f64,

    /// Clear a latch automatically once motion is sustained again
    #[arg(long)]
    auto_reset: bool,

    /// Minimum pulse rate (pulses/s) for auto-reset
    #[arg(long, default_value = "2.0")]
    reset_pulses: f64,

    #[arg(long, default_value = "1.5")]
    reset_window: f64,

    #[arg(long, default_value = "25")]
    reset_min_pulses: u64,

    #[arg(long, default_value = "0.6")]
    post_reset_grace: f64,

    /// Start enabled instead of waiting for `// sensor:enable`
    #[arg(long)]
    start_enabled: bool,

    /// Log and announce triggers without sending the pause command
    #[arg(long)]
    dry_run: bool,

    #[arg(long, default_value = "M600")]
    pause_command: String,

    #[arg(long, default_value = "3")]
    dispatch_attempts: u32,

    #[arg(long, default_value = "2")]
    dispatch_retry_interval: f64,

    /// Local status heartbeat in seconds (0 = off)
    #[arg(long, default_value = "30")]
    heartbeat_seconds: f64,

    /// M118 heartbeat to the printer in seconds (0 = off)
    #[arg(long, default_value = "0")]
    printer_heartbeat_seconds: f64,

    /// Prometheus textfile to refresh every 5s
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Hide temperature reports from the printer echo log
    #[arg(long)]
    quiet_temps: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn optional(name: &str, seconds: f64) -> jamwatch::error::Result<Option<Duration>> {
    if seconds > 0.0 {
        secs(name, seconds).map(Some)
    } else {
        Ok(None)
    }
}

impl Args {
    fn into_config(self) -> jamwatch::error::Result<MonitorConfig> {
        Ok(MonitorConfig {
            port: self.port,
            baud: self.baud,
            gpio_root: self.gpio_root,
            motion_gpio: self.motion_gpio,
            runout_gpio: self.runout_gpio,
            runout_active_high: self.runout_active_high,
            no_runout: self.no_runout,
            pulse_debounce: secs("pulse-debounce", self.pulse_debounce)?,
            runout_debounce: secs("runout-debounce", self.runout_debounce)?,
            poll_interval: secs("poll-interval", self.poll_interval)?,
            timeout: secs("timeout", self.timeout)?,
            arm_hold: secs("arm-hold", self.arm_hold)?,
            require_active: !self.no_require_active,
            active_recent: secs("active-recent", self.active_recent)?,
            arm_temp_threshold: self.arm_temp_threshold,
            start_enabled: self.start_enabled,
            auto_reset: self.auto_reset,
            reset_pulses: self.reset_pulses,
            reset_window: secs("reset-window", self.reset_window)?,
            reset_min_pulses: self.reset_min_pulses,
            post_reset_grace: secs("post-reset-grace", self.post_reset_grace)?,
            dry_run: self.dry_run,
            pause_command: self.pause_command,
            dispatch_attempts: self.dispatch_attempts,
            dispatch_retry_interval: secs("dispatch-retry-interval", self.dispatch_retry_interval)?,
            heartbeat: optional("heartbeat-seconds", self.heartbeat_seconds)?,
            printer_heartbeat: optional("printer-heartbeat-seconds", self.printer_heartbeat_seconds)?,
            metrics_file: self.metrics_file,
            quiet_temps: self.quiet_temps,
        })
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.into_config().context("converting arguments")?;
    config.validate().context("invalid configuration")?;
    info!(
        port = %config.port.display(),
        motion_gpio = config.motion_gpio,
        runout_gpio = ?(!config.no_runout).then_some(config.runout_gpio),
        timeout_s = config.timeout.as_secs_f64(),
        arm_hold_s = config.arm_hold.as_secs_f64(),
        auto_reset = config.auto_reset,
        dry_run = config.dry_run,
        "jamwatch starting"
    );
    if config.dry_run {
        warn!("dry-run: triggers are announced but no pause command is sent");
    }

    let cancel = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(1024);
    let (fault_tx, fault_rx) = mpsc::channel(4);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);

    let motion = SysfsPin::open(&config.gpio_root, config.motion_gpio).context("opening motion input")?;
    let pulses = PulseSource::new(
        motion,
        MonotonicClock,
        EdgeSettings {
            active_low: true,
            debounce: config.pulse_debounce,
            poll_interval: config.poll_interval,
        },
        cancel.clone(),
    );
    let mut pumps = vec![spawn_pump("motion", pulses, event_tx.clone(), fault_tx.clone())
        .context("spawning motion poller")?];

    if !config.no_runout {
        let switch = SysfsPin::open(&config.gpio_root, config.runout_gpio).context("opening runout input")?;
        let runout = RunoutSource::new(
            switch,
            MonotonicClock,
            EdgeSettings {
                active_low: !config.runout_active_high,
                debounce: config.runout_debounce,
                poll_interval: config.poll_interval,
            },
            cancel.clone(),
        );
        pumps.push(spawn_pump("runout", runout, event_tx.clone(), fault_tx).context("spawning runout poller")?);
    }

    let link = tokio::spawn(SerialLink::new(&config).run(event_tx, outbound_rx, cancel.clone()));

    let reactor = Reactor::new(event_rx, &config, Instant::now());
    let reporter = StatusReporter::new(reactor.subscribe(), config.heartbeat, config.metrics_file.clone());
    let reporter = tokio::spawn(reporter.run(cancel.clone()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "could not listen for ctrl-c"),
        }
    });

    let outcome = reactor.run(outbound_tx, fault_rx, cancel.clone()).await;
    cancel.cancel();

    let _ = link.await;
    let _ = reporter.await;
    for pump in pumps {
        let _ = tokio::task::spawn_blocking(move || pump.join()).await;
    }

    if let Err(e) = outcome {
        error!(error = %e, "monitor stopped on fault");
        return Err(e).context("monitoring aborted");
    }
    info!("jamwatch stopped");
    Ok(())
}
