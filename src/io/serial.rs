//! Serial link to the printer.
//!
//! One async task owns the connection lifecycle; a reader thread per session
//! turns incoming bytes into `Event::Line`. While disconnected every outbound
//! line is rejected immediately, so the dispatcher never waits on a dead port.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::kernel::event::{DispatchOutcome, Event, LineEvent, LinkEvent};

const READ_CHUNK: usize = 256;

/// A line to write to the printer. Pause commands carry their trigger id so
/// the outcome can be reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub line: String,
    pub trigger_id: Option<Uuid>,
}

impl Outbound {
    pub fn line(line: impl Into<String>) -> Self {
        Self { line: line.into(), trigger_id: None }
    }

    pub fn pause(line: impl Into<String>, trigger_id: Uuid) -> Self {
        Self { line: line.into(), trigger_id: Some(trigger_id) }
    }
}

/// Reconnect delay: 0.25s growing by 1.8x up to 5s.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(5), 1.8)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self { initial, max, factor, current: initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = (self.current.as_millis() as f64 * self.factor).round() as u64;
        self.current = Duration::from_millis(grown).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Splits a byte stream into trimmed, non-empty lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }
}

pub struct SerialLink {
    path: PathBuf,
    baud: u32,
}

impl SerialLink {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            path: config.port.clone(),
            baud: config.baud,
        }
    }

    /// Connect, read, write, reconnect; until `cancel` fires.
    pub async fn run(
        self,
        events: mpsc::Sender<Event>,
        mut outbound: mpsc::Receiver<Outbound>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Backoff::default();
        let mut last_error: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match open_port(&self.path, self.baud) {
                Ok(port) => {
                    backoff.reset();
                    last_error = None;
                    info!(port = %self.path.display(), baud = self.baud, "serial connected");
                    let _ = events
                        .send(Event::Link(LinkEvent { connected: true, at: Instant::now() }))
                        .await;

                    let reason = self.session(port, &events, &mut outbound, &cancel).await;

                    let _ = events
                        .send(Event::Link(LinkEvent { connected: false, at: Instant::now() }))
                        .await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(port = %self.path.display(), reason = %reason, "serial disconnected");
                }
                Err(e) => {
                    let text = e.to_string();
                    if last_error.as_deref() != Some(text.as_str()) {
                        warn!(port = %self.path.display(), error = %text, "serial open failed, retrying");
                        last_error = Some(text);
                    }
                }
            }

            let delay = backoff.next_delay();
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = &mut sleep => break,
                    item = outbound.recv() => match item {
                        Some(item) => reject(item, &events, "serial port not connected").await,
                        None => return,
                    },
                }
            }
        }
        debug!("serial link stopped");
    }

    /// Runs one connected session. Returns why it ended.
    async fn session(
        &self,
        mut port: File,
        events: &mpsc::Sender<Event>,
        outbound: &mut mpsc::Receiver<Outbound>,
        cancel: &CancellationToken,
    ) -> String {
        let reader = match port.try_clone() {
            Ok(reader) => reader,
            Err(e) => return format!("clone handle: {e}"),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, mut done_rx) = oneshot::channel::<String>();
        let spawned = spawn_reader(reader, self.path.clone(), events.clone(), stop.clone(), done_tx);
        if let Err(e) = spawned {
            return format!("spawn reader: {e}");
        }

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "shutdown".to_string(),
                reason = &mut done_rx => break reason.unwrap_or_else(|_| "reader exited".to_string()),
                item = outbound.recv() => {
                    let Some(item) = item else {
                        break "outbound queue closed".to_string();
                    };
                    let result = write_line(&mut port, &item.line);
                    let failed = result.as_ref().err().map(|e| e.to_string());
                    if let Some(trigger_id) = item.trigger_id {
                        let outcome = DispatchOutcome {
                            trigger_id,
                            sent: failed.is_none(),
                            detail: failed.clone(),
                            at: Instant::now(),
                        };
                        let _ = events.send(Event::Dispatch(outcome)).await;
                    }
                    if let Some(detail) = failed {
                        error!(line = %item.line, error = %detail, "serial write failed");
                        break format!("write: {detail}");
                    }
                    debug!(line = %item.line, "sent");
                }
            }
        };
        stop.store(true, Ordering::Relaxed);
        reason
    }
}

async fn reject(item: Outbound, events: &mpsc::Sender<Event>, detail: &str) {
    match item.trigger_id {
        Some(trigger_id) => {
            let outcome = DispatchOutcome {
                trigger_id,
                sent: false,
                detail: Some(detail.to_string()),
                at: Instant::now(),
            };
            let _ = events.send(Event::Dispatch(outcome)).await;
        }
        None => debug!(line = %item.line, "dropped while disconnected"),
    }
}

fn write_line(port: &mut File, line: &str) -> Result<()> {
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(b'\n');
    port.write_all(&data)
        .and_then(|_| port.flush())
        .map_err(|e| MonitorError::ActionDispatchFailure(e.to_string()))
}

fn spawn_reader(
    mut port: File,
    path: PathBuf,
    events: mpsc::Sender<Event>,
    stop: Arc<AtomicBool>,
    done: oneshot::Sender<String>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("serial-reader".into()).spawn(move || {
        let mut splitter = LineSplitter::default();
        let mut chunk = [0u8; READ_CHUNK];
        let reason = loop {
            if stop.load(Ordering::Relaxed) {
                break "stopped".to_string();
            }
            match port.read(&mut chunk) {
                // VTIME expired with nothing to read. A vanished device node
                // means the adapter was unplugged.
                Ok(0) => {
                    if !path.exists() {
                        break "device node removed".to_string();
                    }
                }
                Ok(n) => {
                    let at = Instant::now();
                    for text in splitter.push(&chunk[..n]) {
                        if events.blocking_send(Event::Line(LineEvent::new(text, at))).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
                Err(e) => break format!("read: {e}"),
            }
        };
        let _ = done.send(reason);
    })
}

/// Opens the tty raw at `baud`, with reads returning after 0.2s of silence.
#[cfg(unix)]
pub fn open_port(path: &Path, baud: u32) -> Result<File> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    use nix::fcntl::OFlag;
    use nix::sys::termios::{self, ControlFlags, SetArg, SpecialCharacterIndices};

    let unavailable = |what: &str, e: &dyn std::fmt::Display| {
        MonitorError::TransportUnavailable(format!("{}: {what}: {e}", path.display()))
    };

    let speed = baud_rate(baud)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(path)
        .map_err(|e| unavailable("open", &e))?;

    let mut tio = termios::tcgetattr(&file).map_err(|e| unavailable("tcgetattr", &e))?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, speed).map_err(|e| unavailable("cfsetspeed", &e))?;
    tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
    // Keep the board from resetting when the port closes.
    tio.control_flags &= !ControlFlags::HUPCL;
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 2;
    termios::tcsetattr(&file, SetArg::TCSANOW, &tio).map_err(|e| unavailable("tcsetattr", &e))?;
    termios::tcflush(&file, termios::FlushArg::TCIFLUSH).map_err(|e| unavailable("tcflush", &e))?;
    Ok(file)
}

#[cfg(not(unix))]
pub fn open_port(path: &Path, _baud: u32) -> Result<File> {
    Err(MonitorError::TransportUnavailable(format!(
        "{}: serial ports are only supported on unix",
        path.display()
    )))
}

#[cfg(unix)]
fn baud_rate(baud: u32) -> Result<nix::sys::termios::BaudRate> {
    use nix::sys::termios::BaudRate;
    Ok(match baud {
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        other => {
            return Err(MonitorError::InvalidConfig(format!("unsupported baud rate {other}")))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays[0], 250);
        assert_eq!(delays[1], 450);
        assert_eq!(delays[2], 810);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), 5000);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn splitter_handles_partial_and_crlf_lines() {
        let mut s = LineSplitter::default();
        assert!(s.push(b"ok T:21").is_empty());
        assert_eq!(s.push(b"0.1 /0.0\r\n\r\necho:busy: processing\n// sen"), vec![
            "ok T:210.1 /0.0".to_string(),
            "echo:busy: processing".to_string(),
        ]);
        assert_eq!(s.push(b"sor:enable\n"), vec!["// sensor:enable".to_string()]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut s = LineSplitter::default();
        let lines = s.push(b"T:20\xff\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("T:20"));
    }

    #[test]
    fn regular_file_is_not_a_port() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = open_port(file.path(), 115_200).unwrap_err();
        assert!(matches!(err, MonitorError::TransportUnavailable(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn pause_is_rejected_while_disconnected() {
        let config = MonitorConfig {
            port: PathBuf::from("/nonexistent/ttyACM9"),
            ..MonitorConfig::default()
        };
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(SerialLink::new(&config).run(event_tx, out_rx, cancel.clone()));

        let id = Uuid::new_v4();
        out_tx.send(Outbound::pause("M600", id)).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            Event::Dispatch(outcome) => {
                assert_eq!(outcome.trigger_id, id);
                assert!(!outcome.sent);
            }
            other => panic!("unexpected event {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
