use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};

/// A digital input that can be sampled. `read` returns the electrical level,
/// `true` for high.
pub trait DigitalInput: Send {
    fn label(&self) -> &str;
    fn read(&mut self) -> Result<bool>;
}

/// Sysfs GPIO line (`/sys/class/gpio/gpioN/value`), configured as input.
/// The line is unexported on drop if this process exported it.
pub struct SysfsPin {
    root: PathBuf,
    gpio: u32,
    label: String,
    value: File,
    exported_here: bool,
    buf: String,
}

impl SysfsPin {
    pub fn open(root: &Path, gpio: u32) -> Result<Self> {
        let label = format!("gpio{gpio}");
        let dir = root.join(&label);
        let fault = |reason: String| MonitorError::DigitalInputFault {
            pin: label.clone(),
            reason,
        };

        let mut exported_here = false;
        if !dir.exists() {
            fs::write(root.join("export"), gpio.to_string())
                .map_err(|e| fault(format!("export failed: {e}")))?;
            exported_here = true;
            // udev may need a moment to fix permissions on the new node.
            let deadline = Instant::now() + Duration::from_secs(1);
            while !dir.join("value").exists() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
        }

        let direction = dir.join("direction");
        if direction.exists() {
            if let Err(e) = fs::write(&direction, "in") {
                warn!(pin = %label, error = %e, "could not set direction, assuming input");
            }
        }

        let value = File::open(dir.join("value")).map_err(|e| fault(format!("open value: {e}")))?;
        info!(pin = %label, exported_here, "digital input opened");
        Ok(Self {
            root: root.to_path_buf(),
            gpio,
            label,
            value,
            exported_here,
            buf: String::with_capacity(4),
        })
    }
}

impl DigitalInput for SysfsPin {
    fn label(&self) -> &str {
        &self.label
    }

    fn read(&mut self) -> Result<bool> {
        self.buf.clear();
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.read_to_string(&mut self.buf))
            .map_err(|e| MonitorError::DigitalInputFault {
                pin: self.label.clone(),
                reason: e.to_string(),
            })?;
        match self.buf.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(MonitorError::DigitalInputFault {
                pin: self.label.clone(),
                reason: format!("unexpected value {other:?}"),
            }),
        }
    }
}

impl Drop for SysfsPin {
    fn drop(&mut self) {
        if self.exported_here {
            match fs::write(self.root.join("unexport"), self.gpio.to_string()) {
                Ok(()) => debug!(pin = %self.label, "unexported"),
                Err(e) => warn!(pin = %self.label, error = %e, "unexport failed"),
            }
        }
    }
}

/// Accepts a level change only after it has held for `window`.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    stable: bool,
    candidate: bool,
    since: Instant,
}

impl Debouncer {
    pub fn new(initial: bool, window: Duration, at: Instant) -> Self {
        Self {
            window,
            stable: initial,
            candidate: initial,
            since: at,
        }
    }

    pub fn stable(&self) -> bool {
        self.stable
    }

    /// Feed one sample. Returns the new stable level when it changes.
    pub fn update(&mut self, level: bool, at: Instant) -> Option<bool> {
        if level != self.candidate {
            self.candidate = level;
            self.since = at;
        }
        if self.candidate != self.stable && at.saturating_duration_since(self.since) >= self.window {
            self.stable = self.candidate;
            return Some(self.stable);
        }
        None
    }
}
