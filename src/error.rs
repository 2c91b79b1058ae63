use thiserror::Error;

/// Failure taxonomy of the monitor.
///
/// Only `DigitalInputFault` and `InvalidConfig` are fatal. Transport and
/// dispatch failures are recovered by the serial link and the dispatcher.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("serial transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("malformed line: {0}")]
    MalformedLine(String),

    #[error("digital input fault on {pin}: {reason}")]
    DigitalInputFault { pin: String, reason: String },

    #[error("pause command could not be sent: {0}")]
    ActionDispatchFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MonitorError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MonitorError::DigitalInputFault { .. } | MonitorError::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
