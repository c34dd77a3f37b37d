use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("serial port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },
    #[error("truncated exchange: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },
    #[error("acquisition cancelled")]
    Cancelled,
    #[error("invalid CCD timing: {0}")]
    InvalidTiming(String),
    #[error("an acquisition session is already active")]
    Busy,
    #[error("acquisition worker panicked")]
    WorkerPanicked,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
}

impl DriverError {
    /// Whether this error is the normal negative result of a cancel request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
