pub mod interface;
pub mod protocol;

pub use interface::{HostPlatform, PortCandidate, SerialInterface};
pub use protocol::{GcodeProtocol, EMERGENCY_STOP};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters of an open serial link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    pub port_name: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One line crossing the link, as pushed to transcript subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub direction: Direction,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl TranscriptLine {
    pub fn new(direction: Direction, text: impl Into<String>) -> Self {
        Self {
            direction,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Response did not go idle within {limit:?} ({lines} lines drained)")]
    ResponseOverrun { limit: Duration, lines: usize },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Line-framed access to the controller.
///
/// `SerialInterface` is the hardware implementation; tests substitute a
/// scripted one.
#[async_trait::async_trait]
pub trait LineTransport: Send {
    /// Write `text` followed by CR-LF. No retry.
    async fn write_line(&mut self, text: &str) -> Result<()>;

    /// Read one line with the terminator stripped. `Ok(None)` means the read
    /// timeout elapsed with nothing pending.
    async fn read_line(&mut self) -> Result<Option<String>>;

    /// Controller reset handshake: drop DTR, settle, clear buffers, raise DTR.
    async fn reset_buffers(&mut self) -> Result<()>;

    fn info(&self) -> &ConnectionInfo;
}
