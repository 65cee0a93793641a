pub mod history;
pub mod manager;
pub mod models;
pub mod position;
pub mod sequencer;

pub use history::CommandHistory;
pub use manager::{Connector, RigController, SerialConnector};
pub use models::*;
pub use position::CycleState;
pub use sequencer::{Sequencer, SharedLink, StopSignal};

use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum RigError {
    #[error("No matching serial device found: {0}")]
    Discovery(String),

    #[error("Failed to open serial device: {0}")]
    Connection(String),

    #[error("No response to mandatory command {command}")]
    ProtocolTimeout { command: String },

    #[error("Malformed duration '{0}', expected HH:MM:SS")]
    MalformedDuration(String),

    #[error("Unreadable command source: {0}")]
    SourceFormat(String),

    #[error("No open controller connection")]
    LinkUnavailable,

    #[error("Controller already connected")]
    AlreadyConnected,

    #[error("Engine is busy ({0})")]
    Busy(EngineState),

    #[error("Stopped by emergency stop")]
    Stopped,

    #[error("Command history boundary reached")]
    AtBoundary,

    #[error("Serial communication error: {0}")]
    Serial(SerialError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl From<SerialError> for RigError {
    fn from(err: SerialError) -> Self {
        match err {
            SerialError::PortNotFound(msg) => RigError::Discovery(msg),
            SerialError::ConnectionFailed(msg) => RigError::Connection(msg),
            other => RigError::Serial(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RigError>;
