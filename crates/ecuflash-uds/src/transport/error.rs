//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection already open")]
    AlreadyOpen,

    #[error("Connection is not open")]
    NotOpen,

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The background pump terminated; the connection must be re-opened.
    #[error("Transport pump stopped: {0}")]
    PumpStopped(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}
