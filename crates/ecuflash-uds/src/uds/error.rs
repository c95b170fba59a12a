//! UDS protocol errors

use thiserror::Error;

use super::NegativeResponseCode;
use crate::transport::TransportError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdsError {
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Security access failed: {0}")]
    SecurityAccessFailed(String),
}

impl From<TransportError> for UdsError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(_) => UdsError::Timeout,
            other => UdsError::Transport(other),
        }
    }
}
