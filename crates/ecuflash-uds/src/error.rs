//! Reflash errors

use thiserror::Error;

use crate::config::ConfigError;
use crate::firmware::ParseError;
use crate::flash::ReflashState;
use crate::transport::TransportError;
use crate::uds::UdsError;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Firmware image: {0}")]
    Parse(#[from] ParseError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A diagnostic exchange failed; `state` is the phase it failed in
    #[error("Reflash failed during {state}: {source}")]
    Uds {
        state: ReflashState,
        #[source]
        source: UdsError,
    },

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<ConfigError> for FlashError {
    fn from(err: ConfigError) -> Self {
        FlashError::Config(err.to_string())
    }
}

impl FlashError {
    /// Phase a protocol failure happened in, if this is one
    pub fn state(&self) -> Option<ReflashState> {
        match self {
            FlashError::Uds { state, .. } => Some(*state),
            _ => None,
        }
    }
}
