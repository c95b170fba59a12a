//! Transport layer for UDS communication
//!
//! This module bridges request/response UDS calls onto a segmented
//! (ISO-TP style) transport:
//! - [`SegmentedTransport`] - the poll-driven collaborator that segments and
//!   reassembles payloads
//! - [`ConnectionAdapter`] - channel pair plus background pump on top of it
//! - SocketCAN kernel ISO-TP transport (Linux only)
//! - Simulated programming ECU for testing
//!
//! # Example
//!
//! ```ignore
//! use ecuflash_uds::transport::{create_connection, TransportAdapter};
//! use ecuflash_uds::config::{TimingConfig, TransportConfig};
//!
//! let config = TransportConfig::Mock(Default::default());
//! let connection = create_connection(&config, &TimingConfig::default())?;
//! connection.open().await?;
//! let response = connection.send_receive(&[0x22, 0xF1, 0x90], Duration::from_secs(2)).await?;
//! ```

mod adapter;
mod connection;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{SegmentedTransport, TransportAdapter};
pub use connection::{ConnectionAdapter, ConnectionState, MAX_TRANSFER_UNIT};
pub use error::TransportError;

use crate::config::{TimingConfig, TransportConfig};

/// Create a (not yet opened) connection based on configuration
pub fn create_connection(
    config: &TransportConfig,
    timing: &TimingConfig,
) -> Result<ConnectionAdapter, TransportError> {
    let connection = match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            ConnectionAdapter::new(socketcan::IsoTpTransport::open(cfg)?)
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => {
            return Err(TransportError::Unsupported(
                "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
            ))
        }
        TransportConfig::Mock(cfg) => ConnectionAdapter::new(mock::MockEcu::from_config(cfg)),
    };

    Ok(connection
        .with_pump_interval(timing.pump_interval())
        .with_response_pending_timeout(timing.response_pending_timeout()))
}
