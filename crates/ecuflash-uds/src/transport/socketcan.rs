//! Kernel ISO-TP over SocketCAN
//!
//! The kernel does segmentation and flow control; this wrapper only adapts
//! a non-blocking [`IsoTpSocket`] to the poll-driven [`SegmentedTransport`]
//! interface.

use std::collections::VecDeque;
use std::io::ErrorKind;

use socketcan::{ExtendedId, StandardId};
use socketcan_isotp::IsoTpSocket;
use tracing::debug;

use super::{SegmentedTransport, TransportError};
use crate::config::SocketCanConfig;

/// ISO-TP socket bound to one tester/ECU identifier pair
pub struct IsoTpTransport {
    socket: IsoTpSocket,
    received: VecDeque<Vec<u8>>,
}

impl IsoTpTransport {
    pub fn open(config: &SocketCanConfig) -> Result<Self, TransportError> {
        let opened = if config.extended_ids {
            let rx = ExtendedId::new(config.rx_id).ok_or_else(|| invalid_id(config.rx_id, 29))?;
            let tx = ExtendedId::new(config.tx_id).ok_or_else(|| invalid_id(config.tx_id, 29))?;
            IsoTpSocket::open(&config.interface, rx, tx)
        } else {
            let rx = standard_id(config.rx_id)?;
            let tx = standard_id(config.tx_id)?;
            IsoTpSocket::open(&config.interface, rx, tx)
        };
        let socket = opened.map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open ISO-TP socket on {}: {}",
                config.interface, e
            ))
        })?;

        socket.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        debug!(
            interface = %config.interface,
            tx_id = format!("0x{:X}", config.tx_id),
            rx_id = format!("0x{:X}", config.rx_id),
            "ISO-TP socket opened"
        );

        let mut transport = Self {
            socket,
            received: VecDeque::new(),
        };
        // Stale responses from a previous session
        transport.reset();
        Ok(transport)
    }
}

fn standard_id(id: u32) -> Result<StandardId, TransportError> {
    u16::try_from(id)
        .ok()
        .and_then(StandardId::new)
        .ok_or_else(|| invalid_id(id, 11))
}

fn invalid_id(id: u32, bits: u8) -> TransportError {
    TransportError::InvalidConfig(format!("Invalid {}-bit CAN ID: 0x{:X}", bits, id))
}

impl SegmentedTransport for IsoTpTransport {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.socket
            .write(payload)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn process(&mut self) -> Result<(), TransportError> {
        loop {
            match self.socket.read() {
                Ok(data) if !data.is_empty() => self.received.push_back(data.to_vec()),
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    fn available(&self) -> bool {
        !self.received.is_empty()
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        self.received.pop_front()
    }

    fn reset(&mut self) {
        self.received.clear();
        while let Ok(data) = self.socket.read() {
            if data.is_empty() {
                break;
            }
            debug!(data = %hex::encode(data), "Drained stale ISO-TP message");
        }
    }
}
