//! Transport traits: the segmented transport collaborator and the
//! request/response adapter built on top of it

use std::time::Duration;

use async_trait::async_trait;

use super::TransportError;

/// A segmented (ISO-TP style) transport that turns whole payloads into
/// link-layer frames and back.
///
/// The transport is poll driven: nothing happens on the bus unless
/// [`process`](SegmentedTransport::process) is called. Flow control timing
/// and frame segmentation are entirely the transport's business.
pub trait SegmentedTransport: Send + 'static {
    /// Queue a complete payload for transmission
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Run a single non-blocking processing step
    fn process(&mut self) -> Result<(), TransportError>;

    /// Whether a reassembled payload is ready to be taken with `recv`
    fn available(&self) -> bool;

    /// Take the next reassembled payload, if any
    fn recv(&mut self) -> Option<Vec<u8>>;

    /// Drop any partial transfer state
    fn reset(&mut self);
}

impl<T: SegmentedTransport + ?Sized> SegmentedTransport for Box<T> {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        (**self).send(payload)
    }

    fn process(&mut self) -> Result<(), TransportError> {
        (**self).process()
    }

    fn available(&self) -> bool {
        (**self).available()
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        (**self).recv()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Request/response interface for UDS communication
///
/// At most one request may be outstanding at a time; implementations
/// serialize concurrent callers.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Send a UDS request and wait for the matching response
    ///
    /// # Arguments
    /// * `request` - The raw UDS request bytes
    /// * `timeout` - Maximum time to wait for a response
    ///
    /// # Returns
    /// The raw UDS response bytes (positive or negative), or an error
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Send a UDS request without waiting for a response
    ///
    /// Used for tester present with suppressed positive response.
    async fn send(&self, request: &[u8]) -> Result<(), TransportError>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;
}
