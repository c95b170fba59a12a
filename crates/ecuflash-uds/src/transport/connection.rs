//! Connection adapter bridging request/response calls onto a poll-driven
//! segmented transport
//!
//! The adapter owns two FIFO channels and a background pump. Callers push
//! payloads into the outbound channel and wait on the inbound one; the pump
//! runs on the blocking thread pool and, on every iteration, drains the
//! outbound channel into the transport, runs exactly one transport
//! processing step and forwards every reassembled payload to the inbound
//! channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{SegmentedTransport, TransportAdapter, TransportError};
use crate::uds::{service_id, NegativeResponseCode};

/// Largest payload the segmented transport can carry in one message
pub const MAX_TRANSFER_UNIT: usize = 4095;

const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_micros(100);
const DEFAULT_RESPONSE_PENDING_TIMEOUT: Duration = Duration::from_millis(30000);

/// Snapshot of the adapter lifecycle flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub opened: bool,
    pub exit_requested: bool,
}

type SharedTransport = Arc<Mutex<Box<dyn SegmentedTransport>>>;

/// Channel ends held by the caller side while the connection is open
struct OpenChannels {
    outbound: UnboundedSender<Vec<u8>>,
    /// The pump hands its outbound receiver back on exit so `close` can
    /// discard whatever it did not get to.
    pump: JoinHandle<UnboundedReceiver<Vec<u8>>>,
}

/// Blocking-style request/response connection over a [`SegmentedTransport`]
pub struct ConnectionAdapter {
    transport: SharedTransport,
    mtu: usize,
    pump_interval: Duration,
    response_pending_timeout: Duration,
    exit_requested: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
    channels: Mutex<Option<OpenChannels>>,
    inbound: tokio::sync::Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
    /// Serializes request/response exchanges; the transport carries at most
    /// one outstanding request.
    exchange: tokio::sync::Mutex<()>,
}

impl ConnectionAdapter {
    pub fn new(transport: impl SegmentedTransport) -> Self {
        Self {
            transport: Arc::new(Mutex::new(Box::new(transport))),
            mtu: MAX_TRANSFER_UNIT,
            pump_interval: DEFAULT_PUMP_INTERVAL,
            response_pending_timeout: DEFAULT_RESPONSE_PENDING_TIMEOUT,
            exit_requested: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
            channels: Mutex::new(None),
            inbound: tokio::sync::Mutex::new(None),
            exchange: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval = interval;
        self
    }

    /// How long to keep waiting after the ECU answers "response pending"
    pub fn with_response_pending_timeout(mut self, timeout: Duration) -> Self {
        self.response_pending_timeout = timeout;
        self
    }

    /// Maximum transfer unit applied to both directions
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            opened: self.channels.lock().is_some(),
            exit_requested: self.exit_requested.load(Ordering::SeqCst),
        }
    }

    /// Start the background pump
    pub async fn open(&self) -> Result<(), TransportError> {
        let mut inbound = self.inbound.lock().await;
        let mut channels = self.channels.lock();
        if channels.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        self.exit_requested.store(false, Ordering::SeqCst);
        *self.failure.lock() = None;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let transport = self.transport.clone();
        let exit_requested = self.exit_requested.clone();
        let failure = self.failure.clone();
        let interval = self.pump_interval;

        let pump = tokio::task::spawn_blocking(move || {
            run_pump(
                transport,
                outbound_rx,
                inbound_tx,
                exit_requested,
                failure,
                interval,
            )
        });

        *inbound = Some(inbound_rx);
        *channels = Some(OpenChannels {
            outbound: outbound_tx,
            pump,
        });

        info!("Connection opened");
        Ok(())
    }

    /// Stop the pump, discard in-flight data and reset the transport
    ///
    /// Closing a connection that is not open, or whose pump already died,
    /// is not an error.
    pub async fn close(&self) -> Result<(), TransportError> {
        let channels = { self.channels.lock().take() };
        let Some(OpenChannels { outbound, pump }) = channels else {
            debug!("Close requested on a connection that is not open");
            return Ok(());
        };

        self.exit_requested.store(true, Ordering::SeqCst);
        drop(outbound);

        let mut discarded_tx = 0usize;
        match pump.await {
            Ok(mut outbound_rx) => {
                while outbound_rx.try_recv().is_ok() {
                    discarded_tx += 1;
                }
            }
            Err(e) => error!(error = %e, "Transport pump did not exit cleanly"),
        }

        let mut discarded_rx = 0usize;
        if let Some(mut inbound_rx) = self.inbound.lock().await.take() {
            while inbound_rx.try_recv().is_ok() {
                discarded_rx += 1;
            }
        }

        // A partial multi-frame transfer must not leak into the next session
        self.transport.lock().reset();

        info!(discarded_tx, discarded_rx, "Connection closed");
        Ok(())
    }

    /// Queue a payload for transmission, truncating it to the MTU
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.enqueue(payload)
    }

    /// Wait for the next payload from the transport
    pub async fn wait_frame(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        let inbound_rx = inbound.as_mut().ok_or(TransportError::NotOpen)?;

        match tokio::time::timeout(timeout, inbound_rx.recv()).await {
            Ok(Some(mut frame)) => {
                if frame.len() > self.mtu {
                    warn!(
                        len = frame.len(),
                        mtu = self.mtu,
                        "Truncating received payload to the maximum transfer unit"
                    );
                    frame.truncate(self.mtu);
                }
                Ok(frame)
            }
            Ok(None) => Err(self.pump_stopped()),
            Err(_) => Err(TransportError::Timeout(format!(
                "No frame received from the transport within {:?}",
                timeout
            ))),
        }
    }

    fn enqueue(&self, payload: &[u8]) -> Result<(), TransportError> {
        let channels = self.channels.lock();
        let channels = channels.as_ref().ok_or(TransportError::NotOpen)?;

        if self.exit_requested.load(Ordering::SeqCst) {
            return Err(self.pump_stopped());
        }

        let payload = if payload.len() > self.mtu {
            warn!(
                len = payload.len(),
                mtu = self.mtu,
                "Truncating payload to the maximum transfer unit"
            );
            &payload[..self.mtu]
        } else {
            payload
        };

        channels
            .outbound
            .send(payload.to_vec())
            .map_err(|_| self.pump_stopped())
    }

    /// Throw away frames nobody asked for (late answers to timed-out requests)
    async fn discard_unsolicited(&self) {
        let mut inbound = self.inbound.lock().await;
        if let Some(inbound_rx) = inbound.as_mut() {
            while let Ok(frame) = inbound_rx.try_recv() {
                debug!(frame = %hex::encode(&frame), "Discarding unsolicited frame");
            }
        }
    }

    fn pump_stopped(&self) -> TransportError {
        let reason = self
            .failure
            .lock()
            .clone()
            .unwrap_or_else(|| "pump terminated".to_string());
        TransportError::PumpStopped(reason)
    }
}

#[async_trait]
impl TransportAdapter for ConnectionAdapter {
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let request_sid = *request
            .first()
            .ok_or_else(|| TransportError::SendFailed("Empty request".to_string()))?;
        let expected_positive = request_sid.wrapping_add(0x40);
        let pending = NegativeResponseCode::RESPONSE_PENDING.code();

        let _exchange = self.exchange.lock().await;
        self.discard_unsolicited().await;
        self.enqueue(request)?;

        let mut deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout("Response timeout".to_string()));
            }

            let frame = match self.wait_frame(remaining).await {
                Err(TransportError::Timeout(_)) => {
                    return Err(TransportError::Timeout("Response timeout".to_string()))
                }
                other => other?,
            };

            match frame.as_slice() {
                [sid, ..] if *sid == expected_positive => return Ok(frame),
                [service_id::NEGATIVE_RESPONSE, sid, nrc, ..]
                    if *sid == request_sid && *nrc == pending =>
                {
                    debug!(
                        service_id = format!("0x{:02X}", request_sid),
                        "Response pending, extending deadline"
                    );
                    deadline = Instant::now() + self.response_pending_timeout;
                }
                [service_id::NEGATIVE_RESPONSE, sid, ..] if *sid == request_sid => {
                    return Ok(frame)
                }
                _ => {
                    debug!(
                        frame = %hex::encode(&frame),
                        expected = expected_positive,
                        "Ignoring non-matching response"
                    );
                }
            }
        }
    }

    async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
        let _exchange = self.exchange.lock().await;
        self.enqueue(request)
    }

    fn is_connected(&self) -> bool {
        let state = self.state();
        state.opened && !state.exit_requested
    }
}

impl Drop for ConnectionAdapter {
    fn drop(&mut self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }
}

fn run_pump(
    transport: SharedTransport,
    mut outbound: UnboundedReceiver<Vec<u8>>,
    inbound: UnboundedSender<Vec<u8>>,
    exit_requested: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
    interval: Duration,
) -> UnboundedReceiver<Vec<u8>> {
    debug!("Transport pump started");

    while !exit_requested.load(Ordering::SeqCst) {
        if let Err(e) = pump_once(&transport, &mut outbound, &inbound) {
            exit_requested.store(true, Ordering::SeqCst);
            error!(error = %e, "Transport pump failed, connection must be re-opened");
            *failure.lock() = Some(e.to_string());
            break;
        }
        std::thread::sleep(interval);
    }

    debug!("Transport pump stopped");
    outbound
}

fn pump_once(
    transport: &SharedTransport,
    outbound: &mut UnboundedReceiver<Vec<u8>>,
    inbound: &UnboundedSender<Vec<u8>>,
) -> Result<(), TransportError> {
    let mut transport = transport.lock();

    while let Ok(payload) = outbound.try_recv() {
        transport.send(&payload)?;
    }

    transport.process()?;

    while transport.available() {
        let Some(payload) = transport.recv() else {
            break;
        };
        // The receiver only goes away while closing
        let _ = inbound.send(payload);
    }

    Ok(())
}
