//! Simulated programming ECU for testing
//!
//! [`MockEcu`] is a [`SegmentedTransport`] whose far end is an in-process
//! ECU model. It answers the services used for diagnosis and reprogramming,
//! checks security keys, enforces the TransferData sequence counter and
//! keeps what was downloaded. Clones share the same ECU, so a test can keep
//! a handle for inspection after moving one into a connection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::{SegmentedTransport, TransportError};
use crate::config::MockConfig;
use crate::firmware::MemoryBlock;
use crate::flash::BlockSequenceCounter;
use crate::security::{derive_key, DEFAULT_ALGORITHM_PARAMS};
use crate::uds::{
    data_identifier, routine_sub_function, service_id, session_type, DtcStatus,
    NegativeResponseCode, SUPPRESS_POSITIVE_RESPONSE,
};

const DEFAULT_SEED: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

struct Download {
    address: u32,
    size: u32,
    data: Vec<u8>,
    counter: BlockSequenceCounter,
}

struct EcuState {
    max_block_length: u16,
    latency: Duration,
    seed: [u8; 4],
    algorithm_params: [u32; 4],

    session: u8,
    unlocked_level: Option<u8>,
    pending_seed: Option<u8>,
    dtc_setting: Option<u8>,
    communication_control: Option<(u8, u8)>,
    dids: HashMap<u16, Vec<u8>>,
    dtcs: Vec<(u32, u8)>,
    download: Option<Download>,
    memory: Vec<MemoryBlock>,
    routines: Vec<(u16, Vec<u8>)>,
    transfer_counters: Vec<u8>,
    resets: usize,

    requests: Vec<Vec<u8>>,
    inbox: VecDeque<Vec<u8>>,
    outbox: VecDeque<(Instant, Vec<u8>)>,

    injected_nrc: HashMap<u8, u8>,
    injected_pending: HashMap<u8, usize>,
    silent_services: HashSet<u8>,
    failure_trigger: Option<(u8, usize, String)>,
    processing_failure: Option<String>,
}

impl EcuState {
    fn new() -> Self {
        let mut dids = HashMap::new();
        dids.insert(data_identifier::VIN, b"WDB2030461A123456".to_vec());
        dids.insert(data_identifier::ECU_SOFTWARE_VERSION, b"SW-1.0.0".to_vec());
        dids.insert(data_identifier::ECU_HARDWARE_NUMBER, b"HW-12345".to_vec());
        dids.insert(data_identifier::SUPPLIER_SOFTWARE_VERSION, b"C11-0.9.3".to_vec());

        Self {
            max_block_length: MockConfig::default().max_block_length,
            latency: Duration::ZERO,
            seed: DEFAULT_SEED,
            algorithm_params: DEFAULT_ALGORITHM_PARAMS,
            session: session_type::DEFAULT,
            unlocked_level: None,
            pending_seed: None,
            dtc_setting: None,
            communication_control: None,
            dids,
            dtcs: vec![(0x01_2345, 0x09), (0x06_7890, 0x28)],
            download: None,
            memory: Vec::new(),
            routines: Vec::new(),
            transfer_counters: Vec::new(),
            resets: 0,
            requests: Vec::new(),
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            injected_nrc: HashMap::new(),
            injected_pending: HashMap::new(),
            silent_services: HashSet::new(),
            failure_trigger: None,
            processing_failure: None,
        }
    }

    fn handle(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let sid = *request.first()?;

        if self.silent_services.contains(&sid) {
            return None;
        }
        if let Some(&nrc) = self.injected_nrc.get(&sid) {
            return Some(negative(sid, nrc));
        }

        let result = match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => self.session_control(request),
            service_id::ECU_RESET => self.ecu_reset(request),
            service_id::SECURITY_ACCESS => self.security_access(request),
            service_id::TESTER_PRESENT => return self.tester_present(request),
            service_id::CONTROL_DTC_SETTING => self.control_dtc_setting(request),
            service_id::COMMUNICATION_CONTROL => self.communication_control(request),
            service_id::READ_DATA_BY_ID => self.read_data(request),
            service_id::WRITE_DATA_BY_ID => self.write_data(request),
            service_id::ROUTINE_CONTROL => self.routine_control(request),
            service_id::REQUEST_DOWNLOAD => self.request_download(request),
            service_id::TRANSFER_DATA => self.transfer_data(request),
            service_id::REQUEST_TRANSFER_EXIT => self.transfer_exit(),
            service_id::READ_DTC_INFO => self.read_dtcs(request),
            service_id::CLEAR_DIAGNOSTIC_INFO => self.clear_dtcs(request),
            _ => Err(NegativeResponseCode::SERVICE_NOT_SUPPORTED),
        };

        Some(match result {
            Ok(mut data) => {
                data.insert(0, service_id::positive_response(sid));
                data
            }
            Err(nrc) => negative(sid, nrc.code()),
        })
    }

    fn session_control(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let session = arg(request, 1)?;
        self.session = session;
        self.lock();
        Ok(vec![session, 0x00, 0x19, 0x01, 0xF4])
    }

    fn ecu_reset(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let reset_type = arg(request, 1)?;
        self.resets += 1;
        self.session = session_type::DEFAULT;
        self.lock();
        self.download = None;
        self.dtc_setting = None;
        self.communication_control = None;
        Ok(vec![reset_type])
    }

    fn security_access(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let sub = arg(request, 1)?;

        if sub % 2 == 1 {
            if self.unlocked_level == Some(sub) {
                return Ok(vec![sub, 0, 0, 0, 0]);
            }
            self.pending_seed = Some(sub);
            let mut response = vec![sub];
            response.extend_from_slice(&self.seed);
            return Ok(response);
        }

        let level = sub.wrapping_sub(1);
        if self.pending_seed.take() != Some(level) {
            return Err(NegativeResponseCode::REQUEST_SEQUENCE_ERROR);
        }
        let expected = derive_key(level, self.seed, &self.algorithm_params);
        if request[2..] != expected {
            debug!(level, "Mock ECU rejected security key");
            return Err(NegativeResponseCode::INVALID_KEY);
        }
        self.unlocked_level = Some(level);
        Ok(vec![sub])
    }

    fn tester_present(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let sub = request.get(1).copied().unwrap_or(0);
        if sub & SUPPRESS_POSITIVE_RESPONSE != 0 {
            return None;
        }
        Some(vec![service_id::positive_response(service_id::TESTER_PRESENT), sub])
    }

    fn control_dtc_setting(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let setting = arg(request, 1)?;
        self.dtc_setting = Some(setting);
        Ok(vec![setting])
    }

    fn communication_control(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let control = arg(request, 1)?;
        let comm_type = arg(request, 2)?;
        self.communication_control = Some((control, comm_type));
        Ok(vec![control])
    }

    fn read_data(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let did = u16::from_be_bytes([arg(request, 1)?, arg(request, 2)?]);
        let value = self
            .dids
            .get(&did)
            .ok_or(NegativeResponseCode::REQUEST_OUT_OF_RANGE)?;
        let mut response = did.to_be_bytes().to_vec();
        response.extend_from_slice(value);
        Ok(response)
    }

    fn write_data(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let did = u16::from_be_bytes([arg(request, 1)?, arg(request, 2)?]);
        if request.len() < 4 {
            return Err(NegativeResponseCode::INCORRECT_MESSAGE_LENGTH);
        }
        if self.unlocked_level.is_none() {
            return Err(NegativeResponseCode::SECURITY_ACCESS_DENIED);
        }
        self.dids.insert(did, request[3..].to_vec());
        Ok(did.to_be_bytes().to_vec())
    }

    fn routine_control(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let sub = arg(request, 1)?;
        let rid = u16::from_be_bytes([arg(request, 2)?, arg(request, 3)?]);
        if sub != routine_sub_function::START_ROUTINE {
            return Err(NegativeResponseCode::SUB_FUNCTION_NOT_SUPPORTED);
        }
        self.routines.push((rid, request[4..].to_vec()));
        let [hi, lo] = rid.to_be_bytes();
        Ok(vec![sub, hi, lo, 0x00])
    }

    fn request_download(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        if self.unlocked_level.is_none() {
            return Err(NegativeResponseCode::SECURITY_ACCESS_DENIED);
        }
        if self.download.is_some() {
            return Err(NegativeResponseCode::CONDITIONS_NOT_CORRECT);
        }

        let alfi = arg(request, 2)?;
        let address_width = usize::from(alfi & 0x0F);
        let size_width = usize::from(alfi >> 4);
        if address_width > 4 || size_width > 4 || request.len() != 3 + address_width + size_width {
            return Err(NegativeResponseCode::INCORRECT_MESSAGE_LENGTH);
        }

        let fields = &request[3..];
        let address = be_value(&fields[..address_width]);
        let size = be_value(&fields[address_width..]);

        self.download = Some(Download {
            address,
            size,
            data: Vec::with_capacity(size as usize),
            counter: BlockSequenceCounter::new(),
        });

        let [hi, lo] = self.max_block_length.to_be_bytes();
        Ok(vec![0x20, hi, lo])
    }

    fn transfer_data(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let max_block_length = usize::from(self.max_block_length);
        let download = self
            .download
            .as_mut()
            .ok_or(NegativeResponseCode::REQUEST_SEQUENCE_ERROR)?;

        let counter = arg(request, 1)?;
        if counter != download.counter.value() {
            return Err(NegativeResponseCode::WRONG_BLOCK_SEQUENCE_COUNTER);
        }
        if request.len() > max_block_length {
            return Err(NegativeResponseCode::INCORRECT_MESSAGE_LENGTH);
        }
        let data = &request[2..];
        if download.data.len() + data.len() > download.size as usize {
            return Err(NegativeResponseCode::TRANSFER_DATA_SUSPENDED);
        }

        download.data.extend_from_slice(data);
        download.counter.advance();
        self.transfer_counters.push(counter);
        Ok(vec![counter])
    }

    fn transfer_exit(&mut self) -> Result<Vec<u8>, NegativeResponseCode> {
        let download = self
            .download
            .take()
            .ok_or(NegativeResponseCode::REQUEST_SEQUENCE_ERROR)?;
        if download.data.len() != download.size as usize {
            return Err(NegativeResponseCode::GENERAL_PROGRAMMING_FAILURE);
        }
        self.memory
            .push(MemoryBlock::new(download.address, download.data));
        Ok(Vec::new())
    }

    fn read_dtcs(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        let sub = arg(request, 1)?;
        if sub != 0x02 {
            return Err(NegativeResponseCode::SUB_FUNCTION_NOT_SUPPORTED);
        }
        let mask = arg(request, 2)?;

        let mut response = vec![sub, 0xFF];
        for (number, status) in self
            .dtcs
            .iter()
            .filter(|(_, s)| DtcStatus(*s).matches_mask(mask))
        {
            response.extend_from_slice(&number.to_be_bytes()[1..]);
            response.push(*status);
        }
        Ok(response)
    }

    fn clear_dtcs(&mut self, request: &[u8]) -> Result<Vec<u8>, NegativeResponseCode> {
        if request.len() != 4 {
            return Err(NegativeResponseCode::INCORRECT_MESSAGE_LENGTH);
        }
        self.dtcs.clear();
        Ok(Vec::new())
    }

    fn lock(&mut self) {
        self.unlocked_level = None;
        self.pending_seed = None;
    }
}

fn arg(request: &[u8], index: usize) -> Result<u8, NegativeResponseCode> {
    request
        .get(index)
        .copied()
        .ok_or(NegativeResponseCode::INCORRECT_MESSAGE_LENGTH)
}

fn be_value(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

fn negative(sid: u8, nrc: u8) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, sid, nrc]
}

/// In-process programming ECU behind a [`SegmentedTransport`]
#[derive(Clone)]
pub struct MockEcu {
    state: Arc<Mutex<EcuState>>,
}

impl MockEcu {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EcuState::new())),
        }
    }

    pub fn from_config(config: &MockConfig) -> Self {
        Self::new()
            .with_max_block_length(config.max_block_length)
            .with_latency(Duration::from_millis(config.latency_ms))
    }

    /// maxNumberOfBlockLength reported by RequestDownload
    pub fn with_max_block_length(self, max_block_length: u16) -> Self {
        self.state.lock().max_block_length = max_block_length;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    pub fn with_seed(self, seed: [u8; 4]) -> Self {
        self.state.lock().seed = seed;
        self
    }

    pub fn with_algorithm_params(self, params: [u32; 4]) -> Self {
        self.state.lock().algorithm_params = params;
        self
    }

    /// Answer every request for `sid` with `7F sid nrc`
    pub fn fail_service(&self, sid: u8, nrc: NegativeResponseCode) {
        self.state.lock().injected_nrc.insert(sid, nrc.code());
    }

    /// Precede the next `count` answers for `sid` with a response pending
    pub fn respond_pending(&self, sid: u8, count: usize) {
        self.state.lock().injected_pending.insert(sid, count);
    }

    /// Make every following `process` call fail
    pub fn fail_processing(&self, reason: impl Into<String>) {
        self.state.lock().processing_failure = Some(reason.into());
    }

    /// Answer the `count`-th request for `sid`, then fail every following
    /// `process` call
    pub fn fail_processing_after(&self, sid: u8, count: usize, reason: impl Into<String>) {
        self.state.lock().failure_trigger = Some((sid, count, reason.into()));
    }

    /// Record requests for `sid` but never answer them
    pub fn ignore_service(&self, sid: u8) {
        self.state.lock().silent_services.insert(sid);
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().requests.clone()
    }

    pub fn requests_for(&self, sid: u8) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.first() == Some(&sid))
            .cloned()
            .collect()
    }

    /// Blocks committed by RequestTransferExit, in download order
    pub fn memory(&self) -> Vec<MemoryBlock> {
        self.state.lock().memory.clone()
    }

    pub fn session(&self) -> u8 {
        self.state.lock().session
    }

    pub fn unlocked_level(&self) -> Option<u8> {
        self.state.lock().unlocked_level
    }

    pub fn dtc_setting(&self) -> Option<u8> {
        self.state.lock().dtc_setting
    }

    pub fn communication_control(&self) -> Option<(u8, u8)> {
        self.state.lock().communication_control
    }

    pub fn data_identifier(&self, did: u16) -> Option<Vec<u8>> {
        self.state.lock().dids.get(&did).cloned()
    }

    /// Accepted TransferData sequence counters, in order
    pub fn transfer_counters(&self) -> Vec<u8> {
        self.state.lock().transfer_counters.clone()
    }

    /// Started routines with their option records
    pub fn routines(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().routines.clone()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }
}

impl Default for MockEcu {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentedTransport for MockEcu {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.state.lock().inbox.push_back(payload.to_vec());
        Ok(())
    }

    fn process(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.processing_failure {
            return Err(TransportError::ReceiveFailed(reason.clone()));
        }

        while let Some(request) = state.inbox.pop_front() {
            state.requests.push(request.clone());
            let ready_at = Instant::now() + state.latency;

            let Some(response) = state.handle(&request) else {
                continue;
            };

            let sid = request[0];
            if let Some(count) = state.injected_pending.remove(&sid) {
                for _ in 0..count {
                    let pending = negative(sid, NegativeResponseCode::RESPONSE_PENDING.code());
                    state.outbox.push_back((ready_at, pending));
                }
            }
            state.outbox.push_back((ready_at, response));

            let triggered = state.failure_trigger.as_ref().is_some_and(|(trigger, count, _)| {
                *trigger == sid && state.requests.iter().filter(|r| r[0] == sid).count() >= *count
            });
            if triggered {
                let reason = state.failure_trigger.take().map(|(_, _, reason)| reason);
                state.processing_failure = reason;
                break;
            }
        }
        Ok(())
    }

    fn available(&self) -> bool {
        self.state
            .lock()
            .outbox
            .front()
            .is_some_and(|(ready_at, _)| *ready_at <= Instant::now())
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        match state.outbox.front() {
            Some((ready_at, _)) if *ready_at <= Instant::now() => {
                state.outbox.pop_front().map(|(_, payload)| payload)
            }
            _ => None,
        }
    }

    fn reset(&mut self) {
        let mut state = self.state.lock();
        state.inbox.clear();
        state.outbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn exchange(ecu: &mut MockEcu, request: &[u8]) -> Option<Vec<u8>> {
        ecu.send(request).unwrap();
        ecu.process().unwrap();
        ecu.recv()
    }

    fn unlock(ecu: &mut MockEcu, level: u8) {
        let seed = exchange(ecu, &[0x27, level]).unwrap();
        let key = derive_key(level, seed[2..6].try_into().unwrap(), &DEFAULT_ALGORITHM_PARAMS);
        let mut request = vec![0x27, level + 1];
        request.extend_from_slice(&key);
        assert_eq!(exchange(ecu, &request), Some(vec![0x67, level + 1]));
    }

    #[test]
    fn test_security_access_checks_key() {
        let mut ecu = MockEcu::new();

        assert_eq!(exchange(&mut ecu, &[0x27, 0x02, 0, 0, 0, 0]), Some(vec![0x7F, 0x27, 0x24]));
        exchange(&mut ecu, &[0x27, 0x01]);
        assert_eq!(exchange(&mut ecu, &[0x27, 0x02, 0, 0, 0, 1]), Some(vec![0x7F, 0x27, 0x35]));

        unlock(&mut ecu, 0x01);
        assert_eq!(ecu.unlocked_level(), Some(0x01));
        assert_eq!(exchange(&mut ecu, &[0x27, 0x01]), Some(vec![0x67, 0x01, 0, 0, 0, 0]));
    }

    #[test]
    fn test_download_requires_security() {
        let mut ecu = MockEcu::new();
        let request = [0x34, 0x00, 0x44, 0, 0, 0x10, 0, 0, 0, 0, 4];
        assert_eq!(exchange(&mut ecu, &request), Some(vec![0x7F, 0x34, 0x33]));

        unlock(&mut ecu, 0x01);
        assert_eq!(exchange(&mut ecu, &request), Some(vec![0x74, 0x20, 0x04, 0x02]));
    }

    #[test]
    fn test_transfer_enforces_sequence_counter() {
        let mut ecu = MockEcu::new();
        unlock(&mut ecu, 0x01);
        exchange(&mut ecu, &[0x34, 0x00, 0x44, 0, 0, 0x10, 0, 0, 0, 0, 4]);

        assert_eq!(exchange(&mut ecu, &[0x36, 0x02, 0xAA]), Some(vec![0x7F, 0x36, 0x73]));
        assert_eq!(exchange(&mut ecu, &[0x36, 0x01, 0xAA, 0xBB]), Some(vec![0x76, 0x01]));
        assert_eq!(exchange(&mut ecu, &[0x36, 0x02, 0xCC, 0xDD]), Some(vec![0x76, 0x02]));
        assert_eq!(exchange(&mut ecu, &[0x37]), Some(vec![0x77]));

        assert_eq!(ecu.memory(), vec![MemoryBlock::new(0x1000, vec![0xAA, 0xBB, 0xCC, 0xDD])]);
        assert_eq!(ecu.transfer_counters(), vec![1, 2]);
    }

    #[test]
    fn test_suppressed_tester_present_has_no_response() {
        let mut ecu = MockEcu::new();
        assert_eq!(exchange(&mut ecu, &[0x3E, 0x80]), None);
        assert_eq!(exchange(&mut ecu, &[0x3E, 0x00]), Some(vec![0x7E, 0x00]));
    }

    #[test]
    fn test_injected_pending_precedes_answer() {
        let mut ecu = MockEcu::new();
        ecu.respond_pending(0x31, 2);

        ecu.send(&[0x31, 0x01, 0xFF, 0x00]).unwrap();
        ecu.process().unwrap();

        assert_eq!(ecu.recv(), Some(vec![0x7F, 0x31, 0x78]));
        assert_eq!(ecu.recv(), Some(vec![0x7F, 0x31, 0x78]));
        assert_eq!(ecu.recv(), Some(vec![0x71, 0x01, 0xFF, 0x00, 0x00]));
        assert!(!ecu.available());
    }

    #[test]
    fn test_processing_fails_after_trigger() {
        let mut ecu = MockEcu::new();
        ecu.fail_processing_after(0x3E, 2, "bus off");

        assert_eq!(exchange(&mut ecu, &[0x3E, 0x00]), Some(vec![0x7E, 0x00]));
        assert_eq!(exchange(&mut ecu, &[0x3E, 0x00]), Some(vec![0x7E, 0x00]));

        ecu.send(&[0x3E, 0x00]).unwrap();
        assert_eq!(
            ecu.process(),
            Err(TransportError::ReceiveFailed("bus off".to_string()))
        );
        assert_eq!(ecu.requests_for(0x3E).len(), 2);
    }

    #[test]
    fn test_ignored_service_is_recorded_but_unanswered() {
        let mut ecu = MockEcu::new();
        ecu.ignore_service(0x10);

        assert_eq!(exchange(&mut ecu, &[0x10, 0x03]), None);
        assert_eq!(ecu.requests(), vec![vec![0x10, 0x03]]);
        assert_eq!(ecu.session(), 0x01);
    }

    #[test]
    fn test_unknown_service_not_supported() {
        let mut ecu = MockEcu::new();
        assert_eq!(exchange(&mut ecu, &[0x23, 0x00]), Some(vec![0x7F, 0x23, 0x11]));
    }
}
