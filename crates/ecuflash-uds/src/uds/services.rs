//! UDS service layer: request builders and response parsers

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::dtc::{self, Dtc};
use super::{routine_sub_function, service_id, NegativeResponseCode, UdsError};
use crate::transport::TransportAdapter;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// UDS service layer over a request/response transport
#[derive(Clone)]
pub struct UdsService {
    transport: Arc<dyn TransportAdapter>,
    timeout: Duration,
}

impl UdsService {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send a request and return its positive response
    ///
    /// Response-pending handling lives in the transport; any negative
    /// response reaching this layer is final.
    async fn send_request(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        let request_sid = *request
            .first()
            .ok_or_else(|| UdsError::InvalidRequest("Empty request".to_string()))?;

        debug!(
            service_id = format!("0x{:02X}", request_sid),
            request = %hex::encode(request),
            "UDS request"
        );

        let response = self.transport.send_receive(request, self.timeout).await?;

        debug!(
            service_id = format!("0x{:02X}", request_sid),
            response = %hex::encode(&response),
            "UDS response"
        );

        match response.as_slice() {
            [service_id::NEGATIVE_RESPONSE, sid, nrc, ..] => Err(UdsError::NegativeResponse {
                service_id: *sid,
                nrc: NegativeResponseCode::from(*nrc),
            }),
            [service_id::NEGATIVE_RESPONSE, ..] => Err(UdsError::InvalidResponse(
                "Negative response too short".to_string(),
            )),
            [sid, ..] if *sid == service_id::positive_response(request_sid) => Ok(response),
            [sid, ..] => Err(UdsError::InvalidResponse(format!(
                "Unexpected response SID 0x{:02X} for request 0x{:02X}",
                sid, request_sid
            ))),
            [] => Err(UdsError::InvalidResponse("Empty response".to_string())),
        }
    }

    /// Diagnostic Session Control (0x10)
    pub async fn diagnostic_session_control(&self, session: u8) -> Result<Vec<u8>, UdsError> {
        let request = [service_id::DIAGNOSTIC_SESSION_CONTROL, session];
        let response = self.send_request(&request).await?;

        if response.get(1) != Some(&session) {
            return Err(UdsError::InvalidResponse(format!(
                "Session control echoed {:?}, expected 0x{:02X}",
                response.get(1),
                session
            )));
        }

        Ok(response)
    }

    /// ECU Reset (0x11); returns the power-down time if the ECU reports one
    pub async fn ecu_reset(&self, reset_type: u8) -> Result<Option<u8>, UdsError> {
        let request = [service_id::ECU_RESET, reset_type];
        let response = self.send_request(&request).await?;

        if response.len() < 2 {
            return Err(UdsError::InvalidResponse(
                "ECUReset response too short".to_string(),
            ));
        }

        Ok(response.get(2).copied())
    }

    /// Tester Present (0x3E)
    pub async fn tester_present(&self, suppress_response: bool) -> Result<(), UdsError> {
        let sub_function = if suppress_response {
            super::SUPPRESS_POSITIVE_RESPONSE
        } else {
            0x00
        };
        let request = [service_id::TESTER_PRESENT, sub_function];

        if suppress_response {
            self.transport.send(&request).await?;
        } else {
            self.send_request(&request).await?;
        }
        Ok(())
    }

    /// Security Access - Request Seed (0x27, odd sub-function)
    pub async fn security_access_request_seed(&self, level: u8) -> Result<Vec<u8>, UdsError> {
        let request = [service_id::SECURITY_ACCESS, level];
        let response = self.send_request(&request).await?;

        // Response: 0x67 [level] [seed...]
        if response.len() < 3 || response[1] != level {
            return Err(UdsError::InvalidResponse(format!(
                "Malformed seed response: {}",
                hex::encode(&response)
            )));
        }

        Ok(response[2..].to_vec())
    }

    /// Security Access - Send Key (0x27, even sub-function `level + 1`)
    pub async fn security_access_send_key(&self, level: u8, key: &[u8]) -> Result<(), UdsError> {
        let mut request = vec![service_id::SECURITY_ACCESS, level.wrapping_add(1)];
        request.extend_from_slice(key);

        self.send_request(&request).await?;
        Ok(())
    }

    /// Control DTC Setting (0x85)
    pub async fn control_dtc_setting(&self, setting_type: u8) -> Result<(), UdsError> {
        let request = [service_id::CONTROL_DTC_SETTING, setting_type];
        self.send_request(&request).await?;
        Ok(())
    }

    /// Communication Control (0x28)
    pub async fn communication_control(
        &self,
        control_type: u8,
        communication_type: u8,
    ) -> Result<(), UdsError> {
        let request = [
            service_id::COMMUNICATION_CONTROL,
            control_type,
            communication_type,
        ];
        self.send_request(&request).await?;
        Ok(())
    }

    /// Read Data By Identifier (0x22) for a single DID; returns the data bytes
    pub async fn read_data_by_id(&self, did: u16) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![service_id::READ_DATA_BY_ID];
        request.extend_from_slice(&did.to_be_bytes());

        let response = self.send_request(&request).await?;

        // Response: 0x62 [didHi] [didLo] [data...]
        if response.len() < 3 || response[1..3] != did.to_be_bytes() {
            return Err(UdsError::InvalidResponse(format!(
                "ReadDataByIdentifier response does not echo DID 0x{:04X}",
                did
            )));
        }

        Ok(response[3..].to_vec())
    }

    /// Write Data By Identifier (0x2E)
    pub async fn write_data_by_id(&self, did: u16, data: &[u8]) -> Result<(), UdsError> {
        let mut request = vec![service_id::WRITE_DATA_BY_ID];
        request.extend_from_slice(&did.to_be_bytes());
        request.extend_from_slice(data);

        self.send_request(&request).await?;
        Ok(())
    }

    /// Start a routine (0x31 sub-function 0x01); returns the routine status record
    pub async fn routine_control_start(
        &self,
        routine_id: u16,
        params: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![
            service_id::ROUTINE_CONTROL,
            routine_sub_function::START_ROUTINE,
        ];
        request.extend_from_slice(&routine_id.to_be_bytes());
        request.extend_from_slice(params);

        let response = self.send_request(&request).await?;

        // Response: 0x71 [sub-function] [routineIdHi] [routineIdLo] [routineInfo...]
        if response.len() < 4 || response[2..4] != routine_id.to_be_bytes() {
            return Err(UdsError::InvalidResponse(format!(
                "RoutineControl response does not echo routine 0x{:04X}",
                routine_id
            )));
        }

        Ok(response[4..].to_vec())
    }

    /// Request Download (0x34); returns the ECU's maximum block length
    ///
    /// The address-and-length format identifier selects how many bytes
    /// encode the address (low nibble) and the size (high nibble).
    pub async fn request_download(
        &self,
        data_format: u8,
        address_and_length_format: u8,
        address: u32,
        size: u32,
    ) -> Result<u16, UdsError> {
        let address_width = (address_and_length_format & 0x0F) as usize;
        let size_width = (address_and_length_format >> 4) as usize;

        let mut request = vec![
            service_id::REQUEST_DOWNLOAD,
            data_format,
            address_and_length_format,
        ];
        request.extend_from_slice(&encode_field(address, address_width, "memory address")?);
        request.extend_from_slice(&encode_field(size, size_width, "memory size")?);

        let response = self.send_request(&request).await?;

        // Response: 0x74 [lengthFormat] [maxBlockLength...]
        if response.len() < 2 {
            return Err(UdsError::InvalidResponse(
                "RequestDownload response too short".to_string(),
            ));
        }

        let num_bytes = (response[1] >> 4) as usize;
        if num_bytes == 0 || response.len() < 2 + num_bytes {
            return Err(UdsError::InvalidResponse(
                "RequestDownload response missing maxBlockLength".to_string(),
            ));
        }

        let max_block_length = response[2..2 + num_bytes]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

        Ok(u16::try_from(max_block_length).unwrap_or(u16::MAX))
    }

    /// Transfer Data (0x36); the positive response must echo the counter
    pub async fn transfer_data(&self, block_counter: u8, data: &[u8]) -> Result<(), UdsError> {
        let mut request = Vec::with_capacity(data.len() + 2);
        request.push(service_id::TRANSFER_DATA);
        request.push(block_counter);
        request.extend_from_slice(data);

        let response = self.send_request(&request).await?;

        match response.get(1) {
            Some(echo) if *echo == block_counter => Ok(()),
            other => Err(UdsError::InvalidResponse(format!(
                "TransferData echoed counter {:?}, expected {}",
                other, block_counter
            ))),
        }
    }

    /// Request Transfer Exit (0x37)
    pub async fn request_transfer_exit(&self) -> Result<Vec<u8>, UdsError> {
        let response = self
            .send_request(&[service_id::REQUEST_TRANSFER_EXIT])
            .await?;
        Ok(response[1..].to_vec())
    }

    /// Read DTC Information - report DTCs by status mask (0x19 0x02)
    pub async fn read_dtc_by_status_mask(
        &self,
        status_mask: u8,
    ) -> Result<(u8, Vec<Dtc>), UdsError> {
        let request = [
            service_id::READ_DTC_INFO,
            dtc::sub_function::REPORT_DTC_BY_STATUS_MASK,
            status_mask,
        ];
        let response = self.send_request(&request).await?;
        dtc::parse_dtc_response(&response)
    }

    /// Clear Diagnostic Information (0x14); the group is 3 bytes
    pub async fn clear_dtc(&self, group: u32) -> Result<(), UdsError> {
        let mut request = vec![service_id::CLEAR_DIAGNOSTIC_INFO];
        request.extend_from_slice(&encode_field(group, 3, "DTC group")?);
        self.send_request(&request).await?;
        Ok(())
    }
}

/// Big-endian encoding of `value` in exactly `width` bytes
fn encode_field(value: u32, width: usize, what: &str) -> Result<Vec<u8>, UdsError> {
    if !(1..=4).contains(&width) {
        return Err(UdsError::InvalidRequest(format!(
            "{} width {} is outside 1..=4 bytes",
            what, width
        )));
    }
    if width < 4 && value >> (8 * width) != 0 {
        return Err(UdsError::InvalidRequest(format!(
            "{} 0x{:X} does not fit in {} bytes",
            what, value, width
        )));
    }
    Ok(value.to_be_bytes()[4 - width..].to_vec())
}
