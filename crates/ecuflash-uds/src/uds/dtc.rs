//! DTC (Diagnostic Trouble Code) records for ReadDTCInformation (0x19)
//! and ClearDiagnosticInformation (0x14)

use std::fmt;

use super::{service_id, UdsError};

/// ReadDTCInformation (0x19) sub-functions
pub mod sub_function {
    pub const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;
}

/// DTC group for ClearDiagnosticInformation covering every group
pub const ALL_GROUPS: u32 = 0xFFFFFF;

/// DTC status byte bit definitions per ISO 14229-1
pub mod status_bit {
    pub const TEST_FAILED: u8 = 0x01;
    pub const TEST_FAILED_THIS_OPERATION_CYCLE: u8 = 0x02;
    pub const PENDING_DTC: u8 = 0x04;
    pub const CONFIRMED_DTC: u8 = 0x08;
    pub const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR: u8 = 0x10;
    pub const TEST_FAILED_SINCE_LAST_CLEAR: u8 = 0x20;
    pub const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE: u8 = 0x40;
    pub const WARNING_INDICATOR_REQUESTED: u8 = 0x80;

    /// Mask used when reading faults before and after programming
    pub const FAILED_OR_CONFIRMED: u8 = TEST_FAILED | CONFIRMED_DTC;
}

/// DTC status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcStatus(pub u8);

impl DtcStatus {
    pub fn test_failed(self) -> bool {
        self.0 & status_bit::TEST_FAILED != 0
    }

    pub fn pending(self) -> bool {
        self.0 & status_bit::PENDING_DTC != 0
    }

    pub fn confirmed(self) -> bool {
        self.0 & status_bit::CONFIRMED_DTC != 0
    }

    pub fn warning_indicator(self) -> bool {
        self.0 & status_bit::WARNING_INDICATOR_REQUESTED != 0
    }

    /// Currently failing and confirmed
    pub fn is_active(self) -> bool {
        self.test_failed() && self.confirmed()
    }

    pub fn matches_mask(self, mask: u8) -> bool {
        self.0 & mask != 0
    }
}

/// A 24-bit DTC number with its status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtc {
    pub number: u32,
    pub status: DtcStatus,
}

impl Dtc {
    pub fn from_record(record: [u8; 4]) -> Self {
        Self {
            number: u32::from_be_bytes([0, record[0], record[1], record[2]]),
            status: DtcStatus(record[3]),
        }
    }

    /// SAE J2012 style code, e.g. `P0101`, `C0420`, `U0100`
    pub fn code(&self) -> String {
        let [_, high, mid, _] = self.number.to_be_bytes();
        let prefix = match high >> 6 {
            0 => 'P',
            1 => 'C',
            2 => 'B',
            _ => 'U',
        };
        format!(
            "{}{:01X}{:01X}{:02X}",
            prefix,
            (high >> 4) & 0x03,
            high & 0x0F,
            mid
        )
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:06X}) status=0x{:02X}",
            self.code(),
            self.number,
            self.status.0
        )
    }
}

/// Parse a reportDTCByStatusMask (`59 02`) response
///
/// Returns the status availability mask and the DTC records. A trailing
/// partial record is an error.
pub fn parse_dtc_response(response: &[u8]) -> Result<(u8, Vec<Dtc>), UdsError> {
    // 0x59 0x02 [availabilityMask] {[high] [mid] [low] [status]}*
    let expected_sid = service_id::positive_response(service_id::READ_DTC_INFO);
    match response {
        [sid, sub, mask, records @ ..]
            if *sid == expected_sid && *sub == sub_function::REPORT_DTC_BY_STATUS_MASK =>
        {
            if records.len() % 4 != 0 {
                return Err(UdsError::InvalidResponse(format!(
                    "DTC records not a multiple of 4 bytes: {} bytes",
                    records.len()
                )));
            }
            let dtcs = records
                .chunks_exact(4)
                .map(|r| Dtc::from_record([r[0], r[1], r[2], r[3]]))
                .collect();
            Ok((*mask, dtcs))
        }
        _ => Err(UdsError::InvalidResponse(format!(
            "Unexpected ReadDTCInformation response: {}",
            hex::encode(response)
        ))),
    }
}
