//! UDS (Unified Diagnostic Services) protocol layer
//!
//! Request builders and response parsers for the services used to diagnose
//! and reprogram an ECU.

pub mod dtc;
mod error;
mod nrc;
mod services;

pub use dtc::{parse_dtc_response, Dtc, DtcStatus};
pub use error::UdsError;
pub use nrc::NegativeResponseCode;
pub use services::UdsService;

/// UDS service IDs
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Positive response SID for a request SID
    pub const fn positive_response(request: u8) -> u8 {
        request.wrapping_add(0x40)
    }
}

/// DiagnosticSessionControl (0x10) session types
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    /// Hard reset - complete shutdown and restart of ECU
    pub const HARD_RESET: u8 = 0x01;
    /// Soft reset - application-level restart
    pub const SOFT_RESET: u8 = 0x03;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
}

/// ControlDTCSetting (0x85) setting types
pub mod dtc_setting_type {
    pub const ON: u8 = 0x01;
    pub const OFF: u8 = 0x02;
}

/// CommunicationControl (0x28) control types
pub mod communication_control {
    pub const ENABLE_RX_AND_TX: u8 = 0x00;
    pub const DISABLE_RX_AND_TX: u8 = 0x03;
}

/// CommunicationControl (0x28) communication types (bit field)
pub mod communication_type {
    pub const NORMAL_AND_NETWORK_MANAGEMENT: u8 = 0x03;
}

/// Well-known data identifiers
pub mod data_identifier {
    pub const ECU_SOFTWARE_VERSION: u16 = 0xF189;
    pub const VIN: u16 = 0xF190;
    pub const ECU_HARDWARE_NUMBER: u16 = 0xF191;
    pub const SUPPLIER_SOFTWARE_VERSION: u16 = 0xF195;
    /// Programming date written before a download, BCD-style digits
    pub const PROGRAMMING_DATE: u16 = 0xF199;
}

/// TesterPresent (0x3E) sub-function bit that suppresses the positive response
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;
