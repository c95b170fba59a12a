//! UDS Negative Response Codes (NRC)

use std::fmt;

/// Negative response code carried in byte 2 of a `7F <sid> <nrc>` response
///
/// Codes without a named constant are still representable; they display as
/// `Unknown(0xNN)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NegativeResponseCode(u8);

impl NegativeResponseCode {
    pub const GENERAL_REJECT: Self = Self(0x10);
    pub const SERVICE_NOT_SUPPORTED: Self = Self(0x11);
    pub const SUB_FUNCTION_NOT_SUPPORTED: Self = Self(0x12);
    pub const INCORRECT_MESSAGE_LENGTH: Self = Self(0x13);
    pub const BUSY_REPEAT_REQUEST: Self = Self(0x21);
    pub const CONDITIONS_NOT_CORRECT: Self = Self(0x22);
    pub const REQUEST_SEQUENCE_ERROR: Self = Self(0x24);
    pub const REQUEST_OUT_OF_RANGE: Self = Self(0x31);
    pub const SECURITY_ACCESS_DENIED: Self = Self(0x33);
    pub const INVALID_KEY: Self = Self(0x35);
    pub const EXCEEDED_NUMBER_OF_ATTEMPTS: Self = Self(0x36);
    pub const REQUIRED_TIME_DELAY_NOT_EXPIRED: Self = Self(0x37);
    pub const UPLOAD_DOWNLOAD_NOT_ACCEPTED: Self = Self(0x70);
    pub const TRANSFER_DATA_SUSPENDED: Self = Self(0x71);
    pub const GENERAL_PROGRAMMING_FAILURE: Self = Self(0x72);
    pub const WRONG_BLOCK_SEQUENCE_COUNTER: Self = Self(0x73);
    pub const RESPONSE_PENDING: Self = Self(0x78);
    pub const SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION: Self = Self(0x7E);
    pub const SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION: Self = Self(0x7F);
    pub const VOLTAGE_TOO_HIGH: Self = Self(0x92);
    pub const VOLTAGE_TOO_LOW: Self = Self(0x93);

    pub const fn code(self) -> u8 {
        self.0
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::GENERAL_REJECT => "GeneralReject",
            Self::SERVICE_NOT_SUPPORTED => "ServiceNotSupported",
            Self::SUB_FUNCTION_NOT_SUPPORTED => "SubFunctionNotSupported",
            Self::INCORRECT_MESSAGE_LENGTH => "IncorrectMessageLengthOrFormat",
            Self::BUSY_REPEAT_REQUEST => "BusyRepeatRequest",
            Self::CONDITIONS_NOT_CORRECT => "ConditionsNotCorrect",
            Self::REQUEST_SEQUENCE_ERROR => "RequestSequenceError",
            Self::REQUEST_OUT_OF_RANGE => "RequestOutOfRange",
            Self::SECURITY_ACCESS_DENIED => "SecurityAccessDenied",
            Self::INVALID_KEY => "InvalidKey",
            Self::EXCEEDED_NUMBER_OF_ATTEMPTS => "ExceededNumberOfAttempts",
            Self::REQUIRED_TIME_DELAY_NOT_EXPIRED => "RequiredTimeDelayNotExpired",
            Self::UPLOAD_DOWNLOAD_NOT_ACCEPTED => "UploadDownloadNotAccepted",
            Self::TRANSFER_DATA_SUSPENDED => "TransferDataSuspended",
            Self::GENERAL_PROGRAMMING_FAILURE => "GeneralProgrammingFailure",
            Self::WRONG_BLOCK_SEQUENCE_COUNTER => "WrongBlockSequenceCounter",
            Self::RESPONSE_PENDING => "ResponsePending",
            Self::SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION => {
                "SubFunctionNotSupportedInActiveSession"
            }
            Self::SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION => "ServiceNotSupportedInActiveSession",
            Self::VOLTAGE_TOO_HIGH => "VoltageTooHigh",
            Self::VOLTAGE_TOO_LOW => "VoltageTooLow",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        nrc.0
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown(0x{:02X})", self.0),
        }
    }
}
