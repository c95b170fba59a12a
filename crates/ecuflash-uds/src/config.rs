//! Reflash configuration
//!
//! Every field has a default, so an empty TOML file is a valid
//! configuration for the stock programming procedure. Numeric identifiers
//! can be written in TOML hex notation (`tx_id = 0x736`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::DEFAULT_ALGORITHM_PARAMS;
use crate::uds::{communication_type, data_identifier, reset_type, session_type};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete reflash configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflashConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub routines: RoutineConfig,
    #[serde(default)]
    pub programming: ProgrammingConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

impl ReflashConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let format = self.programming.address_and_length_format;
        for (name, nibble) in [("address", format & 0x0F), ("length", format >> 4)] {
            if !(1..=4).contains(&nibble) {
                return Err(ConfigError::Invalid(format!(
                    "address_and_length_format 0x{:02X}: {} width {} is outside 1..=4",
                    format, name, nibble
                )));
            }
        }

        for (name, level) in [
            ("application_level", self.security.application_level),
            ("boot_level", self.security.boot_level),
        ] {
            if level % 2 == 0 {
                return Err(ConfigError::Invalid(format!(
                    "security.{} 0x{:02X} must be an odd (seed request) level",
                    name, level
                )));
            }
        }

        if self.keepalive.enabled && self.keepalive.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "keepalive.interval_ms must be non-zero".to_string(),
            ));
        }

        if self.timing.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "timing.request_timeout_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Kernel ISO-TP over SocketCAN (Linux only)
    SocketCan(SocketCanConfig),
    /// In-process simulated ECU
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN ISO-TP addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Transmit CAN ID (tester -> ECU)
    #[serde(default = "default_tx_id")]
    pub tx_id: u32,
    /// Receive CAN ID (ECU -> tester)
    #[serde(default = "default_rx_id")]
    pub rx_id: u32,
    /// Use 29-bit identifiers
    #[serde(default)]
    pub extended_ids: bool,
}

impl Default for SocketCanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            tx_id: default_tx_id(),
            rx_id: default_rx_id(),
            extended_ids: false,
        }
    }
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_tx_id() -> u32 {
    0x736
}

fn default_rx_id() -> u32 {
    0x73E
}

/// Simulated ECU settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    /// maxNumberOfBlockLength reported in RequestDownload responses
    #[serde(default = "default_max_block_length")]
    pub max_block_length: u16,
    /// Delay before each response becomes available
    #[serde(default)]
    pub latency_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            max_block_length: default_max_block_length(),
            latency_ms: 0,
        }
    }
}

fn default_max_block_length() -> u16 {
    0x0402
}

// =============================================================================
// Timing
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Per-request response timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// How long to keep waiting after a response-pending (0x78) reply
    #[serde(default = "default_response_pending_timeout")]
    pub response_pending_timeout_ms: u64,
    /// Pause after ECU reset before talking to the ECU again
    #[serde(default = "default_post_reset_delay")]
    pub post_reset_delay_ms: u64,
    /// Sleep between transport pump iterations
    #[serde(default = "default_pump_interval")]
    pub pump_interval_us: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            response_pending_timeout_ms: default_response_pending_timeout(),
            post_reset_delay_ms: default_post_reset_delay(),
            pump_interval_us: default_pump_interval(),
        }
    }
}

impl TimingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn response_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.response_pending_timeout_ms)
    }

    pub fn post_reset_delay(&self) -> Duration {
        Duration::from_millis(self.post_reset_delay_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_micros(self.pump_interval_us)
    }
}

fn default_request_timeout() -> u64 {
    2000
}

fn default_response_pending_timeout() -> u64 {
    30000
}

fn default_post_reset_delay() -> u64 {
    1000
}

fn default_pump_interval() -> u64 {
    100
}

// =============================================================================
// Sessions and security
// =============================================================================

/// Diagnostic session sub-functions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session")]
    pub default_session: u8,
    #[serde(default = "programming_session")]
    pub programming_session: u8,
    #[serde(default = "extended_session")]
    pub extended_session: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_session: default_session(),
            programming_session: programming_session(),
            extended_session: extended_session(),
        }
    }
}

fn default_session() -> u8 {
    session_type::DEFAULT
}

fn programming_session() -> u8 {
    session_type::PROGRAMMING
}

fn extended_session() -> u8 {
    session_type::EXTENDED
}

/// Security access levels (seed request sub-functions) and key parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Level unlocked in the extended session before programming
    #[serde(default = "default_application_level")]
    pub application_level: u8,
    /// Level unlocked in the programming session
    #[serde(default = "default_boot_level")]
    pub boot_level: u8,
    /// Parameter vector for the block-mix key algorithm
    #[serde(default = "default_algorithm_params")]
    pub algorithm_params: [u32; 4],
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            application_level: default_application_level(),
            boot_level: default_boot_level(),
            algorithm_params: default_algorithm_params(),
        }
    }
}

fn default_application_level() -> u8 {
    0x01
}

fn default_boot_level() -> u8 {
    0x11
}

fn default_algorithm_params() -> [u32; 4] {
    DEFAULT_ALGORITHM_PARAMS
}

// =============================================================================
// Programming procedure
// =============================================================================

/// Routine identifiers used during programming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineConfig {
    /// Run the precondition check after the application-level unlock
    #[serde(default = "default_true")]
    pub check_preconditions_enabled: bool,
    #[serde(default = "default_check_preconditions")]
    pub check_preconditions: u16,
    /// Started with the boot image entry address once the boot image is written
    #[serde(default = "default_activate_boot")]
    pub activate_boot: u16,
    /// Started with an address/size record before each application block
    #[serde(default = "default_prepare_block")]
    pub prepare_block: u16,
    /// Started once after the last application block
    #[serde(default = "default_finalize")]
    pub finalize: u16,
}

impl Default for RoutineConfig {
    fn default() -> Self {
        Self {
            check_preconditions_enabled: true,
            check_preconditions: default_check_preconditions(),
            activate_boot: default_activate_boot(),
            prepare_block: default_prepare_block(),
            finalize: default_finalize(),
        }
    }
}

impl RoutineConfig {
    pub fn check_preconditions(&self) -> Option<u16> {
        self.check_preconditions_enabled
            .then_some(self.check_preconditions)
    }
}

fn default_true() -> bool {
    true
}

fn default_check_preconditions() -> u16 {
    0x0203
}

fn default_activate_boot() -> u16 {
    0x0202
}

fn default_prepare_block() -> u16 {
    0xFF00
}

fn default_finalize() -> u16 {
    0xFF00
}

/// Download and restore parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgrammingConfig {
    #[serde(default = "default_programming_date_did")]
    pub programming_date_did: u16,
    /// RequestDownload dataFormatIdentifier (0x00: no compression/encryption)
    #[serde(default)]
    pub data_format: u8,
    /// RequestDownload addressAndLengthFormatIdentifier
    #[serde(default = "default_address_and_length_format")]
    pub address_and_length_format: u8,
    /// CommunicationControl communicationType
    #[serde(default = "default_communication_type")]
    pub communication_type: u8,
    #[serde(default = "default_reset_type")]
    pub reset_type: u8,
}

impl Default for ProgrammingConfig {
    fn default() -> Self {
        Self {
            programming_date_did: default_programming_date_did(),
            data_format: 0x00,
            address_and_length_format: default_address_and_length_format(),
            communication_type: default_communication_type(),
            reset_type: default_reset_type(),
        }
    }
}

fn default_programming_date_did() -> u16 {
    data_identifier::PROGRAMMING_DATE
}

fn default_address_and_length_format() -> u8 {
    0x44
}

fn default_communication_type() -> u8 {
    communication_type::NORMAL_AND_NETWORK_MANAGEMENT
}

fn default_reset_type() -> u8 {
    reset_type::SOFT_RESET
}

/// Tester present keepalive while in a non-default session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keepalive_interval")]
    pub interval_ms: u64,
    /// Send `3E 80` and expect no response
    #[serde(default = "default_true")]
    pub suppress_response: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_keepalive_interval(),
            suppress_response: true,
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_keepalive_interval() -> u64 {
    2000
}
