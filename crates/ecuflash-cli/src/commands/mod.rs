//! Command implementations for ecuflash

pub mod diag;
pub mod flash;
pub mod key;
pub mod segment;

pub use diag::{clear_dtc, dtc, read_did, reset, routine, write_did};
pub use flash::flash;
pub use key::key;
pub use segment::segment;

use std::sync::Arc;

use anyhow::{Context, Result};
use ecuflash_uds::transport::create_connection;
use ecuflash_uds::{ConnectionAdapter, DiagnosticSession, ReflashConfig, UdsService};

/// An opened connection plus the diagnostic session on top of it
pub struct Ecu {
    pub connection: Arc<ConnectionAdapter>,
    pub session: Arc<DiagnosticSession>,
}

impl Ecu {
    /// Open the configured transport; with `unlock`, enter the extended
    /// session and unlock that security level before returning
    pub async fn connect(config: &ReflashConfig, unlock: Option<u8>) -> Result<Self> {
        let connection = create_connection(&config.transport, &config.timing)
            .context("Failed to create transport")?;
        connection
            .open()
            .await
            .context("Failed to open connection")?;

        let connection = Arc::new(connection);
        let uds = UdsService::new(connection.clone()).with_timeout(config.timing.request_timeout());
        let session = Arc::new(DiagnosticSession::new(uds, config));
        let ecu = Self { connection, session };

        if let Some(level) = unlock {
            if let Err(e) = ecu.session.unlock_extended(level).await {
                ecu.close().await?;
                return Err(e)
                    .with_context(|| format!("Security access at level 0x{:02X} failed", level));
            }
        }
        Ok(ecu)
    }

    pub fn uds(&self) -> &UdsService {
        self.session.uds()
    }

    pub async fn close(self) -> Result<()> {
        self.session.shutdown().await;
        self.connection
            .close()
            .await
            .context("Failed to close connection")
    }
}

fn parse_hex(value: &str) -> std::result::Result<u64, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", value, e))
}

pub fn parse_u8(value: &str) -> std::result::Result<u8, String> {
    u8::try_from(parse_hex(value)?).map_err(|_| format!("'{}' does not fit in one byte", value))
}

pub fn parse_u16(value: &str) -> std::result::Result<u16, String> {
    u16::try_from(parse_hex(value)?).map_err(|_| format!("'{}' does not fit in two bytes", value))
}

/// Security level given on the command line; seed requests use odd levels
pub fn parse_level(value: &str) -> std::result::Result<u8, String> {
    let level = parse_u8(value)?;
    if level % 2 == 0 {
        return Err(format!("security level 0x{:02X} is not a seed request level", level));
    }
    Ok(level)
}

/// Hex byte string such as "0F" or "0x1234AB"
pub fn parse_bytes(value: &str) -> std::result::Result<Vec<u8>, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(digits).map_err(|e| format!("invalid hex data '{}': {}", value, e))
}

pub fn parse_u32(value: &str) -> std::result::Result<u32, String> {
    u32::try_from(parse_hex(value)?).map_err(|_| format!("'{}' does not fit in four bytes", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_arguments() {
        assert_eq!(parse_u8("0x11"), Ok(0x11));
        assert_eq!(parse_u8("ff"), Ok(0xFF));
        assert_eq!(parse_u16("0XF190"), Ok(0xF190));
        assert_eq!(parse_u32("FFFFFF"), Ok(0xFF_FFFF));
        assert!(parse_u8("0x100").is_err());
        assert!(parse_u16("xyz").is_err());
    }

    #[tokio::test]
    async fn test_unlock_preamble_before_command() {
        let mut config = ReflashConfig::default();
        config.keepalive.enabled = false;

        let locked = Ecu::connect(&config, None).await.unwrap();
        assert!(locked.uds().write_data_by_id(0xF1A8, &[0x0F]).await.is_err());
        locked.close().await.unwrap();

        let ecu = Ecu::connect(&config, Some(0x01)).await.unwrap();
        assert_eq!(ecu.session.current_session(), 0x03);
        assert_eq!(ecu.session.unlocked_level(), Some(0x01));
        ecu.uds().write_data_by_id(0xF1A8, &[0x0F]).await.unwrap();
        assert_eq!(ecu.uds().routine_control_start(0xF102, &[]).await.unwrap(), vec![0x00]);
        ecu.close().await.unwrap();
    }

    #[test]
    fn test_level_and_data_arguments() {
        assert_eq!(parse_level("0x11"), Ok(0x11));
        assert!(parse_level("0x02").is_err());
        assert_eq!(parse_bytes("0F"), Ok(vec![0x0F]));
        assert_eq!(parse_bytes("0x1234ab"), Ok(vec![0x12, 0x34, 0xAB]));
        assert!(parse_bytes("123").is_err());
    }
}
