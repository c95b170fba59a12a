//! Diagnostic session context
//!
//! Tracks the active diagnostic session and security access for one ECU,
//! performs seed/key unlocks and keeps non-default sessions alive with a
//! tester present scheduler.

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{KeepaliveConfig, ReflashConfig, SecurityConfig, SessionConfig};
use crate::scheduler::PeriodicScheduler;
use crate::security::derive_key;
use crate::uds::{UdsError, UdsService};

/// Length of the seeds and keys exchanged in security access
pub const SEED_LENGTH: usize = 4;

/// Session and security state for one ECU
pub struct DiagnosticSession {
    uds: UdsService,
    sessions: SessionConfig,
    security: SecurityConfig,
    keepalive_config: KeepaliveConfig,
    current_session: RwLock<u8>,
    unlocked_level: RwLock<Option<u8>>,
    keepalive: PeriodicScheduler,
}

impl DiagnosticSession {
    /// Must be called from within a tokio runtime (spawns the keepalive task)
    pub fn new(uds: UdsService, config: &ReflashConfig) -> Self {
        let suppress_response = config.keepalive.suppress_response;
        let keepalive_uds = uds.clone();
        let keepalive = PeriodicScheduler::spawn("tester-present", move || {
            let uds = keepalive_uds.clone();
            async move {
                match uds.tester_present(suppress_response).await {
                    Ok(()) => debug!("Tester present sent"),
                    Err(e) => warn!(error = %e, "Tester present failed"),
                }
            }
        });

        Self {
            uds,
            sessions: config.sessions.clone(),
            security: config.security.clone(),
            keepalive_config: config.keepalive.clone(),
            current_session: RwLock::new(config.sessions.default_session),
            unlocked_level: RwLock::new(None),
            keepalive,
        }
    }

    pub fn uds(&self) -> &UdsService {
        &self.uds
    }

    pub fn current_session(&self) -> u8 {
        *self.current_session.read()
    }

    pub fn unlocked_level(&self) -> Option<u8> {
        *self.unlocked_level.read()
    }

    pub fn keepalive_running(&self) -> bool {
        self.keepalive.state().running
    }

    /// Change the diagnostic session (UDS 0x10)
    ///
    /// Security access is re-locked on every transition. The keepalive runs
    /// in every session except the default one.
    pub async fn change_session(&self, session: u8) -> Result<(), UdsError> {
        self.uds.diagnostic_session_control(session).await?;

        *self.current_session.write() = session;
        *self.unlocked_level.write() = None;

        if session == self.sessions.default_session {
            self.stop_keepalive();
        } else {
            self.start_keepalive();
        }

        info!(
            session_id = format!("0x{:02X}", session),
            "Session changed (security re-locked)"
        );
        Ok(())
    }

    /// Seed/key unlock at `level` (the odd seed-request sub-function)
    ///
    /// An all-zero seed means the ECU is already unlocked at that level and
    /// no key is sent.
    pub async fn unlock(&self, level: u8) -> Result<(), UdsError> {
        let seed = self.uds.security_access_request_seed(level).await?;

        if seed.iter().all(|&b| b == 0) {
            debug!(level, "Security already unlocked (zero seed)");
            *self.unlocked_level.write() = Some(level);
            return Ok(());
        }

        let seed: [u8; SEED_LENGTH] = seed.as_slice().try_into().map_err(|_| {
            UdsError::SecurityAccessFailed(format!(
                "Expected a {}-byte seed at level 0x{:02X}, got {} bytes",
                SEED_LENGTH,
                level,
                seed.len()
            ))
        })?;

        let key = derive_key(level, seed, &self.security.algorithm_params);
        debug!(
            level,
            seed = %hex::encode(seed),
            key = %hex::encode(key),
            "Derived security key"
        );

        self.uds.security_access_send_key(level, &key).await?;

        *self.unlocked_level.write() = Some(level);
        info!(level = format!("0x{:02X}", level), "Security access granted");
        Ok(())
    }

    /// Enter the extended session and unlock `level` in it
    ///
    /// Manual diagnostic actions (calibration routines, configuration
    /// writes) need this before the ECU accepts them.
    pub async fn unlock_extended(&self, level: u8) -> Result<(), UdsError> {
        self.change_session(self.sessions.extended_session).await?;
        self.unlock(level).await
    }

    /// Start tester present at the configured interval (no-op if disabled)
    pub fn start_keepalive(&self) {
        if !self.keepalive_config.enabled {
            return;
        }
        self.keepalive.start(self.keepalive_config.interval());
    }

    pub fn stop_keepalive(&self) {
        self.keepalive.stop();
    }

    /// Forget session and security state after an ECU reset
    ///
    /// The ECU comes back in the default session with security locked; no
    /// request is sent since the ECU may still be rebooting.
    pub fn notify_ecu_reset(&self) {
        self.stop_keepalive();
        *self.current_session.write() = self.sessions.default_session;
        *self.unlocked_level.write() = None;
        info!("Session state reset to default (ECU reset)");
    }

    /// Stop the keepalive task for good
    pub async fn shutdown(&self) {
        self.keepalive.terminate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{DEFAULT_ALGORITHM_PARAMS, SIMPLE_MIX_LEVEL};
    use crate::transport::mock::MockEcu;
    use crate::transport::{ConnectionAdapter, TransportAdapter};
    use crate::uds::NegativeResponseCode;
    use std::sync::Arc;

    fn test_config() -> ReflashConfig {
        let mut config = ReflashConfig::default();
        config.keepalive.interval_ms = 20;
        config
    }

    async fn open_session(ecu: &MockEcu, config: &ReflashConfig) -> (DiagnosticSession, Arc<ConnectionAdapter>) {
        let connection = Arc::new(ConnectionAdapter::new(ecu.clone()));
        connection.open().await.unwrap();
        let uds = UdsService::new(connection.clone());
        (DiagnosticSession::new(uds, config), connection)
    }

    #[tokio::test]
    async fn test_unlock_sends_derived_key() {
        let ecu = MockEcu::new().with_seed([0x12, 0x34, 0x56, 0x78]);
        let config = test_config();
        let (session, connection) = open_session(&ecu, &config).await;

        session.change_session(0x03).await.unwrap();
        session.unlock(SIMPLE_MIX_LEVEL).await.unwrap();

        assert_eq!(session.unlocked_level(), Some(SIMPLE_MIX_LEVEL));
        let expected_key = derive_key(SIMPLE_MIX_LEVEL, [0x12, 0x34, 0x56, 0x78], &DEFAULT_ALGORITHM_PARAMS);
        let mut expected_request = vec![0x27, 0x02];
        expected_request.extend_from_slice(&expected_key);
        assert!(ecu.requests().contains(&expected_request));

        session.shutdown().await;
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_seed_skips_key() {
        let ecu = MockEcu::new();
        let config = test_config();
        let (session, connection) = open_session(&ecu, &config).await;

        session.change_session(0x03).await.unwrap();
        session.unlock(SIMPLE_MIX_LEVEL).await.unwrap();
        // second request for the same level gets a zero seed
        session.unlock(SIMPLE_MIX_LEVEL).await.unwrap();

        let key_requests = ecu
            .requests()
            .into_iter()
            .filter(|r| r.starts_with(&[0x27, 0x02]))
            .count();
        assert_eq!(key_requests, 1);

        session.shutdown().await;
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_params_fail_unlock() {
        let ecu = MockEcu::new().with_algorithm_params([1, 2, 3, 4]);
        let config = test_config();
        let (session, connection) = open_session(&ecu, &config).await;

        session.change_session(0x02).await.unwrap();
        let err = session.unlock(0x11).await.unwrap_err();

        assert!(matches!(err, UdsError::NegativeResponse { service_id: 0x27, .. }));
        assert_eq!(session.unlocked_level(), None);

        session.shutdown().await;
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_extended_allows_configuration_write() {
        let ecu = MockEcu::new();
        let config = test_config();
        let (session, connection) = open_session(&ecu, &config).await;

        let err = session.uds().write_data_by_id(0xF1A8, &[0x0F]).await.unwrap_err();
        assert!(matches!(
            err,
            UdsError::NegativeResponse { service_id: 0x2E, nrc } if nrc == NegativeResponseCode::SECURITY_ACCESS_DENIED
        ));

        session.unlock_extended(SIMPLE_MIX_LEVEL).await.unwrap();
        assert_eq!(session.current_session(), 0x03);
        assert_eq!(session.unlocked_level(), Some(SIMPLE_MIX_LEVEL));

        session.uds().write_data_by_id(0xF1A8, &[0x0F]).await.unwrap();
        assert_eq!(ecu.data_identifier(0xF1A8), Some(vec![0x0F]));
        let status = session.uds().routine_control_start(0xF001, &[]).await.unwrap();
        assert_eq!(status, vec![0x00]);

        session.shutdown().await;
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_follows_session() {
        let ecu = MockEcu::new();
        let config = test_config();
        let (session, connection) = open_session(&ecu, &config).await;

        session.change_session(0x03).await.unwrap();
        assert!(session.keepalive_running());
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(ecu.requests().contains(&vec![0x3E, 0x80]));

        session.change_session(0x01).await.unwrap();
        assert!(!session.keepalive_running());
        assert!(connection.is_connected());

        session.shutdown().await;
        connection.close().await.unwrap();
    }
}
