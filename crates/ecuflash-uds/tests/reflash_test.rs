//! Full-stack reflash tests
//!
//! Reflasher -> DiagnosticSession -> UdsService -> ConnectionAdapter ->
//! simulated ECU, all in process.

use std::sync::Arc;
use std::time::Duration;

use ecuflash_uds::flash::{FlashProgress, ReflashState, Reflasher};
use ecuflash_uds::transport::mock::MockEcu;
use ecuflash_uds::transport::{
    ConnectionAdapter, TransportAdapter, TransportError, MAX_TRANSFER_UNIT,
};
use ecuflash_uds::{
    segment, DiagnosticSession, FlashError, MemoryBlock, NegativeResponseCode, ReflashConfig,
    UdsError, UdsService,
};
use pretty_assertions::assert_eq;

struct Harness {
    ecu: MockEcu,
    connection: Arc<ConnectionAdapter>,
    session: Arc<DiagnosticSession>,
    config: ReflashConfig,
}

impl Harness {
    async fn new(ecu: MockEcu) -> Self {
        let mut config = ReflashConfig::default();
        config.keepalive.enabled = false;
        config.timing.post_reset_delay_ms = 0;
        Self::with_config(ecu, config).await
    }

    async fn with_config(ecu: MockEcu, config: ReflashConfig) -> Self {
        let connection = Arc::new(
            ConnectionAdapter::new(ecu.clone()).with_pump_interval(Duration::from_micros(50)),
        );
        connection.open().await.unwrap();

        let uds = UdsService::new(connection.clone()).with_timeout(Duration::from_millis(500));
        let session = Arc::new(DiagnosticSession::new(uds, &config));

        Self {
            ecu,
            connection,
            session,
            config,
        }
    }

    fn reflasher(&self, boot: Vec<MemoryBlock>, app: Vec<MemoryBlock>) -> Reflasher {
        Reflasher::new(self.session.clone(), self.config.clone(), boot, app).unwrap()
    }

    async fn shutdown(self) {
        self.session.shutdown().await;
        self.connection.close().await.unwrap();
    }
}

fn block(address: u32, len: usize, seed: u8) -> MemoryBlock {
    MemoryBlock::new(address, (0..len).map(|i| seed.wrapping_add(i as u8)).collect())
}

/// Requests for the download services only
fn download_traffic(ecu: &MockEcu) -> Vec<Vec<u8>> {
    ecu.requests()
        .into_iter()
        .filter(|r| matches!(r[0], 0x34 | 0x36 | 0x37))
        .collect()
}

#[tokio::test]
async fn test_full_sequence_request_order() {
    let harness = Harness::new(MockEcu::new()).await;
    let boot = vec![block(0x0000_4000, 16, 0x10)];
    let app = vec![block(0x0001_0000, 32, 0x80)];

    let report = harness.reflasher(boot.clone(), app.clone()).run().await.unwrap();

    let expected: Vec<&[u8]> = vec![
        &[0x10, 0x03],
        &[0x27, 0x01],
        &[0x27, 0x02],
        &[0x31, 0x01, 0x02, 0x03],
        &[0x85, 0x02],
        &[0x28, 0x03, 0x03],
        &[0x10, 0x02],
        &[0x27, 0x11],
        &[0x27, 0x12],
        &[0x2E, 0xF1, 0x99],
        &[0x34, 0x00, 0x44],
        &[0x36, 0x01],
        &[0x37],
        &[0x31, 0x01, 0x02, 0x02, 0x00, 0x00, 0x40, 0x00],
        &[0x31, 0x01, 0xFF, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20],
        &[0x34, 0x00, 0x44],
        &[0x36, 0x01],
        &[0x37],
        &[0x31, 0x01, 0xFF, 0x00],
        &[0x11, 0x03],
        &[0x10, 0x03],
        &[0x28, 0x00, 0x03],
        &[0x85, 0x01],
        &[0x10, 0x01],
    ];
    let requests = harness.ecu.requests();
    assert_eq!(requests.len(), expected.len(), "requests: {:02X?}", requests);
    for (request, prefix) in requests.iter().zip(expected) {
        assert!(
            request.starts_with(prefix),
            "expected {:02X?}, got {:02X?}",
            prefix,
            request
        );
    }

    assert_eq!(harness.ecu.memory(), vec![boot[0].clone(), app[0].clone()]);
    assert_eq!(harness.ecu.resets(), 1);
    assert_eq!(harness.ecu.session(), 0x01);
    assert_eq!(harness.ecu.dtc_setting(), Some(0x01));
    assert_eq!(harness.ecu.communication_control(), Some((0x00, 0x03)));
    assert_eq!(harness.ecu.data_identifier(0xF199).map(|d| d.len()), Some(7));

    assert_eq!(report.boot_blocks, 1);
    assert_eq!(report.application_blocks, 1);
    assert_eq!(report.bytes_transferred, 48);
    assert_eq!(report.transfer_requests, 2);
    assert_eq!(harness.session.current_session(), 0x01);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_each_small_block_is_one_transfer() {
    let harness = Harness::new(MockEcu::new().with_max_block_length(6)).await;
    let boot = vec![
        MemoryBlock::new(0x1000, vec![0xA0, 0xA1, 0xA2, 0xA3]),
        MemoryBlock::new(0x2000, vec![0xB0, 0xB1, 0xB2, 0xB3]),
    ];

    harness.reflasher(boot, Vec::new()).run().await.unwrap();

    assert_eq!(
        download_traffic(&harness.ecu),
        vec![
            vec![0x34, 0x00, 0x44, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x04],
            vec![0x36, 0x01, 0xA0, 0xA1, 0xA2, 0xA3],
            vec![0x37],
            vec![0x34, 0x00, 0x44, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x04],
            vec![0x36, 0x01, 0xB0, 0xB1, 0xB2, 0xB3],
            vec![0x37],
        ]
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_sequence_counter_wraps_to_one() {
    let harness = Harness::new(MockEcu::new().with_max_block_length(6)).await;
    let boot = vec![block(0x1000, 4, 0)];
    let app = vec![block(0x0002_0000, 300 * 4, 0x55)];

    harness.reflasher(boot, app.clone()).run().await.unwrap();

    let app_counters: Vec<u8> = harness.ecu.transfer_counters()[1..].to_vec();
    let expected: Vec<u8> = (1..=255).chain(1..=45).collect();
    assert_eq!(app_counters, expected);
    assert!(!app_counters.contains(&0));
    assert_eq!(harness.ecu.memory()[1], app[0]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_large_block_length_is_capped_at_transfer_unit() {
    let harness = Harness::new(MockEcu::new().with_max_block_length(0x2000)).await;
    let boot = vec![block(0x1000, 6000, 0x21)];

    let report = harness.reflasher(boot.clone(), Vec::new()).run().await.unwrap();

    let transfers = harness.ecu.requests_for(0x36);
    let lengths: Vec<usize> = transfers.iter().map(|r| r.len()).collect();
    assert_eq!(lengths, vec![MAX_TRANSFER_UNIT, 6000 - (MAX_TRANSFER_UNIT - 2) + 2]);
    assert_eq!(harness.ecu.transfer_counters(), vec![1, 2]);
    assert_eq!(harness.ecu.memory(), boot);
    assert_eq!(report.bytes_transferred, 6000);
    assert_eq!(report.transfer_requests, 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_download_rejection_stops_all_transfers() {
    let ecu = MockEcu::new();
    ecu.fail_service(0x34, NegativeResponseCode::UPLOAD_DOWNLOAD_NOT_ACCEPTED);
    let harness = Harness::new(ecu).await;
    let boot = vec![block(0x1000, 64, 0), block(0x2000, 64, 0)];
    let app = vec![block(0x0001_0000, 64, 0)];

    let mut reflasher = harness.reflasher(boot, app);
    let progress = reflasher.subscribe();
    let err = reflasher.run().await.unwrap_err();

    match err {
        FlashError::Uds {
            state,
            source: UdsError::NegativeResponse { service_id, nrc },
        } => {
            assert_eq!(state, ReflashState::DownloadBoot);
            assert_eq!(service_id, 0x34);
            assert_eq!(nrc, NegativeResponseCode::UPLOAD_DOWNLOAD_NOT_ACCEPTED);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(harness.ecu.requests_for(0x36).is_empty());
    assert_eq!(harness.ecu.requests_for(0x34).len(), 1);
    // nothing after the rejected request
    assert_eq!(harness.ecu.requests().last().map(|r| r[0]), Some(0x34));
    assert_eq!(progress.borrow().state, ReflashState::Failed);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_wrong_algorithm_params_fail_pre_programming() {
    let harness = Harness::new(MockEcu::new().with_algorithm_params([1, 2, 3, 4])).await;

    let err = harness
        .reflasher(vec![block(0x1000, 8, 0)], Vec::new())
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.state(), Some(ReflashState::PreProgram));
    assert!(harness.ecu.requests_for(0x34).is_empty());
    assert_eq!(harness.ecu.requests().last().map(|r| r[..2].to_vec()), Some(vec![0x27, 0x12]));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_pump_crash_during_download_fails_reflash() {
    let ecu = MockEcu::new().with_max_block_length(34);
    ecu.fail_processing_after(0x36, 5, "bus off");
    let harness = Harness::new(ecu).await;

    let mut reflasher = harness.reflasher(vec![block(0x1000, 320, 0)], Vec::new());
    let progress = reflasher.subscribe();
    let err = reflasher.run().await.unwrap_err();

    match err {
        FlashError::Uds {
            state,
            source: UdsError::Transport(TransportError::PumpStopped(_)),
        } => assert_eq!(state, ReflashState::DownloadBoot),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(progress.borrow().state, ReflashState::Failed);
    assert_eq!(progress.borrow().bytes_transferred, 5 * 32);
    assert!(!harness.connection.is_connected());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.ecu.requests_for(0x36).len(), 5);
    assert!(harness.ecu.requests_for(0x37).is_empty());
    assert!(harness.ecu.memory().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_silent_ecu_times_out() {
    let ecu = MockEcu::new();
    ecu.ignore_service(0x37);
    let harness = Harness::new(ecu).await;

    let boot = vec![block(0x1000, 16, 0)];
    let app = vec![block(0x0001_0000, 16, 0)];
    let mut reflasher = harness.reflasher(boot, app);
    let progress = reflasher.subscribe();
    let err = reflasher.run().await.unwrap_err();

    assert!(
        matches!(
            err,
            FlashError::Uds {
                state: ReflashState::DownloadBoot,
                source: UdsError::Timeout,
            }
        ),
        "unexpected error: {err}"
    );
    assert_eq!(progress.borrow().state, ReflashState::Failed);
    assert_eq!(harness.ecu.requests().last(), Some(&vec![0x37]));
    // only the preconditions routine ran; the application was never prepared
    assert_eq!(harness.ecu.requests_for(0x31).len(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_response_pending_is_waited_out() {
    let ecu = MockEcu::new();
    ecu.respond_pending(0x31, 3);
    let harness = Harness::new(ecu).await;

    let result = harness
        .reflasher(vec![block(0x1000, 8, 0)], Vec::new())
        .run()
        .await;

    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(harness.ecu.routines().len(), 3);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_progress_reaches_done() {
    let harness = Harness::new(MockEcu::new().with_max_block_length(34)).await;
    let boot = vec![block(0x1000, 100, 0)];
    let app = vec![block(0x0001_0000, 200, 0), block(0x0001_1000, 50, 0)];

    let mut reflasher = harness.reflasher(boot, app);
    let mut progress = reflasher.subscribe();
    assert_eq!(progress.borrow().bytes_total, 350);

    let watcher = tokio::spawn(async move {
        let mut states = Vec::new();
        while progress.changed().await.is_ok() {
            let state = progress.borrow().state;
            if states.last() != Some(&state) {
                states.push(state);
            }
            if state.is_terminal() {
                break;
            }
        }
        states
    });

    reflasher.run().await.unwrap();
    assert_eq!(
        reflasher.progress(),
        FlashProgress {
            state: ReflashState::Done,
            block: None,
            bytes_transferred: 350,
            bytes_total: 350,
        }
    );

    let states = watcher.await.unwrap();
    assert_eq!(states.last(), Some(&ReflashState::Done));
    assert!(!states.contains(&ReflashState::Failed));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_keepalive_runs_during_reflash() {
    let mut config = ReflashConfig::default();
    config.keepalive.interval_ms = 5;
    config.timing.post_reset_delay_ms = 20;
    let harness =
        Harness::with_config(MockEcu::new().with_latency(Duration::from_millis(2)), config).await;

    harness
        .reflasher(vec![block(0x1000, 512, 0)], vec![block(0x0001_0000, 512, 0)])
        .run()
        .await
        .unwrap();

    assert!(!harness.ecu.requests_for(0x3E).is_empty());
    assert!(!harness.session.keepalive_running());
    assert_eq!(harness.ecu.memory().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_image_without_boot_blocks_is_rejected() {
    let harness = Harness::new(MockEcu::new()).await;

    let result = Reflasher::new(
        harness.session.clone(),
        harness.config.clone(),
        Vec::new(),
        vec![block(0x1000, 8, 0)],
    );

    assert!(matches!(result, Err(FlashError::InvalidImage(_))));
    assert!(harness.ecu.requests().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_segmented_srecord_image_is_flashed() {
    let boot_image = "\
S00600004844521B
S20800400001020304AD
S2080040040506070899
S804000000FB
";
    let boot = segment(boot_image).unwrap();
    assert_eq!(boot, vec![MemoryBlock::new(0x4000, vec![1, 2, 3, 4, 5, 6, 7, 8])]);

    let harness = Harness::new(MockEcu::new()).await;
    harness.reflasher(boot.clone(), Vec::new()).run().await.unwrap();

    assert_eq!(harness.ecu.memory(), boot);

    harness.shutdown().await;
}
