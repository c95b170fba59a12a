//! Reflash sequence driver
//!
//! Walks [`ReflashState`] from `Idle` to `Done`, issuing the diagnostic
//! requests of each phase through the session's UDS service. The first
//! failing request moves the machine to `Failed`; nothing else is sent
//! afterwards and the keepalive is stopped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::records::{boot_entry_record, prepare_block_record, programming_date_record};
use super::state::ReflashState;
use super::transfer::TransferSession;
use crate::config::ReflashConfig;
use crate::error::FlashError;
use crate::firmware::MemoryBlock;
use crate::session::DiagnosticSession;
use crate::uds::{communication_control, dtc_setting_type, UdsError};

/// Progress snapshot published while a reflash runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashProgress {
    pub state: ReflashState,
    /// Index of the block being downloaded within the current image
    pub block: Option<usize>,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
}

impl FlashProgress {
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Summary of a completed reflash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflashReport {
    pub boot_blocks: usize,
    pub application_blocks: usize,
    pub bytes_transferred: u64,
    pub transfer_requests: usize,
    pub elapsed: Duration,
}

/// Drives one ECU through the boot and application download
pub struct Reflasher {
    session: Arc<DiagnosticSession>,
    config: ReflashConfig,
    boot_blocks: Vec<MemoryBlock>,
    app_blocks: Vec<MemoryBlock>,
    progress: watch::Sender<FlashProgress>,
    transfer_requests: AtomicUsize,
}

impl Reflasher {
    /// Everything that can be checked without talking to the ECU is checked
    /// here, so a bad image fails before the first request.
    pub fn new(
        session: Arc<DiagnosticSession>,
        config: ReflashConfig,
        boot_blocks: Vec<MemoryBlock>,
        app_blocks: Vec<MemoryBlock>,
    ) -> Result<Self, FlashError> {
        let bytes_total = Self::check_images(&config, &boot_blocks, &app_blocks)?;
        let (progress, _) = watch::channel(FlashProgress {
            bytes_total,
            ..Default::default()
        });

        Ok(Self {
            session,
            config,
            boot_blocks,
            app_blocks,
            progress,
            transfer_requests: AtomicUsize::new(0),
        })
    }

    /// Check that both images can be downloaded with `config`; returns the
    /// number of payload bytes they carry
    pub fn check_images(
        config: &ReflashConfig,
        boot_blocks: &[MemoryBlock],
        app_blocks: &[MemoryBlock],
    ) -> Result<u64, FlashError> {
        if boot_blocks.is_empty() {
            return Err(FlashError::InvalidImage(
                "boot image contains no data blocks".to_string(),
            ));
        }

        let alfi = config.programming.address_and_length_format;
        for block in boot_blocks.iter().chain(app_blocks.iter()) {
            check_download_fields(block, alfi)?;
        }
        for block in app_blocks {
            prepare_block_record(block)?;
        }

        Ok(boot_blocks
            .iter()
            .chain(app_blocks.iter())
            .map(|b| u64::from(b.size()))
            .sum())
    }

    /// Receiver of progress snapshots, updated on every phase and chunk
    pub fn subscribe(&self) -> watch::Receiver<FlashProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> FlashProgress {
        self.progress.borrow().clone()
    }

    /// Run the whole sequence from `Idle`
    ///
    /// A failed run leaves the ECU wherever it stopped; calling `run` again
    /// restarts from the pre-programming phase.
    pub async fn run(&mut self) -> Result<ReflashReport, FlashError> {
        let started = Instant::now();
        self.transfer_requests.store(0, Ordering::SeqCst);
        self.progress.send_modify(|p| {
            p.state = ReflashState::Idle;
            p.block = None;
            p.bytes_transferred = 0;
        });

        let mut state = ReflashState::Idle.next(Ok(()));
        let mut failure = None;
        while !state.is_terminal() {
            self.enter(state);

            let outcome = match state {
                ReflashState::PreProgram => self.pre_program().await,
                ReflashState::DownloadBoot => self.download_image(state, &self.boot_blocks).await,
                ReflashState::ActivateBoot => self.activate_boot().await,
                ReflashState::DownloadApplication => self.download_application().await,
                ReflashState::PostProgram => self.post_program().await,
                ReflashState::Idle | ReflashState::Done | ReflashState::Failed => Ok(()),
            };

            state = state.next(outcome.as_ref().map(|_| ()).map_err(|_| ()));
            if let Err(e) = outcome {
                failure = Some(e);
            }
        }

        if let Some(e) = failure {
            self.fail(state, &e);
            return Err(e);
        }
        self.enter(state);

        let report = ReflashReport {
            boot_blocks: self.boot_blocks.len(),
            application_blocks: self.app_blocks.len(),
            bytes_transferred: self.progress.borrow().bytes_transferred,
            transfer_requests: self.transfer_requests.load(Ordering::SeqCst),
            elapsed: started.elapsed(),
        };
        info!(
            bytes = report.bytes_transferred,
            requests = report.transfer_requests,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Reflash complete"
        );
        Ok(report)
    }

    fn enter(&self, state: ReflashState) {
        info!(%state, "Reflash phase");
        self.progress.send_modify(|p| {
            p.state = state;
            p.block = None;
        });
    }

    fn fail(&self, state: ReflashState, err: &FlashError) {
        error!(error = %err, %state, "Reflash aborted");
        self.session.stop_keepalive();
        self.progress.send_modify(|p| p.state = state);
    }

    async fn pre_program(&self) -> Result<(), FlashError> {
        let at = uds_error(ReflashState::PreProgram);
        let uds = self.session.uds();
        let sessions = &self.config.sessions;
        let security = &self.config.security;
        let programming = &self.config.programming;

        self.session
            .change_session(sessions.extended_session)
            .await
            .map_err(&at)?;
        self.session
            .unlock(security.application_level)
            .await
            .map_err(&at)?;

        if let Some(routine) = self.config.routines.check_preconditions() {
            let status = uds.routine_control_start(routine, &[]).await.map_err(&at)?;
            debug!(routine = format!("0x{:04X}", routine), status = %hex::encode(&status), "Preconditions checked");
        }

        uds.control_dtc_setting(dtc_setting_type::OFF)
            .await
            .map_err(&at)?;
        uds.communication_control(
            communication_control::DISABLE_RX_AND_TX,
            programming.communication_type,
        )
        .await
        .map_err(&at)?;

        self.session
            .change_session(sessions.programming_session)
            .await
            .map_err(&at)?;
        self.session
            .unlock(security.boot_level)
            .await
            .map_err(&at)?;

        let date = programming_date_record(&chrono::Local::now());
        uds.write_data_by_id(programming.programming_date_did, &date)
            .await
            .map_err(&at)?;
        debug!(date = %hex::encode(date), "Programming date written");
        Ok(())
    }

    async fn activate_boot(&self) -> Result<(), FlashError> {
        let at = uds_error(ReflashState::ActivateBoot);
        let entry = &self.boot_blocks[0];
        let routine = self.config.routines.activate_boot;

        info!(
            routine = format!("0x{:04X}", routine),
            address = format!("0x{:08X}", entry.address),
            "Activating boot image"
        );
        self.session
            .uds()
            .routine_control_start(routine, &boot_entry_record(entry))
            .await
            .map_err(&at)?;
        Ok(())
    }

    async fn download_application(&self) -> Result<(), FlashError> {
        let state = ReflashState::DownloadApplication;
        let at = uds_error(state);
        let routine = self.config.routines.prepare_block;

        for (index, block) in self.app_blocks.iter().enumerate() {
            if block.is_empty() {
                continue;
            }
            let record = prepare_block_record(block)?;
            debug!(block = index, record = %hex::encode(record), "Preparing block");
            self.session
                .uds()
                .routine_control_start(routine, &record)
                .await
                .map_err(&at)?;

            self.download_block(state, index, block).await?;
        }
        Ok(())
    }

    async fn download_image(
        &self,
        state: ReflashState,
        blocks: &[MemoryBlock],
    ) -> Result<(), FlashError> {
        for (index, block) in blocks.iter().enumerate() {
            if block.is_empty() {
                continue;
            }
            self.download_block(state, index, block).await?;
        }
        Ok(())
    }

    /// RequestDownload, the TransferData chunks, then RequestTransferExit
    async fn download_block(
        &self,
        state: ReflashState,
        index: usize,
        block: &MemoryBlock,
    ) -> Result<(), FlashError> {
        let at = uds_error(state);
        let uds = self.session.uds();
        let programming = &self.config.programming;

        let max_block_length = uds
            .request_download(
                programming.data_format,
                programming.address_and_length_format,
                block.address,
                block.size(),
            )
            .await
            .map_err(&at)?;

        let mut transfer = TransferSession::new(block, max_block_length).map_err(&at)?;
        info!(
            block = index,
            address = format!("0x{:08X}", block.address),
            size = block.size(),
            max_block_length,
            chunks = transfer.chunk_count(),
            "Downloading block"
        );

        self.progress.send_modify(|p| p.block = Some(index));
        while let Some((sequence, chunk)) = transfer.next_chunk() {
            uds.transfer_data(sequence, chunk).await.map_err(|source| {
                debug!(block = index, sequence, "TransferData rejected");
                at(source)
            })?;
            self.transfer_requests.fetch_add(1, Ordering::SeqCst);
            self.progress
                .send_modify(|p| p.bytes_transferred += chunk.len() as u64);
        }

        uds.request_transfer_exit().await.map_err(&at)?;
        debug!(block = index, "Transfer exit acknowledged");
        Ok(())
    }

    async fn post_program(&self) -> Result<(), FlashError> {
        let at = uds_error(ReflashState::PostProgram);
        let uds = self.session.uds();
        let sessions = &self.config.sessions;
        let programming = &self.config.programming;

        uds.routine_control_start(self.config.routines.finalize, &[])
            .await
            .map_err(&at)?;

        uds.ecu_reset(programming.reset_type).await.map_err(&at)?;
        self.session.notify_ecu_reset();
        let delay = self.config.timing.post_reset_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for ECU restart");
            tokio::time::sleep(delay).await;
        }

        self.session
            .change_session(sessions.extended_session)
            .await
            .map_err(&at)?;
        uds.communication_control(
            communication_control::ENABLE_RX_AND_TX,
            programming.communication_type,
        )
        .await
        .map_err(&at)?;
        uds.control_dtc_setting(dtc_setting_type::ON)
            .await
            .map_err(&at)?;
        self.session
            .change_session(sessions.default_session)
            .await
            .map_err(&at)?;
        Ok(())
    }
}

fn uds_error(state: ReflashState) -> impl Fn(UdsError) -> FlashError {
    move |source| FlashError::Uds { state, source }
}

/// Address and size must fit the widths announced in RequestDownload
fn check_download_fields(block: &MemoryBlock, alfi: u8) -> Result<(), FlashError> {
    let fits = |value: u32, width: u8| width >= 4 || u64::from(value) < 1u64 << (8 * u32::from(width));

    if !fits(block.address, alfi & 0x0F) || !fits(block.size(), alfi >> 4) {
        return Err(FlashError::InvalidImage(format!(
            "block {} does not fit address/length format 0x{:02X}",
            block, alfi
        )));
    }
    Ok(())
}
