//! ecuflash-uds - UDS reflash engine for CAN-attached ECUs
//!
//! This crate drives the reprogramming sequence of an ECU over a segmented
//! (ISO-TP) transport: firmware image segmentation, seed/key security
//! access, chunked memory download and the session bookkeeping around it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Reflasher                             │
//! │  Idle → PreProgram → DownloadBoot → ActivateBoot →          │
//! │         DownloadApplication → PostProgram → Done            │
//! │                                                             │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌────────────────┐ │
//! │  │FirmwareImage│  │DiagnosticSession │  │PeriodicSched.  │ │
//! │  │ (blocks)    │  │ (session/unlock) │──│ (tester pres.) │ │
//! │  └─────────────┘  └────────┬─────────┘  └────────────────┘ │
//! │                            │                                │
//! │                      ┌─────┴─────┐                          │
//! │                      │UdsService │                          │
//! │                      │(protocol) │                          │
//! │                      └─────┬─────┘                          │
//! │                            │                                │
//! │                  ┌─────────┴─────────┐                      │
//! │                  │ConnectionAdapter  │                      │
//! │                  │(queues + pump)    │                      │
//! │                  └─────────┬─────────┘                      │
//! │                            │                                │
//! │                  ┌─────────┴─────────┐                      │
//! │                  │SegmentedTransport │                      │
//! │                  │(ISO-TP / mock)    │                      │
//! │                  └───────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod firmware;
pub mod flash;
pub mod scheduler;
pub mod security;
pub mod session;
pub mod transport;
pub mod uds;

pub use config::{ConfigError, ReflashConfig};
pub use error::FlashError;
pub use firmware::{segment, FirmwareImage, MemoryBlock, ParseError, ParseErrorKind};
pub use flash::{FlashProgress, ReflashReport, ReflashState, Reflasher};
pub use scheduler::{PeriodicScheduler, SchedulerState};
pub use security::{derive_key, SecurityAlgorithm};
pub use session::DiagnosticSession;
pub use transport::{
    create_connection, ConnectionAdapter, ConnectionState, SegmentedTransport, TransportAdapter,
    TransportError,
};
pub use uds::{NegativeResponseCode, UdsError, UdsService};
