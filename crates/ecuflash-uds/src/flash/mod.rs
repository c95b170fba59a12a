//! Reflash orchestration
//!
//! The sequence state machine, block transfer chunking, the records written
//! to the ECU during programming, and the [`Reflasher`] that ties them
//! together.

mod orchestrator;
mod records;
mod state;
mod transfer;

pub use orchestrator::{FlashProgress, ReflashReport, Reflasher};
pub use records::{boot_entry_record, prepare_block_record, programming_date_record};
pub use state::ReflashState;
pub use transfer::{BlockSequenceCounter, TransferSession, TRANSFER_OVERHEAD};
