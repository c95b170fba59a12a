//! ecuflash - reflash and diagnose ECUs over UDS
//!
//! Talks to an ECU through the transport selected in the configuration file
//! (kernel ISO-TP over SocketCAN, or the built-in simulated ECU).

mod commands;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ecuflash_uds::uds::dtc::{status_bit, ALL_GROUPS};
use ecuflash_uds::uds::reset_type::HARD_RESET;
use ecuflash_uds::ReflashConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::{parse_bytes, parse_level, parse_u16, parse_u32, parse_u8};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "ecuflash")]
#[command(author, version, about = "UDS ECU reflash tool")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "ECUFLASH_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enter the extended session and unlock this security level first
    /// (ECU commands only, e.g. 0x01)
    #[arg(long, global = true, value_parser = parse_level)]
    unlock: Option<u8>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split an S-record image into memory blocks
    Segment {
        /// S-record file
        file: PathBuf,
    },

    /// Compute the security access key for a seed
    Key {
        /// Security level (seed request sub-function, e.g. 0x01 or 0x11)
        #[arg(value_parser = parse_u8)]
        level: u8,

        /// 4-byte seed as hex (e.g. "12345678")
        seed: String,
    },

    /// Reprogram the ECU with a boot image and an optional application image
    Flash {
        /// Boot image (S-record)
        boot: PathBuf,

        /// Application image (S-record)
        app: Option<PathBuf>,
    },

    /// Read DTCs by status mask
    Dtc {
        /// Status mask [default: test failed or confirmed]
        #[arg(long, value_parser = parse_u8)]
        mask: Option<u8>,
    },

    /// Clear DTCs
    ClearDtc {
        /// DTC group (3 bytes) [default: all groups]
        #[arg(long, value_parser = parse_u32)]
        group: Option<u32>,
    },

    /// Reset the ECU
    Reset {
        /// Reset type: 0x01 hard, 0x02 key off/on, 0x03 soft [default: hard]
        #[arg(long, value_parser = parse_u8)]
        reset_type: Option<u8>,
    },

    /// Read a data identifier (e.g. 0xF195 supplier software version)
    ReadDid {
        /// Data identifier
        #[arg(value_parser = parse_u16)]
        did: u16,
    },

    /// Write a data identifier (e.g. 0xF1A8 variant configuration)
    WriteDid {
        /// Data identifier
        #[arg(value_parser = parse_u16)]
        did: u16,

        /// Data as hex (e.g. "0F")
        #[arg(value_parser = parse_bytes)]
        data: ::std::vec::Vec<u8>,
    },

    /// Start one or more routines in order
    ///
    /// Examples: 0xF001 0xF002 (INS calibration), 0xF102 (EPB release),
    /// 0xF105 (EPB apply); these usually need --unlock 0x01.
    Routine {
        /// Routine identifiers
        #[arg(required = true, value_parser = parse_u16)]
        routine_ids: Vec<u16>,

        /// Routine control option record as hex
        #[arg(long, value_parser = parse_bytes, default_value = "")]
        data: ::std::vec::Vec<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => ReflashConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ReflashConfig::default(),
    };

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    match &cli.command {
        Commands::Segment { file } => commands::segment(file, &ctx)?,

        Commands::Key { level, seed } => commands::key(*level, seed, &config, &ctx)?,

        Commands::Flash { boot, app } => {
            commands::flash(&config, boot, app.as_deref(), &ctx).await?;
        }

        Commands::Dtc { mask } => {
            let mask = mask.unwrap_or(status_bit::FAILED_OR_CONFIRMED);
            commands::dtc(&config, cli.unlock, mask, &ctx).await?
        }

        Commands::ClearDtc { group } => {
            let group = group.unwrap_or(ALL_GROUPS);
            commands::clear_dtc(&config, cli.unlock, group, &ctx).await?
        }

        Commands::Reset { reset_type } => {
            let reset_type = reset_type.unwrap_or(HARD_RESET);
            commands::reset(&config, cli.unlock, reset_type, &ctx).await?
        }

        Commands::ReadDid { did } => commands::read_did(&config, cli.unlock, *did, &ctx).await?,

        Commands::WriteDid { did, data } => {
            commands::write_did(&config, cli.unlock, *did, data, &ctx).await?
        }

        Commands::Routine { routine_ids, data } => {
            commands::routine(&config, cli.unlock, routine_ids, data, &ctx).await?
        }
    }

    Ok(())
}
