//! Diagnostic commands - DTCs, reset, data identifiers, routines

use anyhow::{Context, Result};
use ecuflash_uds::ReflashConfig;

use super::Ecu;
use crate::output::{DtcRow, OutputContext};

fn yes_no(flag: bool) -> String {
    let text = if flag { "Yes" } else { "No" };
    text.to_string()
}

/// Read DTCs matching a status mask
pub async fn dtc(
    config: &ReflashConfig,
    unlock: Option<u8>,
    mask: u8,
    ctx: &OutputContext,
) -> Result<()> {
    let ecu = Ecu::connect(config, unlock).await?;
    let result = ecu.uds().read_dtc_by_status_mask(mask).await;
    ecu.close().await?;

    let (availability, dtcs) = result.context("ReadDTCInformation failed")?;
    if dtcs.is_empty() {
        ctx.info("No DTCs found");
        return Ok(());
    }

    let rows: Vec<DtcRow> = dtcs
        .iter()
        .map(|dtc| DtcRow {
            code: dtc.code(),
            number: format!("0x{:06X}", dtc.number),
            status: format!("0x{:02X}", dtc.status.0),
            confirmed: yes_no(dtc.status.confirmed()),
            pending: yes_no(dtc.status.pending()),
            warning: yes_no(dtc.status.warning_indicator()),
        })
        .collect();

    ctx.print(&rows);
    ctx.info(&format!("Status availability mask: 0x{:02X}", availability));
    Ok(())
}

pub async fn clear_dtc(
    config: &ReflashConfig,
    unlock: Option<u8>,
    group: u32,
    ctx: &OutputContext,
) -> Result<()> {
    let ecu = Ecu::connect(config, unlock).await?;
    let result = ecu.uds().clear_dtc(group).await;
    ecu.close().await?;

    result.context("ClearDiagnosticInformation failed")?;
    ctx.success(&format!("Cleared DTC group 0x{:06X}", group));
    Ok(())
}

pub async fn reset(
    config: &ReflashConfig,
    unlock: Option<u8>,
    reset_type: u8,
    ctx: &OutputContext,
) -> Result<()> {
    ctx.info(&format!("Performing reset 0x{:02X}...", reset_type));

    let ecu = Ecu::connect(config, unlock).await?;
    let result = ecu.uds().ecu_reset(reset_type).await;
    ecu.close().await?;

    let power_down_time = result.context("ECUReset failed")?;
    ctx.success("ECU reset successful");
    if let Some(seconds) = power_down_time {
        ctx.info(&format!("Power down time: {}s", seconds));
    }
    Ok(())
}

pub async fn read_did(
    config: &ReflashConfig,
    unlock: Option<u8>,
    did: u16,
    ctx: &OutputContext,
) -> Result<()> {
    let ecu = Ecu::connect(config, unlock).await?;
    let result = ecu.uds().read_data_by_id(did).await;
    ecu.close().await?;

    let data = result.with_context(|| format!("ReadDataByIdentifier 0x{:04X} failed", did))?;
    let text: String = data
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();

    ctx.print_kv(&[
        ("did", format!("0x{:04X}", did)),
        ("hex", hex::encode_upper(&data)),
        ("ascii", text),
    ]);
    Ok(())
}

pub async fn write_did(
    config: &ReflashConfig,
    unlock: Option<u8>,
    did: u16,
    data: &[u8],
    ctx: &OutputContext,
) -> Result<()> {
    let ecu = Ecu::connect(config, unlock).await?;
    let result = ecu.uds().write_data_by_id(did, data).await;
    ecu.close().await?;

    result.with_context(|| format!("WriteDataByIdentifier 0x{:04X} failed", did))?;
    ctx.success(&format!(
        "Wrote {} to DID 0x{:04X}",
        hex::encode_upper(data),
        did
    ));
    Ok(())
}

/// Start each routine in order, stopping at the first rejection
pub async fn routine(
    config: &ReflashConfig,
    unlock: Option<u8>,
    routine_ids: &[u16],
    data: &[u8],
    ctx: &OutputContext,
) -> Result<()> {
    let ecu = Ecu::connect(config, unlock).await?;
    let mut results = Vec::with_capacity(routine_ids.len());
    for &routine_id in routine_ids {
        match ecu.uds().routine_control_start(routine_id, data).await {
            Ok(status) => results.push((routine_id, status)),
            Err(e) => {
                ecu.close().await?;
                return Err(e).with_context(|| format!("Routine 0x{:04X} failed", routine_id));
            }
        }
    }
    ecu.close().await?;

    for (routine_id, status) in results {
        ctx.print_kv(&[
            ("routine", format!("0x{:04X}", routine_id)),
            ("status", hex::encode_upper(&status)),
        ]);
    }
    Ok(())
}
