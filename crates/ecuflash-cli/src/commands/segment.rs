//! Segment command - show the memory blocks of an image

use std::path::Path;

use anyhow::{Context, Result};
use ecuflash_uds::FirmwareImage;

use crate::output::{BlockRow, OutputContext};

pub fn segment(file: &Path, ctx: &OutputContext) -> Result<()> {
    let image = FirmwareImage::load(file)
        .with_context(|| format!("Failed to segment {}", file.display()))?;

    let rows: Vec<BlockRow> = image
        .blocks()
        .iter()
        .enumerate()
        .map(|(index, block)| BlockRow {
            index,
            address: format!("0x{:08X}", block.address),
            size: block.size(),
            end: format!("0x{:08X}", block.end()),
        })
        .collect();

    ctx.print(&rows);
    ctx.info(&format!(
        "{} block(s), {} bytes",
        rows.len(),
        image.total_size()
    ));
    Ok(())
}
