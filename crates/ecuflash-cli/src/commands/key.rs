//! Key command - offline seed/key computation

use anyhow::{anyhow, Context, Result};
use ecuflash_uds::{ReflashConfig, SecurityAlgorithm};

use crate::output::OutputContext;

pub fn key(level: u8, seed: &str, config: &ReflashConfig, ctx: &OutputContext) -> Result<()> {
    let bytes = hex::decode(seed.trim_start_matches("0x")).context("Seed must be hex")?;
    let seed: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("Seed must be exactly 4 bytes, got {}", bytes.len()))?;

    let algorithm = SecurityAlgorithm::for_level(level);
    let key = algorithm.derive(seed, &config.security.algorithm_params);

    ctx.print_kv(&[
        ("level", format!("0x{:02X}", level)),
        ("algorithm", format!("{:?}", algorithm)),
        ("seed", hex::encode_upper(seed)),
        ("key", hex::encode_upper(key)),
    ]);
    Ok(())
}
