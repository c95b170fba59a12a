//! Flash command - full reprogramming sequence

use std::path::Path;

use anyhow::{Context, Result};
use ecuflash_uds::{FirmwareImage, ReflashConfig, ReflashState, Reflasher};
use indicatif::{ProgressBar, ProgressStyle};

use super::Ecu;
use crate::output::OutputContext;

/// Flash a boot image and an optional application image
pub async fn flash(
    config: &ReflashConfig,
    boot_path: &Path,
    app_path: Option<&Path>,
    ctx: &OutputContext,
) -> Result<()> {
    // Images are parsed before anything is sent to the ECU
    let boot = FirmwareImage::load(boot_path)
        .with_context(|| format!("Failed to load boot image {}", boot_path.display()))?;
    let app = match app_path {
        Some(path) => FirmwareImage::load(path)
            .with_context(|| format!("Failed to load application image {}", path.display()))?,
        None => FirmwareImage::default(),
    };
    Reflasher::check_images(config, boot.blocks(), app.blocks())?;
    ctx.info(&format!(
        "Boot image: {} block(s), {} bytes; application image: {} block(s), {} bytes",
        boot.blocks().len(),
        boot.total_size(),
        app.blocks().len(),
        app.total_size()
    ));

    let ecu = Ecu::connect(config, None).await?;
    let mut reflasher = match Reflasher::new(
        ecu.session.clone(),
        config.clone(),
        boot.into_blocks(),
        app.into_blocks(),
    ) {
        Ok(reflasher) => reflasher,
        Err(e) => {
            ecu.close().await?;
            return Err(e.into());
        }
    };

    let mut progress = reflasher.subscribe();
    let total = progress.borrow().bytes_total;
    let pb = if ctx.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("=>-"),
    );

    let renderer = {
        let pb = pb.clone();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let snapshot = progress.borrow_and_update().clone();
                pb.set_position(snapshot.bytes_transferred);
                match snapshot.block {
                    Some(block) => pb.set_message(format!("{} (block {})", snapshot.state, block)),
                    None => pb.set_message(snapshot.state.to_string()),
                }
                if snapshot.state.is_terminal() {
                    break;
                }
            }
        })
    };

    let result = reflasher.run().await;
    // Renderer stops by itself on Done/Failed
    let _ = renderer.await;

    ecu.close().await?;

    match result {
        Ok(report) => {
            pb.finish_with_message(ReflashState::Done.to_string());
            ctx.success(&format!(
                "\nReflash completed: {} bytes in {} transfer(s), {:.1}s",
                report.bytes_transferred,
                report.transfer_requests,
                report.elapsed.as_secs_f64()
            ));
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message(ReflashState::Failed.to_string());
            ctx.error(&format!("Reflash failed: {}", e));
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use ecuflash_uds::config::{SocketCanConfig, TransportConfig};
    use ecuflash_uds::FlashError;

    #[tokio::test]
    async fn test_bad_image_fails_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("boot.s19");
        std::fs::write(&boot, "S00600004844521B\nS804000000FB\n").unwrap();

        // connecting to this interface would fail with a transport error
        let mut config = ReflashConfig::default();
        config.transport = TransportConfig::SocketCan(SocketCanConfig {
            interface: "ecuflash-none0".to_string(),
            ..Default::default()
        });
        let ctx = OutputContext::new(OutputFormat::Json, true, true);

        let err = flash(&config, &boot, None, &ctx).await.unwrap_err();
        assert!(
            matches!(err.downcast_ref::<FlashError>(), Some(FlashError::InvalidImage(_))),
            "{err:#}"
        );
    }
}
