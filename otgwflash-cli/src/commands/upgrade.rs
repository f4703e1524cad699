//! Upgrade command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use otgwflash::image::hex::{DATA_BYTES, PROGRAM_WORDS};
use otgwflash::{Flasher, Indicator, MemoryImage, Outcome, Phase};
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, get_baud, get_port, use_fancy_output, was_interrupted};

/// Share of the bar spent on program memory; data memory gets the rest.
const CODE_PERCENT: u64 = 90;

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Percentage of the upgrade done once `pc` is the next address of `phase`.
fn percent(phase: Phase, pc: u16) -> u64 {
    let pc = u64::from(pc);
    match phase {
        Phase::Code => (pc * CODE_PERCENT / PROGRAM_WORDS as u64).min(CODE_PERCENT),
        Phase::Data => {
            (CODE_PERCENT + pc * (100 - CODE_PERCENT) / DATA_BYTES as u64).min(100)
        },
        _ => 0,
    }
}

/// Renders engine progress on an `indicatif` bar.
struct ProgressIndicator {
    pb: ProgressBar,
    phase: Option<Phase>,
}

impl ProgressIndicator {
    fn new(pb: ProgressBar) -> Self {
        Self { pb, phase: None }
    }
}

impl Indicator for ProgressIndicator {
    fn progress(&mut self, phase: Phase, pc: u16) {
        if self.phase != Some(phase) {
            self.phase = Some(phase);
            let msg = match phase {
                Phase::Data => "Writing data memory",
                _ => "Writing program memory",
            };
            self.pb.set_message(msg);
        }
        self.pb.set_position(percent(phase, pc));
    }

    fn finished(&mut self, outcome: Outcome) {
        if outcome.is_success() {
            self.pb.finish_with_message("Done");
        } else {
            self.pb.abandon_with_message(outcome.to_string());
        }
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message("Waiting for bootloader");
    pb
}

/// Load `firmware` and refuse images the bootloader would not accept.
fn load_image(firmware: &Path) -> Result<MemoryImage> {
    let image = MemoryImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware image {}", firmware.display()))?;

    if !image.has_magic() {
        return Err(CliError::Failed(format!(
            "{}: {}",
            firmware.display(),
            Outcome::Magic
        ))
        .into());
    }

    Ok(image)
}

/// Upgrade command implementation.
pub(crate) fn cmd_upgrade(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    save_port: bool,
    skip_blank: bool,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("•").cyan(),
            firmware.display()
        );
    }

    // Checked before the port is touched so a wrong file never resets the gateway
    let image = load_image(firmware)?;
    if !cli.quiet {
        eprintln!(
            "{} {} program words, {} data bytes",
            style("ℹ").blue(),
            image.used_program_words(),
            image.used_data_bytes()
        );
    }

    let port = get_port(cli, config)?;
    let baud = get_baud(cli, config);
    if save_port {
        Config::save_port(&port).context("Failed to save port configuration")?;
    }
    if !cli.quiet {
        eprintln!("{} Using {port} at {baud} baud", style("•").cyan());
    }
    ensure_not_interrupted()?;

    let mut upgrade_config = config.upgrade_config();
    upgrade_config.skip_blank_blocks |= skip_blank;

    let mut flasher = Flasher::open(&port, baud, upgrade_config)
        .with_context(|| format!("Failed to open serial port {port}"))?;

    let mut indicator = ProgressIndicator::new(progress_bar(cli.quiet));
    let outcome = match flasher.run_image(image, &mut indicator) {
        Ok(outcome) => outcome,
        Err(otgwflash::Error::Interrupted) => {
            return Err(CliError::Cancelled("Upgrade interrupted".to_string()).into());
        },
        Err(e) => return Err(e).context("Upgrade failed"),
    };

    if !outcome.is_success() {
        return Err(CliError::Failed(format!("Upgrade failed: {outcome}")).into());
    }

    if !cli.quiet {
        eprintln!(
            "{} Gateway upgraded from {}",
            style("✓").green(),
            firmware.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_percent() {
        assert_eq!(percent(Phase::Reset, 0), 0);
        assert_eq!(percent(Phase::Code, 0), 0);
        assert_eq!(percent(Phase::Code, 2048), 45);
        assert_eq!(percent(Phase::Code, 4096), 90);
        assert_eq!(percent(Phase::Data, 128), 95);
        assert_eq!(percent(Phase::Data, 256), 100);
    }

    #[test]
    fn test_indicator_tracks_progress() {
        let mut indicator = ProgressIndicator::new(ProgressBar::hidden());
        indicator.progress(Phase::Code, 1024);
        assert_eq!(indicator.pb.position(), 22);
        indicator.progress(Phase::Data, 64);
        assert_eq!(indicator.phase, Some(Phase::Data));
        indicator.finished(Outcome::None);
        assert!(indicator.pb.is_finished());
    }

    #[test]
    fn test_load_image_rejects_foreign_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.hex");
        fs::write(&path, ":00000001FF\n").unwrap();

        let err = load_image(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Failed(_))
        ));
        assert!(err.to_string().contains("not compatible"));
    }

    #[test]
    fn test_load_image_accepts_gateway_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.hex");
        let mut image = MemoryImage::new();
        image.program_mut()[0] = 0x158A;
        image.program_mut()[1] = 0x2600;
        fs::write(&path, image.to_hex()).unwrap();

        assert!(load_image(&path).unwrap().has_magic());
    }

    #[test]
    fn test_load_image_missing_file() {
        let err = load_image(Path::new("/nonexistent/gateway.hex")).unwrap_err();
        assert!(err.downcast_ref::<CliError>().is_none());
        assert!(err.to_string().contains("Failed to load firmware image"));
    }
}
