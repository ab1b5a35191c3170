//! Flash command implementation.

use anyhow::{Context, Result, anyhow, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::path::Path;
use std::thread;
use std::time::Duration;
use wififlash::{
    Connection, DEFAULT_BAUD_RATES, FileImage, FlashParams, ImageInfo, ImageSource, NativePort,
    NoGpio, Progress, ResultCode, SerialConfig, SystemClock, UploadConfig, UploadGpio,
    UploadSession, UploadState,
};

use crate::config::Config;
use crate::{Cli, get_port, use_fancy_output};

/// Options of one `flash` invocation, already resolved against the config.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlashOptions {
    /// Flash address of the image.
    pub(crate) address: u32,
    /// Header patch from `--flash-param`.
    pub(crate) flash_params: Option<FlashParams>,
    /// Reboot override from `--no-reboot`.
    pub(crate) reboot: Option<bool>,
    /// Skip the DTR/RTS reset sequence.
    pub(crate) manual_reset: bool,
}

/// Session tuning: library defaults, then config file, then flags.
pub(crate) fn upload_config(cli: &Cli, config: &Config, options: &FlashOptions) -> UploadConfig {
    let mut upload = config.upload.apply(UploadConfig::default());
    if !cli.baud.is_empty() {
        upload.baud_rates.clone_from(&cli.baud);
    }
    if let Some(params) = options.flash_params {
        upload.flash_params = params;
    }
    if let Some(reboot) = options.reboot {
        upload.reboot = reboot;
    }
    upload
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    image_path: &Path,
    options: &FlashOptions,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading image: {}",
            style("📦").cyan(),
            image_path.display()
        );
    }

    let mut image = FileImage::open(image_path)
        .with_context(|| format!("Failed to open image {}", image_path.display()))?;
    if image.size() == 0 {
        // Refuse before touching the port or resetting the module.
        bail!("{}: {}", image_path.display(), ResultCode::EmptyFile);
    }
    let info = ImageInfo::inspect(&mut image, options.address)
        .with_context(|| format!("Failed to read image {}", image_path.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} {} bytes ({} blocks) @ 0x{:06X}{}",
            style("ℹ").blue(),
            info.size,
            info.blocks,
            info.address,
            if info.bootable {
                style(" (bootable)").yellow().to_string()
            } else {
                String::new()
            }
        );
    }

    let upload = upload_config(cli, config, options);
    let manual_reset = options.manual_reset || config.upload.manual_reset == Some(true);

    // Get port
    let port_name = get_port(cli, config)?;
    let initial_baud = upload
        .baud_rates
        .first()
        .copied()
        .unwrap_or(DEFAULT_BAUD_RATES[0]);
    if !cli.quiet {
        eprintln!(
            "{} Using port {port_name} (baud rates: {})",
            style("🔌").cyan(),
            upload
                .baud_rates
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let port = NativePort::open(&SerialConfig::new(&port_name, initial_baud))
        .with_context(|| format!("Failed to open serial port {port_name}"))?;

    if manual_reset {
        if !cli.quiet {
            eprintln!(
                "{} Hold GPIO0 low and reset the module into its bootloader",
                style("⏳").yellow()
            );
        }
        run_upload(cli, port, NoGpio, image, options.address, upload)
    } else {
        let gpio = port
            .control_lines()
            .with_context(|| format!("Failed to take control lines of {port_name}"))?;
        run_upload(cli, port, gpio, image, options.address, upload)
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
    pb
}

fn phase_message(state: UploadState, baud_rate: u32) -> String {
    match state {
        UploadState::Resetting => "Resetting module".to_string(),
        UploadState::Connecting { .. } => format!("Syncing at {baud_rate} baud"),
        UploadState::Erasing => "Erasing".to_string(),
        UploadState::Uploading { .. } => "Writing".to_string(),
        UploadState::Done(code) => code.to_string(),
    }
}

fn run_upload<G: UploadGpio>(
    cli: &Cli,
    port: NativePort,
    gpio: G,
    image: FileImage,
    address: u32,
    upload: UploadConfig,
) -> Result<()> {
    let reboot = upload.reboot;
    let pb = progress_bar(cli.quiet);
    let bar = pb.clone();

    let connection = Connection::new(port, SystemClock::new());
    let mut session = UploadSession::begin(connection, gpio, image, address, upload)?
        .with_progress(move |percent| bar.set_position(u64::from(percent)));

    let mut phase = String::new();
    let code = loop {
        let message = phase_message(session.state(), session.baud_rate());
        if message != phase {
            debug!("Upload phase: {message}");
            pb.set_message(message.clone());
            phase = message;
        }
        match session.step() {
            Progress::Done(code) => break code,
            Progress::InProgress(_) => thread::sleep(Duration::from_millis(1)),
        }
    };

    if !code.is_success() {
        pb.abandon_with_message(code.to_string());
        return Err(match session.error() {
            Some(err) => anyhow!("Upload failed: {code} ({err})"),
            None => anyhow!("Upload failed: {code}"),
        });
    }

    pb.finish_with_message("Complete");
    if !cli.quiet {
        eprintln!(
            "{} Wrote {} blocks at {} baud",
            style("✓").green(),
            session.blocks_written(),
            session.baud_rate()
        );
        let outcome = if reboot {
            "Upload completed, module restarted"
        } else {
            "Upload completed, module left in its bootloader"
        };
        eprintln!("\n{} {outcome}", style("🎉").green().bold());
    }

    Ok(())
}
