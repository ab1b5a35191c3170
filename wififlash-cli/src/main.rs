//! wififlash CLI - Command-line tool for reflashing ESP8266 Wi-Fi modules.
//!
//! ## Features
//!
//! - Upload firmware, combined firmware + web UI, or web UI filesystem images
//! - Automatic reset into the bootloader through the adapter's DTR/RTS lines
//! - Baud rate fallback with configurable candidates
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use thiserror::Error;
use wififlash::{FlashParams, UploadKind};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Errors that carry their own exit status.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// The invocation cannot work as given.
    #[error("{0}")]
    Usage(String),
    /// The user backed out of a prompt.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// wififlash - Reflash ESP8266 Wi-Fi modules over their UART bootloader.
///
/// Environment variables:
///   WIFIFLASH_PORT              - Default serial port
///   WIFIFLASH_BAUD              - Baud rates to try, comma-separated
///   WIFIFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "wififlash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "WIFIFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate to try; repeat or comma-separate for a fallback list.
    #[arg(
        short,
        long,
        global = true,
        env = "WIFIFLASH_BAUD",
        value_delimiter = ','
    )]
    pub(crate) baud: Vec<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "WIFIFLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Image kinds accepted by the module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Kind {
    /// Module firmware (written at 0x000000).
    Firmware,
    /// Firmware with the web UI bundled (written at 0x000000).
    WebFirmware,
    /// Web UI filesystem (written at 0x100000).
    WebFiles,
}

impl From<Kind> for UploadKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Firmware => UploadKind::Firmware,
            Kind::WebFirmware => UploadKind::WebFirmware,
            Kind::WebFiles => UploadKind::WebFiles,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Upload an image to the Wi-Fi module.
    Flash {
        /// Path to the image file.
        image: PathBuf,

        /// What the image is; selects the flash address.
        #[arg(short, long, value_enum)]
        kind: Option<Kind>,

        /// Explicit flash address (overrides --kind).
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Force flash parameter bits in the image header (format: value:mask).
        #[arg(long, value_parser = parse_flash_param)]
        flash_param: Option<FlashParams>,

        /// Leave the module in its bootloader when done.
        #[arg(long)]
        no_reboot: bool,

        /// The module is put into its bootloader by hand.
        #[arg(long)]
        manual_reset: bool,
    },

    /// Show what an upload of an image would do.
    Info {
        /// Path to the image file.
        image: PathBuf,

        /// What the image is; selects the flash address.
        #[arg(short, long, value_enum)]
        kind: Option<Kind>,

        /// Explicit flash address (overrides --kind).
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x10_00_00
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

/// Parse a flash parameter patch in format "value:mask" (hex).
fn parse_flash_param(s: &str) -> Result<FlashParams, String> {
    let Some((value, mask)) = s.split_once(':') else {
        return Err(format!(
            "Invalid format: '{s}'. Expected 'value:mask' (e.g., '0x0040:0x00F0')"
        ));
    };
    let parse = |part: &str| {
        parse_hex_u32(part).and_then(|v| {
            u16::try_from(v).map_err(|_| format!("Flash parameter out of range: {part}"))
        })
    };
    Ok(FlashParams::new(parse(value)?, parse(mask)?))
}

/// Flash address for an upload: explicit address, then kind, then config.
pub(crate) fn resolve_address(address: Option<u32>, kind: Option<Kind>, config: &Config) -> u32 {
    address.unwrap_or_else(|| {
        kind.map(UploadKind::from)
            .or(config.upload.kind)
            .unwrap_or(UploadKind::Firmware)
            .address()
    })
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "wififlash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        let code = err.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            image,
            kind,
            address,
            flash_param,
            no_reboot,
            manual_reset,
        } => {
            let options = commands::flash::FlashOptions {
                address: resolve_address(*address, *kind, &config),
                flash_params: *flash_param,
                reboot: if *no_reboot { Some(false) } else { None },
                manual_reset: *manual_reset,
            };
            commands::flash::cmd_flash(cli, &mut config, image, &options)
        },
        Commands::Info {
            image,
            kind,
            address,
            json,
        } => commands::info::cmd_info(image, resolve_address(*address, *kind, &config), *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from(["wififlash", "flash", "fw.bin"]).unwrap();
        match cli.command {
            Commands::Flash {
                image,
                kind,
                address,
                flash_param,
                no_reboot,
                manual_reset,
            } => {
                assert_eq!(image, PathBuf::from("fw.bin"));
                assert!(kind.is_none());
                assert!(address.is_none());
                assert!(flash_param.is_none());
                assert!(!no_reboot);
                assert!(!manual_reset);
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "wififlash",
            "flash",
            "web.bin",
            "--kind",
            "web-files",
            "--address",
            "0x200000",
            "--flash-param",
            "0x40:0xF0",
            "--no-reboot",
            "--manual-reset",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash {
                kind,
                address,
                flash_param,
                no_reboot,
                manual_reset,
                ..
            } => {
                assert_eq!(kind, Some(Kind::WebFiles));
                assert_eq!(address, Some(0x20_0000));
                assert_eq!(flash_param, Some(FlashParams::new(0x40, 0xF0)));
                assert!(no_reboot);
                assert!(manual_reset);
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_parse_info_json() {
        let cli = Cli::try_parse_from(["wififlash", "info", "fw.bin", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true, .. }));
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["wififlash", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["wififlash", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Zsh }
        ));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "wififlash",
            "-p",
            "/dev/ttyUSB1",
            "-b",
            "230400",
            "--baud",
            "115200,74880",
            "-vv",
            "--non-interactive",
            "--config",
            "custom.toml",
            "list-ports",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(cli.baud, vec![230_400, 115_200, 74_880]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);
        assert_eq!(cli.config_path, Some(PathBuf::from("custom.toml")));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["wififlash"]).is_err());
    }

    #[test]
    fn test_cli_invalid_kind() {
        assert!(Cli::try_parse_from(["wififlash", "flash", "x.bin", "--kind", "bootloader"]).is_err());
    }

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32("0x100000"), Ok(0x10_0000));
        assert_eq!(parse_hex_u32("100000"), Ok(0x10_0000));
        assert_eq!(parse_hex_u32(" 0X10_00_00 "), Ok(0x10_0000));
        assert_eq!(parse_hex_u32("0"), Ok(0));
        assert!(parse_hex_u32("xyz").is_err());
        assert!(parse_hex_u32("0x100000000").is_err());
    }

    #[test]
    fn test_parse_flash_param() {
        assert_eq!(
            parse_flash_param("0x0040:0x00F0"),
            Ok(FlashParams::new(0x40, 0xF0))
        );
        assert!(parse_flash_param("0x40").is_err());
        assert!(parse_flash_param("0x10000:0xF0").is_err());
    }

    #[test]
    fn test_resolve_address() {
        let mut config = Config::default();
        assert_eq!(resolve_address(None, None, &config), 0);
        assert_eq!(resolve_address(None, Some(Kind::WebFiles), &config), 0x10_0000);
        assert_eq!(resolve_address(Some(0x3000), Some(Kind::WebFiles), &config), 0x3000);

        config.upload.kind = Some(UploadKind::WebFiles);
        assert_eq!(resolve_address(None, None, &config), 0x10_0000);
        assert_eq!(resolve_address(None, Some(Kind::Firmware), &config), 0);
    }

    #[test]
    fn test_kind_maps_to_upload_kind() {
        assert_eq!(UploadKind::from(Kind::Firmware), UploadKind::Firmware);
        assert_eq!(UploadKind::from(Kind::WebFirmware), UploadKind::WebFirmware);
        assert_eq!(UploadKind::from(Kind::WebFiles), UploadKind::WebFiles);
    }
}
