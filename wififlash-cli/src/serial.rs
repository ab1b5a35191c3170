//! Interactive serial port selection.
//!
//! Ports are picked, in order, from the command line, the configuration,
//! or the USB-UART bridges found on the machine. Several candidates lead to
//! an interactive prompt unless `--non-interactive` is given.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::{cmp::Ordering, io::IsTerminal},
    wififlash::{DetectedPort, detect_ports},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
}

/// Result of port selection including whether it was a known device.
#[derive(Debug)]
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Selection failures are setup problems and exit with the usage code.
    CliError::Usage(message.to_string()).into()
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    if let Some(port_name) = &config.port.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    select_from(detect_ports(), options, config)
}

fn select_from(
    ports: Vec<DetectedPort>,
    options: &SerialOptions,
    config: &Config,
) -> Result<SelectedPort> {
    if ports.is_empty() {
        return Err(usage_err(
            "No serial ports found. Connect the module's USB-UART adapter or pass --port.",
        ));
    }

    // Known bridges first; fall back to everything if none are recognized.
    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    let candidates = if known.is_empty() { ports } else { known };

    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    match candidates.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates, config)
        }
        Ordering::Equal => {
            let Some(port) = candidates.into_iter().next() else {
                return Err(usage_err("No serial ports available."));
            };
            if is_known_device(&port, config) {
                info!("Auto-selected port: {} [{}]", port.name, port.device.name());
                Ok(SelectedPort {
                    port,
                    is_known: true,
                })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        }
        Ordering::Less => Err(usage_err("No serial ports available.")),
    }
}

fn select_non_interactive_port(
    candidates: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    // Exactly one candidate is the only deterministic choice.
    match candidates.len().cmp(&1) {
        Ordering::Equal => {
            let Some(port) = candidates.into_iter().next() else {
                return Err(usage_err("No serial ports available."));
            };
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        }
        Ordering::Greater => Err(usage_err(
            "Multiple serial ports found; pass --port to choose one in non-interactive mode.",
        )),
        Ordering::Less => Err(usage_err("No serial ports available.")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port instead.",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled.".to_string()).into()
            } else {
                usage_err("Port selection prompt failed.")
            }
        }
    }
}

/// Find a port by name, keeping the name even if it was not enumerated.
fn find_port_by_name(name: &str, ports: Vec<DetectedPort>) -> SelectedPort {
    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)));

    match found {
        Some(port) => SelectedPort {
            port: port.clone(),
            is_known: port.device.is_known(),
        },
        None => SelectedPort {
            port: DetectedPort::plain(name),
            is_known: false,
        },
    }
}

/// Check if a port matches a known device (from config or built-in list).
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

/// Interactive port selection.
fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    ports.sort_by_key(|p| !is_known_device(p, config));

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            let label = port.describe();
            let label = if is_known_device(port, config) {
                style(label).bold().to_string()
            } else {
                label
            };
            console::truncate_str(&label, max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the module's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        }
        None => Err(CliError::Cancelled("Port selection cancelled.".to_string()).into()),
    }
}

/// Confirm use of a single unrecognized port.
fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port {}?", port.describe()))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(CliError::Cancelled("Port selection cancelled.".to_string()).into())
    }
}

/// Ask user if they want to remember this port's USB bridge.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.port.usb_device.iter().any(|d| d.matches(vid, pid)) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this USB device for next time?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::config::UsbDevice,
        wififlash::DeviceKind,
    };

    fn usb_port(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            device: DeviceKind::from_vid_pid(vid, pid),
            vid: Some(vid),
            pid: Some(pid),
            ..DetectedPort::plain(name)
        }
    }

    fn non_interactive() -> SerialOptions {
        SerialOptions {
            port: None,
            non_interactive: true,
        }
    }

    fn usage_message(err: &anyhow::Error) -> Option<String> {
        match err.downcast_ref::<CliError>() {
            Some(CliError::Usage(msg)) => Some(msg.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_is_known_device_builtin() {
        let port = usb_port("/dev/ttyUSB0", 0x1A86, 0x7523);
        assert!(is_known_device(&port, &Config::default()));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let port = usb_port("/dev/ttyACM0", 0x303A, 0x1001);
        let mut config = Config::default();
        assert!(!is_known_device(&port, &config));
        config.port.usb_device.push(UsbDevice {
            vid: 0x303A,
            pid: 0x1001,
        });
        assert!(is_known_device(&port, &config));
    }

    #[test]
    fn test_is_known_device_no_vid_pid() {
        assert!(!is_known_device(
            &DetectedPort::plain("/dev/ttyS0"),
            &Config::default()
        ));
    }

    #[test]
    fn test_find_port_by_name() {
        let ports = vec![usb_port("COM3", 0x10C4, 0xEA60)];
        let selected = find_port_by_name("com3", ports.clone());
        assert_eq!(selected.port.name, "COM3");
        assert!(selected.is_known);

        let missing = find_port_by_name("/dev/ttyUSB9", ports);
        assert_eq!(missing.port.name, "/dev/ttyUSB9");
        assert!(!missing.is_known);
    }

    #[test]
    fn test_non_interactive_prefers_known_bridge() {
        let ports = vec![
            DetectedPort::plain("/dev/ttyS0"),
            usb_port("/dev/ttyUSB0", 0x1A86, 0x7523),
        ];
        let selected = select_from(ports, &non_interactive(), &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(selected.is_known);
    }

    #[test]
    fn test_non_interactive_multiple_ports_is_usage_error() {
        let ports = vec![
            usb_port("/dev/ttyUSB0", 0x1A86, 0x7523),
            usb_port("/dev/ttyUSB1", 0x10C4, 0xEA60),
        ];
        let err = select_from(ports, &non_interactive(), &Config::default()).unwrap_err();
        assert!(usage_message(&err).unwrap().contains("--port"));
    }

    #[test]
    fn test_no_ports_is_usage_error() {
        let err = select_from(Vec::new(), &non_interactive(), &Config::default()).unwrap_err();
        assert!(usage_message(&err).is_some());
    }
}
