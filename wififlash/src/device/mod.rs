//! Serial port discovery and USB-UART bridge classification.
//!
//! Wi-Fi modules are nearly always reached through a USB-UART bridge, so
//! ports are ranked by the bridge chip behind them.

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Known USB-UART bridge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs for common USB-to-UART bridges.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is a recognized bridge.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Bridges found on most ESP8266 adapters are tried first.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Ch340 | Self::Cp210x)
    }
}

/// Discovered serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified bridge kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Port without USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// One-line description for listings.
    pub fn describe(&self) -> String {
        let device_info = if self.device.is_known() {
            format!(" [{}]", self.device.name())
        } else if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };
        let product_info = self
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();
        format!("{}{device_info}{product_info}", self.name)
    }
}

/// Enumerate serial ports with USB metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        }
    };

    ports
        .into_iter()
        .map(|port_info| {
            let mut detected = DetectedPort::plain(port_info.port_name.clone());
            if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);
                trace!(
                    "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                    port_info.port_name, usb_info.vid, usb_info.pid, detected.device
                );
                detected.vid = Some(usb_info.vid);
                detected.pid = Some(usb_info.pid);
                detected.manufacturer = usb_info.manufacturer;
                detected.product = usb_info.product;
                detected.serial = usb_info.serial_number;
            }
            detected
        })
        .collect()
}

/// Enumerate serial ports (no native support compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the most likely module port from `ports`.
pub fn rank_ports(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports
        .iter()
        .find(|p| p.device.is_high_priority())
        .or_else(|| ports.iter().find(|p| p.device.is_known()))
        .or_else(|| ports.first())
}

/// Pick the most likely module port on this machine.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Option<DetectedPort> {
    let ports = detect_ports();
    let port = rank_ports(&ports)?.clone();
    info!("Auto-detected {} port: {}", port.device.name(), port.name);
    Some(port)
}

/// Pick the most likely module port (no native support compiled in).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Option<DetectedPort> {
    None
}
