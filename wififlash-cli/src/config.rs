//! Configuration file support for wififlash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (WIFIFLASH_*)
//! 3. Local config file (./wififlash.toml)
//! 4. Global config file (~/.config/wififlash/config.toml)
//!
//! ```toml
//! [port]
//! serial = "/dev/ttyUSB0"
//!
//! [[port.usb_device]]
//! vid = 0x1A86
//! pid = 0x7523
//!
//! [upload]
//! baud_rates = [230400, 115200]
//! sync_timeout_ms = 3000
//! reboot = true
//! ```

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use wififlash::{FlashParams, UploadConfig, UploadKind};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "wififlash.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Remembered USB-UART bridges.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Upload tuning overrides. Unset fields keep the library defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadSection {
    /// Default image kind.
    pub kind: Option<UploadKind>,
    /// Baud rates to try, in order.
    pub baud_rates: Option<Vec<u32>>,
    /// Failed syncs per baud rate.
    pub retries_per_baud: Option<u32>,
    /// Failed syncs per module reset.
    pub retries_per_reset: Option<u32>,
    /// Timeout of one sync attempt.
    pub sync_timeout_ms: Option<u64>,
    /// Minimum gap between sync attempts.
    pub connect_interval_ms: Option<u64>,
    /// Wait after a reset before syncing.
    pub reset_settle_ms: Option<u64>,
    /// Minimum gap between flash commands.
    pub block_interval_ms: Option<u64>,
    /// Progress callback granularity, in percent.
    pub percent_increment: Option<u8>,
    /// Flash parameter bits forced into the image header.
    pub flash_params: Option<FlashParams>,
    /// Reboot into the new image when done.
    pub reboot: Option<bool>,
    /// The module is reset into its bootloader by hand.
    pub manual_reset: Option<bool>,
}

impl UploadSection {
    /// Apply the overrides to `base`.
    pub fn apply(&self, mut base: UploadConfig) -> UploadConfig {
        if let Some(rates) = &self.baud_rates {
            base.baud_rates.clone_from(rates);
        }
        if let Some(v) = self.retries_per_baud {
            base.retries_per_baud = v;
        }
        if let Some(v) = self.retries_per_reset {
            base.retries_per_reset = v;
        }
        if let Some(v) = self.sync_timeout_ms {
            base.sync_timeout_ms = v;
        }
        if let Some(v) = self.connect_interval_ms {
            base.connect_interval_ms = v;
        }
        if let Some(v) = self.reset_settle_ms {
            base.reset_settle_ms = v;
        }
        if let Some(v) = self.block_interval_ms {
            base.block_interval_ms = v;
        }
        if let Some(v) = self.percent_increment {
            base.percent_increment = v;
        }
        if let Some(v) = self.flash_params {
            base.flash_params = v;
        }
        if let Some(v) = self.reboot {
            base.reboot = v;
        }
        base
    }

    fn merge(&mut self, other: Self) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            kind,
            baud_rates,
            retries_per_baud,
            retries_per_reset,
            sync_timeout_ms,
            connect_interval_ms,
            reset_settle_ms,
            block_interval_ms,
            percent_increment,
            flash_params,
            reboot,
            manual_reset
        );
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Upload configuration.
    #[serde(default)]
    pub upload: UploadSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "wififlash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        for device in other.port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }
        self.upload.merge(other.upload);
    }

    /// Save a USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        // Keep the local file if the project already has one.
        let path = if Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_CONFIG)
        } else if let Some(global_path) = Self::global_config_path() {
            if let Some(dir) = global_path.parent() {
                fs::create_dir_all(dir)?;
            }
            global_path
        } else {
            PathBuf::from(LOCAL_CONFIG)
        };

        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk.port.usb_device.push(device.clone());
        self.port.usb_device.push(device);

        fs::write(&path, toml::to_string_pretty(&on_disk)?)?;
        info!("Saved USB device to {}", path.display());
        Ok(())
    }
}
