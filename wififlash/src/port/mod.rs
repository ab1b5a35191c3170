//! Port abstraction for the module's UART link.
//!
//! The upload engine never blocks on reads: it asks how many bytes are
//! buffered, takes them one at a time, and interleaves its own timeout
//! checks. Writes are blocking.
//!
//! ```text
//! +--------------------+
//! |   Upload session   |
//! | (sync, flash, ...) |
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! |  Packet protocol   |
//! |   + SLIP codec     |
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! |    Port trait      |
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! | Native SerialPort  |
//! |   (serialport)     |
//! +--------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use wififlash::port::Port;
//!
//! fn drain<P: Port>(port: &mut P) -> wififlash::Result<Vec<u8>> {
//!     let mut out = Vec::new();
//!     while let Some(byte) = port.read_byte()? {
//!         out.push(byte);
//!     }
//!     Ok(out)
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate the port is first opened at.
    pub baud_rate: u32,
    /// Timeout for blocking writes and single-byte reads.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Non-blocking source of received bytes.
pub trait ByteSource {
    /// Number of bytes currently buffered.
    fn available(&mut self) -> Result<usize>;

    /// Take one buffered byte, or `None` if nothing is buffered.
    fn read_byte(&mut self) -> Result<Option<u8>>;
}

impl ByteSource for VecDeque<u8> {
    fn available(&mut self) -> Result<usize> {
        Ok(self.len())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.pop_front())
    }
}

/// Duplex byte link to the module's bootloader.
pub trait Port: ByteSource + Send {
    /// Write a contiguous buffer, blocking until it is handed to the driver.
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Write a single byte.
    fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write_bytes(&[byte])
    }

    /// Reconfigure the link at a new baud rate, discarding buffered input.
    fn reopen(&mut self, baud_rate: u32) -> Result<()>;

    /// Current baud rate.
    fn baud_rate(&self) -> u32;

    /// Port name/path.
    fn name(&self) -> &str;

    /// Drop every byte currently buffered.
    fn discard_input(&mut self) -> Result<()> {
        while self.read_byte()?.is_some() {}
        Ok(())
    }
}

// Re-export the native implementation
#[cfg(feature = "native")]
pub use native::NativePort;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert!(config.port_name.is_empty());
    }

    #[test]
    fn test_serial_config_builder() {
        let config =
            SerialConfig::new("/dev/ttyUSB0", 460800).with_timeout(Duration::from_millis(20));

        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 460800);
        assert_eq!(config.timeout, Duration::from_millis(20));
    }

    #[test]
    fn test_vecdeque_byte_source() {
        let mut src: VecDeque<u8> = vec![1, 2].into();
        assert_eq!(src.available().unwrap(), 2);
        assert_eq!(src.read_byte().unwrap(), Some(1));
        assert_eq!(src.read_byte().unwrap(), Some(2));
        assert_eq!(src.read_byte().unwrap(), None);
    }
}
