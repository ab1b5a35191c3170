//! Module reset and boot-strap control.
//!
//! The ESP8266 samples GPIO0 at reset: low selects the UART bootloader,
//! high runs the application in flash. Entering upload mode therefore means
//! holding the strap low while pulsing reset; leaving it means releasing the
//! strap and pulsing reset again.

#[cfg(feature = "native")]
use {
    log::{debug, trace},
    std::{thread, time::Duration},
};

use crate::error::Result;

/// Reset/boot-strap control of the Wi-Fi module.
pub trait UploadGpio {
    /// Reset the module into its bootloader.
    fn enter_upload_mode(&mut self) -> Result<()>;

    /// Reset the module back into its application.
    fn leave_upload_mode(&mut self) -> Result<()>;
}

/// No reset wiring; the module is put in bootloader mode by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGpio;

impl UploadGpio for NoGpio {
    fn enter_upload_mode(&mut self) -> Result<()> {
        Ok(())
    }

    fn leave_upload_mode(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<G: UploadGpio + ?Sized> UploadGpio for Box<G> {
    fn enter_upload_mode(&mut self) -> Result<()> {
        (**self).enter_upload_mode()
    }

    fn leave_upload_mode(&mut self) -> Result<()> {
        (**self).leave_upload_mode()
    }
}

/// Reset wiring through a USB-UART adapter's modem lines.
///
/// DTR drives the GPIO0 strap and RTS drives the reset pin, both active
/// when asserted.
#[cfg(feature = "native")]
pub struct SerialLineGpio {
    port: Box<dyn serialport::SerialPort>,
    settle: Duration,
}

#[cfg(feature = "native")]
impl SerialLineGpio {
    /// Reset pulse length used by [`NativePort::control_lines`](crate::NativePort::control_lines).
    pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

    /// Wrap a port handle whose modem lines are wired to the module.
    pub fn new(port: Box<dyn serialport::SerialPort>, settle: Duration) -> Self {
        Self { port, settle }
    }

    fn pulse_reset(&mut self) -> Result<()> {
        trace!("Setting RTS to true");
        self.port.write_request_to_send(true)?;
        thread::sleep(self.settle);
        trace!("Setting RTS to false");
        self.port.write_request_to_send(false)?;
        Ok(())
    }
}

#[cfg(feature = "native")]
impl UploadGpio for SerialLineGpio {
    fn enter_upload_mode(&mut self) -> Result<()> {
        debug!("Resetting module into bootloader");
        self.port.write_data_terminal_ready(true)?;
        self.pulse_reset()
    }

    fn leave_upload_mode(&mut self) -> Result<()> {
        debug!("Resetting module into application");
        self.port.write_data_terminal_ready(false)?;
        self.pulse_reset()
    }
}
