//! Native serial port implementation using the `serialport` crate.
//!
//! Works on every platform `serialport` supports (Linux, macOS, Windows,
//! FreeBSD). Reads are polled through `bytes_to_read`, so the upload engine
//! never blocks waiting for the module.

use {
    crate::{
        error::Result,
        gpio::SerialLineGpio,
        port::{ByteSource, Port, SerialConfig},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    baud_rate: u32,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud",
            config.port_name, config.baud_rate
        );
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Self {
            port,
            name: config.port_name.clone(),
            baud_rate: config.baud_rate,
        })
    }

    /// Open a serial port with default settings.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, baud_rate))
    }

    /// Drive the module's reset and boot-strap pins from this adapter's
    /// RTS and DTR lines.
    ///
    /// The returned handle shares the underlying device, so the lines can
    /// be toggled while the session owns the port.
    pub fn control_lines(&self) -> Result<SerialLineGpio> {
        self.control_lines_with_settle(SerialLineGpio::DEFAULT_SETTLE)
    }

    /// Like [`control_lines`](Self::control_lines) with a custom reset pulse.
    pub fn control_lines_with_settle(&self, settle: Duration) -> Result<SerialLineGpio> {
        let handle = self.port.try_clone()?;
        Ok(SerialLineGpio::new(handle, settle))
    }
}

impl ByteSource for NativePort {
    fn available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.port.bytes_to_read()? == 0 {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(1) => Ok(Some(byte[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Port for NativePort {
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        trace!("TX {} bytes", buf.len());
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn reopen(&mut self, baud_rate: u32) -> Result<()> {
        debug!("Reconfiguring {} at {baud_rate} baud", self.name);
        self.port.set_baud_rate(baud_rate)?;
        self.port.clear(ClearBuffer::All)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
