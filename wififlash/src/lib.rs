//! # wififlash
//!
//! A library for reflashing ESP8266 Wi-Fi modules through their ROM
//! bootloader.
//!
//! This crate provides the complete upload engine used to push a new image
//! into a companion Wi-Fi module over a UART link, including:
//!
//! - SLIP byte framing
//! - The bootloader command/response packet protocol
//! - Multi-baud-rate synchronization
//! - Flash erase, block write and finish sequencing
//! - A polled, non-blocking upload state machine
//!
//! ## Collaborators
//!
//! The engine only talks to the outside world through four small traits:
//! [`Port`] (the UART), [`Clock`] (a monotonic millisecond clock),
//! [`UploadGpio`] (module reset and boot-strap lines) and [`ImageSource`]
//! (the image being written). Native implementations backed by the
//! `serialport` crate are provided under the `native` feature.
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use wififlash::{
//!     Connection, FileImage, NativePort, SerialConfig, SystemClock, UploadConfig, UploadKind,
//!     UploadSession,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     let gpio = port.control_lines()?;
//!     let image = FileImage::open("MksWifi.bin")?;
//!
//!     let connection = Connection::new(port, SystemClock::new());
//!     let mut session = UploadSession::begin(
//!         connection,
//!         gpio,
//!         image,
//!         UploadKind::Firmware.address(),
//!         UploadConfig::default(),
//!     )?
//!     .with_progress(|percent| println!("{percent}% complete"));
//!
//!     let result = session.run_to_completion();
//!     println!("Upload finished: {result}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod device;
pub mod error;
pub mod gpio;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;
pub mod upload;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use {gpio::SerialLineGpio, port::NativePort};
pub use {
    clock::{Clock, ManualClock, SystemClock},
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports, rank_ports},
    error::{Error, Result, ResultCode},
    gpio::{NoGpio, UploadGpio},
    image::{FileImage, ImageInfo, ImageSource, MemoryImage},
    port::{ByteSource, Port, SerialConfig},
    protocol::packet::{Connection, Frame, Opcode, Response},
    target::esp8266::flash::FlashParams,
    upload::{
        DEFAULT_BAUD_RATES, Progress, UploadConfig, UploadKind, UploadSession, UploadState,
        begin_upload,
    },
};
