//! Error types for wififlash.
//!
//! Every [`Error`] collapses onto one [`ResultCode`], the value an upload
//! session freezes when it reaches its terminal state.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::protocol::packet::Opcode;

/// Result type for wififlash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for wififlash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (transport or file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No complete response frame arrived in time.
    #[error("Timeout waiting for {opcode} response after {timeout_ms} ms")]
    Timeout {
        /// Opcode of the command awaiting a reply.
        opcode: Opcode,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Every baud rate and reset attempt was used up without a sync.
    #[error("Could not connect after {attempts} sync attempts")]
    ConnectFailed {
        /// Number of failed sync attempts.
        attempts: u32,
    },

    /// Well-framed reply with an unexpected body.
    #[error("Bad reply: {0}")]
    BadReply(String),

    /// The firmware image could not be read.
    #[error("File read error: {0}")]
    FileRead(String),

    /// The firmware image is empty.
    #[error("Image is empty")]
    EmptyFile,

    /// Reply header did not carry the response marker or the expected opcode.
    #[error("Response header mismatch: direction {direction:#04x}, opcode {opcode:#04x} (expected {expected})")]
    ResponseHeader {
        /// Direction byte received.
        direction: u8,
        /// Opcode byte received.
        opcode: u8,
        /// Opcode that was expected.
        expected: Opcode,
    },

    /// A frame delimiter or invalid escape appeared where data was expected.
    #[error("SLIP frame error: {0}")]
    SlipFrame(String),

    /// The frame reader reached an impossible state.
    #[error("SLIP state error: {0}")]
    SlipState(String),

    /// Frame data ran out part way through a byte or escape sequence.
    #[error("SLIP data error: {0}")]
    SlipData(String),
}

impl Error {
    /// Collapse this error onto its session result code.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::Io(_) => ResultCode::CommWrite,
            #[cfg(feature = "native")]
            Self::Serial(_) => ResultCode::CommWrite,
            Self::Timeout { .. } => ResultCode::Timeout,
            Self::ConnectFailed { .. } => ResultCode::ConnectFailed,
            Self::BadReply(_) => ResultCode::BadReply,
            Self::FileRead(_) => ResultCode::FileReadError,
            Self::EmptyFile => ResultCode::EmptyFile,
            Self::ResponseHeader { .. } => ResultCode::ResponseHeaderError,
            Self::SlipFrame(_) => ResultCode::SlipFrameError,
            Self::SlipState(_) => ResultCode::SlipStateError,
            Self::SlipData(_) => ResultCode::SlipDataError,
        }
    }
}

/// Terminal outcome of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResultCode {
    /// The image was written and the session closed.
    Success,
    /// A reply did not arrive in time.
    Timeout,
    /// Writing to or reading from the transport failed.
    CommWrite,
    /// Baud rate and reset budget exhausted.
    ConnectFailed,
    /// Reply body had an unexpected shape.
    BadReply,
    /// The image source failed mid-read.
    FileReadError,
    /// The image has zero length.
    EmptyFile,
    /// Reply header carried the wrong direction or opcode.
    ResponseHeaderError,
    /// Misplaced frame delimiter or invalid escape.
    SlipFrameError,
    /// Frame reader state machine fault.
    SlipStateError,
    /// Truncated SLIP data.
    SlipDataError,
}

impl ResultCode {
    /// Short description that reads naturally when followed by " error".
    pub fn message(self) -> &'static str {
        match self {
            Self::Success => "no",
            Self::Timeout => "timeout",
            Self::CommWrite => "comm write",
            Self::ConnectFailed => "connect",
            Self::BadReply => "bad reply",
            Self::FileReadError => "file read",
            Self::EmptyFile => "empty file",
            Self::ResponseHeaderError => "response header",
            Self::SlipFrameError => "slip frame",
            Self::SlipStateError => "slip state",
            Self::SlipDataError => "slip data",
        }
    }

    /// Whether this code denotes a successful upload.
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error", self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::EmptyFile.code(), ResultCode::EmptyFile);
        assert_eq!(
            Error::Timeout {
                opcode: Opcode::Sync,
                timeout_ms: 5000
            }
            .code(),
            ResultCode::Timeout
        );
        assert_eq!(
            Error::Io(io::Error::other("gone")).code(),
            ResultCode::CommWrite
        );
        assert_eq!(
            Error::SlipData("escape".into()).code(),
            ResultCode::SlipDataError
        );
    }

    #[test]
    fn test_result_code_display() {
        assert_eq!(ResultCode::Success.to_string(), "no error");
        assert_eq!(ResultCode::SlipFrameError.to_string(), "slip frame error");
        assert_eq!(ResultCode::ConnectFailed.to_string(), "connect error");
        assert!(ResultCode::Success.is_success());
        assert!(!ResultCode::Timeout.is_success());
    }
}
