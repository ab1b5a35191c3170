//! SLIP byte framing.
//!
//! Two byte values are reserved on the wire and are replaced by two-byte
//! escape sequences inside a frame:
//!
//! ```text
//! 0xC0  ->  0xDB 0xDC
//! 0xDB  ->  0xDB 0xDD
//! ```
//!
//! A bare `0xC0` delimits frames.

use crate::error::{Error, Result};
use crate::port::ByteSource;
use std::collections::VecDeque;

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Escaped form of [`END`] (after [`ESC`]).
pub const ESC_END: u8 = 0xDC;
/// Escaped form of [`ESC`] (after [`ESC`]).
pub const ESC_ESC: u8 = 0xDD;

/// Outcome of decoding one logical byte from a byte source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlipByte {
    /// A data byte, unescaped.
    Data(u8),
    /// Nothing was buffered.
    Empty,
    /// A frame delimiter arrived where data was expected.
    FrameEnd,
    /// An escape introducer arrived with nothing buffered after it.
    PendingEscape,
    /// An escape introducer was followed by this invalid byte.
    InvalidEscape(u8),
}

/// Append the escaped form of `data` to `out`, without delimiters.
pub fn encode_into(data: &[u8], out: &mut Vec<u8>) {
    out.reserve(data.len());
    for &byte in data {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(byte),
        }
    }
}

/// Escape `data`, without delimiters.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    encode_into(data, &mut out);
    out
}

/// Resolve the byte that followed an [`ESC`].
pub fn unescape(byte: u8) -> SlipByte {
    match byte {
        ESC_END => SlipByte::Data(END),
        ESC_ESC => SlipByte::Data(ESC),
        other => SlipByte::InvalidEscape(other),
    }
}

/// Decode one logical byte from `src`.
pub fn decode_byte<S: ByteSource + ?Sized>(src: &mut S) -> Result<SlipByte> {
    let Some(byte) = src.read_byte()? else {
        return Ok(SlipByte::Empty);
    };
    match byte {
        END => Ok(SlipByte::FrameEnd),
        ESC => match src.read_byte()? {
            Some(next) => Ok(unescape(next)),
            None => Ok(SlipByte::PendingEscape),
        },
        _ => Ok(SlipByte::Data(byte)),
    }
}

/// Unescape a complete frame body (delimiters already stripped).
pub fn decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut src: VecDeque<u8> = data.iter().copied().collect();
    let mut out = Vec::with_capacity(data.len());
    loop {
        match decode_byte(&mut src)? {
            SlipByte::Data(byte) => out.push(byte),
            SlipByte::Empty => return Ok(out),
            SlipByte::FrameEnd => {
                return Err(Error::SlipFrame(format!(
                    "unescaped frame delimiter at offset {}",
                    data.len() - src.len() - 1
                )));
            }
            SlipByte::PendingEscape => {
                return Err(Error::SlipData("escape byte at end of data".into()));
            }
            SlipByte::InvalidEscape(byte) => {
                return Err(Error::SlipFrame(format!(
                    "invalid escape sequence 0xDB {byte:#04x}"
                )));
            }
        }
    }
}
