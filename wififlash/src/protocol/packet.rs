//! ESP8266 ROM bootloader packets.
//!
//! ## Frame Format
//!
//! Every command and response is one SLIP frame wrapping an 8-byte header
//! and a variable body:
//!
//! ```text
//! +------+-----------+--------+--------+-------------+---------+------+
//! | 0xC0 | Direction | Opcode | Length | Check value |  Body   | 0xC0 |
//! +------+-----------+--------+--------+-------------+---------+------+
//! |  1   |     1     |   1    | 2 (LE) |    4 (LE)   | Length  |  1   |
//! +------+-----------+--------+--------+-------------+---------+------+
//! ```
//!
//! Requests carry direction 0 and responses direction 1. Header and body
//! are SLIP-escaped, except for the sync command which is sent raw.

use {
    crate::{
        clock::Clock,
        error::{Error, Result},
        port::Port,
        protocol::slip::{self, SlipByte},
    },
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    log::trace,
    std::fmt,
};

/// Header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Direction byte of host-to-module packets.
pub const DIRECTION_REQUEST: u8 = 0x00;

/// Direction byte of module-to-host packets.
pub const DIRECTION_RESPONSE: u8 = 0x01;

/// Length of a well-formed command reply body (status, error).
pub const REPLY_BODY_LEN: usize = 2;

/// Bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Prepare flash: erase and announce the block layout.
    FlashBegin = 0x02,
    /// Write one flash block.
    FlashData = 0x03,
    /// Finish flashing, optionally rebooting.
    FlashEnd = 0x04,
    /// Prepare a RAM download.
    MemBegin = 0x05,
    /// Finish a RAM download.
    MemEnd = 0x06,
    /// Write one RAM block.
    MemData = 0x07,
    /// Baud rate synchronization.
    Sync = 0x08,
    /// Write a register.
    WriteReg = 0x09,
    /// Read a register.
    ReadReg = 0x0A,
}

impl Opcode {
    /// Parse an opcode byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::FlashBegin),
            0x03 => Some(Self::FlashData),
            0x04 => Some(Self::FlashEnd),
            0x05 => Some(Self::MemBegin),
            0x06 => Some(Self::MemEnd),
            0x07 => Some(Self::MemData),
            0x08 => Some(Self::Sync),
            0x09 => Some(Self::WriteReg),
            0x0A => Some(Self::ReadReg),
            _ => None,
        }
    }

    /// Whether this command goes out without SLIP escaping.
    pub fn is_raw(self) -> bool {
        self == Self::Sync
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FlashBegin => "FLASH_BEGIN",
            Self::FlashData => "FLASH_DATA",
            Self::FlashEnd => "FLASH_END",
            Self::MemBegin => "MEM_BEGIN",
            Self::MemEnd => "MEM_END",
            Self::MemData => "MEM_DATA",
            Self::Sync => "SYNC",
            Self::WriteReg => "WRITE_REG",
            Self::ReadReg => "READ_REG",
        };
        write!(f, "{name}")
    }
}

/// One decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Direction byte.
    pub direction: u8,
    /// Opcode byte.
    pub opcode: u8,
    /// Check value (checksum for data commands, register value for replies).
    pub value: u32,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Frame {
    /// Host-to-module packet.
    pub fn request(opcode: Opcode, value: u32, body: &[u8]) -> Self {
        Self {
            direction: DIRECTION_REQUEST,
            opcode: opcode as u8,
            value,
            body: body.to_vec(),
        }
    }

    /// Module-to-host packet.
    pub fn response(opcode: Opcode, value: u32, body: &[u8]) -> Self {
        Self {
            direction: DIRECTION_RESPONSE,
            opcode: opcode as u8,
            value,
            body: body.to_vec(),
        }
    }

    /// Build the 8-byte header.
    ///
    /// Bodies longer than `u16::MAX` cannot be described by the header.
    pub fn header(&self) -> Result<[u8; HEADER_LEN]> {
        let len = u16::try_from(self.body.len())
            .map_err(|_| Error::BadReply(format!("body too long: {} bytes", self.body.len())))?;
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.direction;
        header[1] = self.opcode;
        LittleEndian::write_u16(&mut header[2..4], len);
        LittleEndian::write_u32(&mut header[4..8], self.value);
        Ok(header)
    }

    /// Header and body without escaping or delimiters.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = self.header()?;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Complete wire frame: delimiters around the escaped packet.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = self.to_bytes()?;
        let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 8 + 2);
        out.push(slip::END);
        slip::encode_into(&bytes, &mut out);
        out.push(slip::END);
        Ok(out)
    }

    /// Complete wire frame without escaping, as used by the sync command.
    pub fn encode_raw(&self) -> Result<Vec<u8>> {
        let bytes = self.to_bytes()?;
        let mut out = Vec::with_capacity(bytes.len() + 2);
        out.push(slip::END);
        out.extend_from_slice(&bytes);
        out.push(slip::END);
        Ok(out)
    }

    /// Parse an unescaped packet (delimiters stripped).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::SlipData(format!(
                "packet too short: {} bytes",
                bytes.len()
            )));
        }
        let len = LittleEndian::read_u16(&bytes[2..4]) as usize;
        let body = &bytes[HEADER_LEN..];
        if body.len() != len {
            return Err(Error::BadReply(format!(
                "length field {len} does not match body of {} bytes",
                body.len()
            )));
        }
        Ok(Self {
            direction: bytes[0],
            opcode: bytes[1],
            value: LittleEndian::read_u32(&bytes[4..8]),
            body: body.to_vec(),
        })
    }
}

/// Payload of a validated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Check value field of the response header.
    pub value: u32,
    /// Body bytes.
    pub body: Vec<u8>,
}

/// Response reader states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    AwaitingStart,
    Header,
    Body,
    AwaitingEnd,
    Complete,
}

/// Bootloader link: a port plus the clock its timeouts run on.
pub struct Connection<P, C> {
    port: P,
    clock: C,
}

impl<P: Port, C: Clock> Connection<P, C> {
    /// Pair a port with a clock.
    pub fn new(port: P, clock: C) -> Self {
        Self { port, clock }
    }

    /// The underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// The underlying port, mutably.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// The clock timeouts are measured on.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Current time on the connection's clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Take the port and clock back.
    pub fn into_parts(self) -> (P, C) {
        (self.port, self.clock)
    }

    /// Frame and send one command.
    pub fn send_command(&mut self, opcode: Opcode, payload: &[u8], check_value: u32) -> Result<()> {
        let frame = Frame::request(opcode, check_value, payload);
        let wire = if opcode.is_raw() {
            frame.encode_raw()?
        } else {
            frame.encode()?
        };
        trace!(
            "TX {opcode}: {} body bytes, check {check_value:#x}, {} on wire",
            payload.len(),
            wire.len()
        );
        self.port.write_bytes(&wire)
    }

    /// Read one raw frame, failing once `timeout_ms` elapses without a
    /// complete one. Bytes before the opening delimiter are skipped.
    ///
    /// `opcode` only labels the timeout error.
    pub fn read_frame(&mut self, opcode: Opcode, timeout_ms: u64) -> Result<Frame> {
        let start = self.clock.now_ms();
        let mut state = ReadState::AwaitingStart;
        let mut header = [0u8; HEADER_LEN];
        let mut header_len = 0;
        let mut body = Vec::new();
        let mut body_len = 0;
        let mut pending_escape = false;

        while state != ReadState::Complete {
            if self.clock.now_ms().saturating_sub(start) > timeout_ms {
                return Err(Error::Timeout { opcode, timeout_ms });
            }

            if self.port.available()? == 0 {
                std::thread::yield_now();
                continue;
            }

            match state {
                ReadState::AwaitingStart => {
                    if self.port.read_byte()? == Some(slip::END) {
                        state = ReadState::Header;
                    }
                }
                ReadState::Header | ReadState::Body => {
                    // An escape split across reads resumes with its second byte.
                    let decoded = if pending_escape {
                        match self.port.read_byte()? {
                            Some(next) => {
                                pending_escape = false;
                                slip::unescape(next)
                            }
                            None => continue,
                        }
                    } else {
                        slip::decode_byte(&mut self.port)?
                    };
                    let byte = match decoded {
                        SlipByte::Data(byte) => byte,
                        SlipByte::PendingEscape => {
                            pending_escape = true;
                            continue;
                        }
                        SlipByte::Empty => {
                            return Err(Error::SlipData(format!(
                                "ran out of data in {state:?}"
                            )));
                        }
                        SlipByte::FrameEnd => {
                            return Err(Error::SlipFrame(format!(
                                "frame ended early in {state:?} after {} bytes",
                                header_len + body.len()
                            )));
                        }
                        SlipByte::InvalidEscape(byte) => {
                            return Err(Error::SlipFrame(format!(
                                "invalid escape sequence 0xDB {byte:#04x}"
                            )));
                        }
                    };
                    if state == ReadState::Header {
                        header[header_len] = byte;
                        header_len += 1;
                        if header_len == HEADER_LEN {
                            body_len = LittleEndian::read_u16(&header[2..4]) as usize;
                            body.reserve(body_len);
                            state = if body_len == 0 {
                                ReadState::AwaitingEnd
                            } else {
                                ReadState::Body
                            };
                        }
                    } else {
                        body.push(byte);
                        if body.len() == body_len {
                            state = ReadState::AwaitingEnd;
                        }
                    }
                }
                ReadState::AwaitingEnd => match self.port.read_byte()? {
                    Some(slip::END) => state = ReadState::Complete,
                    other => {
                        return Err(Error::SlipFrame(format!(
                            "expected frame end after {body_len}-byte body, got {other:02x?}"
                        )));
                    }
                },
                ReadState::Complete => {
                    return Err(Error::SlipState("reader resumed after completion".into()));
                }
            }
        }

        let frame = Frame {
            direction: header[0],
            opcode: header[1],
            value: LittleEndian::read_u32(&header[4..8]),
            body,
        };
        trace!(
            "RX direction {:#04x} opcode {:#04x}, {} body bytes",
            frame.direction,
            frame.opcode,
            frame.body.len()
        );
        Ok(frame)
    }

    /// Read one response and check it answers `expected`.
    pub fn read_response(&mut self, expected: Opcode, timeout_ms: u64) -> Result<Response> {
        let frame = self.read_frame(expected, timeout_ms)?;
        if frame.direction != DIRECTION_RESPONSE || frame.opcode != expected as u8 {
            return Err(Error::ResponseHeader {
                direction: frame.direction,
                opcode: frame.opcode,
                expected,
            });
        }
        Ok(Response {
            value: frame.value,
            body: frame.body,
        })
    }

    /// Send a command and read its reply, which must carry a status body.
    pub fn do_command(
        &mut self,
        opcode: Opcode,
        payload: &[u8],
        check_value: u32,
        timeout_ms: u64,
    ) -> Result<Response> {
        self.send_command(opcode, payload, check_value)?;
        let response = self.read_response(opcode, timeout_ms)?;
        if response.body.len() != REPLY_BODY_LEN {
            return Err(Error::BadReply(format!(
                "{opcode} reply body is {} bytes, expected {REPLY_BODY_LEN}",
                response.body.len()
            )));
        }
        Ok(response)
    }
}

/// Append a little-endian `u32` to a command body.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.write_u32::<LittleEndian>(value).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::port::mock::MockPort;

    fn connection(port: MockPort) -> Connection<MockPort, ManualClock> {
        Connection::new(port, ManualClock::auto_advancing(1))
    }

    #[test]
    fn test_opcode_from_u8() {
        assert_eq!(Opcode::from_u8(0x08), Some(Opcode::Sync));
        assert_eq!(Opcode::from_u8(0x0A), Some(Opcode::ReadReg));
        assert_eq!(Opcode::from_u8(0x01), None);
        assert_eq!(Opcode::FlashData.to_string(), "FLASH_DATA");
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::request(Opcode::FlashData, 0x1234_5678, &[0u8; 0x0410]);
        assert_eq!(
            frame.header().unwrap(),
            [0x00, 0x03, 0x10, 0x04, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_encoded_frame_has_exactly_two_delimiters() {
        let body = [0xC0, 0x01, 0xDB, 0xC0];
        let wire = Frame::request(Opcode::FlashData, 0xC0C0_C0C0, &body)
            .encode()
            .unwrap();
        assert_eq!(wire.first(), Some(&0xC0));
        assert_eq!(wire.last(), Some(&0xC0));
        assert_eq!(wire.iter().filter(|&&b| b == 0xC0).count(), 2);

        let inner = slip::decode(&wire[1..wire.len() - 1]).unwrap();
        let parsed = Frame::parse(&inner).unwrap();
        assert_eq!(parsed.body, body);
        assert_eq!(parsed.value, 0xC0C0_C0C0);
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let mut bytes = Frame::response(Opcode::Sync, 0, &[0, 0]).to_bytes().unwrap();
        bytes.push(0xAA);
        assert!(matches!(Frame::parse(&bytes), Err(Error::BadReply(_))));
        assert!(matches!(Frame::parse(&[0x01]), Err(Error::SlipData(_))));
    }

    #[test]
    fn test_sync_goes_out_unescaped() {
        let mut conn = connection(MockPort::silent());
        conn.send_command(Opcode::Sync, &[0x07, 0x07, 0x12, 0x20], 0)
            .unwrap();
        assert_eq!(
            conn.port().written,
            vec![0xC0, 0x00, 0x08, 0x04, 0x00, 0, 0, 0, 0, 0x07, 0x07, 0x12, 0x20, 0xC0]
        );
    }

    #[test]
    fn test_do_command_round_trip() {
        let mut conn = connection(MockPort::bootloader());
        let response = conn
            .do_command(Opcode::FlashEnd, &[1, 0, 0, 0], 0, 500)
            .unwrap();
        assert_eq!(response.body, vec![0, 0]);
        assert_eq!(conn.port().frames.len(), 1);
        assert_eq!(conn.port().frames[0].opcode, Opcode::FlashEnd as u8);
    }

    #[test]
    fn test_read_response_skips_leading_noise() {
        let mut port = MockPort::silent();
        port.push_rx(&[0x55, 0x00, 0x12]);
        port.push_frame(&Frame::response(Opcode::Sync, 7, &[0, 0]));
        let mut conn = connection(port);
        let response = conn.read_response(Opcode::Sync, 100).unwrap();
        assert_eq!(response.value, 7);
    }

    #[test]
    fn test_read_response_unescapes_body() {
        let mut port = MockPort::silent();
        port.push_frame(&Frame::response(Opcode::ReadReg, 0xDBC0, &[0xC0, 0xDB]));
        let mut conn = connection(port);
        let response = conn.read_response(Opcode::ReadReg, 100).unwrap();
        assert_eq!(response.value, 0xDBC0);
        assert_eq!(response.body, vec![0xC0, 0xDB]);
    }

    #[test]
    fn test_read_response_timeout() {
        let mut conn = connection(MockPort::silent());
        let err = conn.read_response(Opcode::FlashData, 200).unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                opcode: Opcode::FlashData,
                timeout_ms: 200
            }
        ));
    }

    #[test]
    fn test_read_response_wrong_opcode() {
        let mut port = MockPort::silent();
        port.push_frame(&Frame::response(Opcode::FlashBegin, 0, &[0, 0]));
        let mut conn = connection(port);
        let err = conn.read_response(Opcode::Sync, 100).unwrap_err();
        assert!(matches!(err, Error::ResponseHeader { opcode: 0x02, .. }));
    }

    #[test]
    fn test_read_response_wrong_direction() {
        let mut port = MockPort::silent();
        port.push_frame(&Frame::request(Opcode::Sync, 0, &[0, 0]));
        let mut conn = connection(port);
        let err = conn.read_response(Opcode::Sync, 100).unwrap_err();
        assert!(matches!(err, Error::ResponseHeader { direction: 0x00, .. }));
    }

    #[test]
    fn test_read_response_early_delimiter() {
        let mut port = MockPort::silent();
        port.push_rx(&[0xC0, 0x01, 0x08, 0x02, 0x00, 0xC0, 0x00]);
        let mut conn = connection(port);
        let err = conn.read_response(Opcode::Sync, 100).unwrap_err();
        assert!(matches!(err, Error::SlipFrame(_)));
    }

    #[test]
    fn test_read_response_lone_delimiter_in_body() {
        // Header declares a 2-byte body; the frame closes before it arrives.
        let mut port = MockPort::silent();
        port.push_rx(&[0xC0, 0x01, 0x08, 0x02, 0x00, 0, 0, 0, 0, 0xC0]);
        let mut conn = connection(port);
        let err = conn.read_response(Opcode::Sync, 100).unwrap_err();
        assert!(matches!(err, Error::SlipFrame(_)));
    }

    #[test]
    fn test_read_response_escape_split_across_reads() {
        let mut port = MockPort::silent();
        port.trickle = true;
        port.push_frame(&Frame::response(Opcode::ReadReg, 0xC0DB, &[0xDB, 0xC0, 0, 0]));
        let mut conn = connection(port);
        let response = conn.read_response(Opcode::ReadReg, 1000).unwrap();
        assert_eq!(response.value, 0xC0DB);
        assert_eq!(response.body, vec![0xDB, 0xC0, 0, 0]);
    }

    #[test]
    fn test_read_response_preserves_every_body_length() {
        for len in (2..=1024).step_by(37).chain([1024]) {
            let body: Vec<u8> = (0..len)
                .map(|i| match i % 3 {
                    0 => 0xC0,
                    1 => 0xDB,
                    _ => i as u8,
                })
                .collect();
            let frame = Frame::response(Opcode::FlashData, len as u32, &body);
            assert_eq!(
                LittleEndian::read_u16(&frame.header().unwrap()[2..4]) as usize,
                len
            );

            let mut port = MockPort::silent();
            port.push_frame(&frame);
            let mut conn = connection(port);
            let response = conn.read_response(Opcode::FlashData, 100_000).unwrap();
            assert_eq!(response.value, len as u32, "length {len}");
            assert_eq!(response.body, body, "length {len}");
            assert!(conn.port().rx.is_empty());
        }
    }

    #[test]
    fn test_read_response_invalid_escape() {
        let mut port = MockPort::silent();
        port.push_rx(&[0xC0, 0x01, 0xDB, 0x42]);
        let mut conn = connection(port);
        let err = conn.read_response(Opcode::Sync, 100).unwrap_err();
        assert!(matches!(err, Error::SlipFrame(_)));
    }

    #[test]
    fn test_read_response_missing_end() {
        let mut port = MockPort::silent();
        let mut wire = Frame::response(Opcode::Sync, 0, &[0, 0]).encode().unwrap();
        *wire.last_mut().unwrap() = 0x00;
        port.push_rx(&wire);
        let mut conn = connection(port);
        let err = conn.read_response(Opcode::Sync, 100).unwrap_err();
        assert!(matches!(err, Error::SlipFrame(_)));
    }

    #[test]
    fn test_do_command_rejects_long_body() {
        let port = MockPort::with_responder(|frame| {
            vec![Frame::response(
                Opcode::from_u8(frame.opcode).unwrap(),
                0,
                &[0, 0, 0, 0],
            )]
        });
        let mut conn = connection(port);
        let err = conn
            .do_command(Opcode::FlashBegin, &[0; 16], 0, 100)
            .unwrap_err();
        assert!(matches!(err, Error::BadReply(_)));
    }
}
