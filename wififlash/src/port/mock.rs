//! Scripted bootloader double for unit tests.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::port::{ByteSource, Port};
use crate::protocol::packet::{Frame, Opcode};
use crate::protocol::slip;

type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

/// In-memory port that parses every frame the host writes and queues the
/// responder's replies for reading.
pub(crate) struct MockPort {
    pub rx: VecDeque<u8>,
    pub written: Vec<u8>,
    pub frames: Vec<Frame>,
    pub baud_history: Vec<u32>,
    /// Writes fail once this many frames have been received.
    pub fail_writes_after: Option<usize>,
    /// Hand out one byte per `available` call.
    pub trickle: bool,
    budget: usize,
    pending: Vec<u8>,
    baud: u32,
    responder: Responder,
}

impl MockPort {
    pub fn with_responder(responder: impl FnMut(&Frame) -> Vec<Frame> + Send + 'static) -> Self {
        Self {
            rx: VecDeque::new(),
            written: Vec::new(),
            frames: Vec::new(),
            baud_history: Vec::new(),
            fail_writes_after: None,
            trickle: false,
            budget: 0,
            pending: Vec::new(),
            baud: 115200,
            responder: Box::new(responder),
        }
    }

    /// Never answers.
    pub fn silent() -> Self {
        Self::with_responder(|_| Vec::new())
    }

    /// Acknowledges every command with a success status.
    pub fn bootloader() -> Self {
        Self::with_responder(|frame| match Opcode::from_u8(frame.opcode) {
            Some(opcode) => vec![Frame::response(opcode, 0, &[0, 0])],
            None => Vec::new(),
        })
    }

    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    pub fn push_frame(&mut self, frame: &Frame) {
        let wire = frame.encode().unwrap();
        self.rx.extend(wire);
    }

    /// Frames written with the given opcode.
    pub fn sent(&self, opcode: Opcode) -> Vec<&Frame> {
        self.frames
            .iter()
            .filter(|f| f.opcode == opcode as u8)
            .collect()
    }

    fn complete_frame(&mut self) {
        let raw = std::mem::take(&mut self.pending);
        let frame = slip::decode(&raw)
            .and_then(|bytes| Frame::parse(&bytes))
            .unwrap();
        for reply in (self.responder)(&frame) {
            let wire = reply.encode().unwrap();
            self.rx.extend(wire);
        }
        self.frames.push(frame);
    }
}

impl ByteSource for MockPort {
    fn available(&mut self) -> Result<usize> {
        if self.trickle {
            self.budget = self.rx.len().min(1);
            return Ok(self.budget);
        }
        Ok(self.rx.len())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.trickle {
            if self.budget == 0 {
                return Ok(None);
            }
            self.budget -= 1;
        }
        Ok(self.rx.pop_front())
    }
}

impl Port for MockPort {
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self
            .fail_writes_after
            .is_some_and(|limit| self.frames.len() >= limit)
        {
            return Err(Error::Io(std::io::Error::other("write failed")));
        }
        self.written.extend_from_slice(buf);
        for &byte in buf {
            if byte == slip::END {
                if !self.pending.is_empty() {
                    self.complete_frame();
                }
            } else {
                self.pending.push(byte);
            }
        }
        Ok(())
    }

    fn reopen(&mut self, baud_rate: u32) -> Result<()> {
        self.baud = baud_rate;
        self.baud_history.push(baud_rate);
        self.rx.clear();
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn name(&self) -> &str {
        "mock"
    }
}
