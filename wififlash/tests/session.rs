//! End-to-end upload sessions against a simulated ESP8266 ROM bootloader.

use std::collections::VecDeque;

use wififlash::protocol::slip;
use wififlash::{
    ByteSource, Connection, FlashParams, Frame, ManualClock, MemoryImage, NoGpio, Opcode, Port,
    Progress, ResultCode, UploadConfig, UploadKind, UploadSession, begin_upload,
};

/// Bootloader that only understands the host at one baud rate and keeps
/// a copy of everything written to flash.
struct SimulatedModule {
    baud: u32,
    accepted_baud: u32,
    rx: VecDeque<u8>,
    pending: Vec<u8>,
    flash: Vec<u8>,
    write_offset: u32,
    erased: Option<(u32, u32)>,
    finished: Option<u32>,
    opcodes: Vec<u8>,
}

impl SimulatedModule {
    fn new(accepted_baud: u32) -> Self {
        Self {
            baud: 115200,
            accepted_baud,
            rx: VecDeque::new(),
            pending: Vec::new(),
            flash: vec![0xFF; 2 * 1024 * 1024],
            write_offset: 0,
            erased: None,
            finished: None,
            opcodes: Vec::new(),
        }
    }

    fn reply(&mut self, opcode: Opcode) {
        let wire = Frame::response(opcode, 0, &[0, 0]).encode().unwrap();
        self.rx.extend(wire);
    }

    fn handle(&mut self, frame: &Frame) {
        self.opcodes.push(frame.opcode);
        let word = |i: usize| u32::from_le_bytes(frame.body[i..i + 4].try_into().unwrap());
        match Opcode::from_u8(frame.opcode) {
            Some(Opcode::Sync) if self.baud == self.accepted_baud => {
                for _ in 0..8 {
                    self.reply(Opcode::Sync);
                }
            }
            Some(Opcode::FlashBegin) => {
                self.erased = Some((word(0), word(12)));
                self.write_offset = word(12);
                self.reply(Opcode::FlashBegin);
            }
            Some(Opcode::FlashData) => {
                let len = word(0) as usize;
                let seq = word(4);
                let data = &frame.body[16..16 + len];
                let check = data.iter().fold(0xEF_u8, |acc, &b| acc ^ b);
                assert_eq!(frame.value, u32::from(check), "checksum of block {seq}");
                let start = (self.write_offset + seq * 1024) as usize;
                self.flash[start..start + len].copy_from_slice(data);
                self.reply(Opcode::FlashData);
            }
            Some(Opcode::FlashEnd) => {
                self.finished = Some(word(0));
                self.reply(Opcode::FlashEnd);
            }
            _ => {}
        }
    }
}

impl ByteSource for SimulatedModule {
    fn available(&mut self) -> wififlash::Result<usize> {
        Ok(self.rx.len())
    }

    fn read_byte(&mut self) -> wififlash::Result<Option<u8>> {
        Ok(self.rx.pop_front())
    }
}

impl Port for SimulatedModule {
    fn write_bytes(&mut self, buf: &[u8]) -> wififlash::Result<()> {
        for &byte in buf {
            if byte != slip::END {
                self.pending.push(byte);
            } else if !self.pending.is_empty() {
                let raw = std::mem::take(&mut self.pending);
                let frame = Frame::parse(&slip::decode(&raw)?)?;
                self.handle(&frame);
            }
        }
        Ok(())
    }

    fn reopen(&mut self, baud_rate: u32) -> wififlash::Result<()> {
        self.baud = baud_rate;
        self.rx.clear();
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn uploads_web_files_at_fallback_baud() {
    let _ = env_logger::builder().is_test(true).try_init();

    let image = test_image(3 * 1024 + 100);
    let conn = Connection::new(SimulatedModule::new(115_200), ManualClock::auto_advancing(5));
    let mut session = begin_upload(
        conn,
        NoGpio,
        MemoryImage::from(image.clone()),
        UploadKind::WebFiles.address(),
        UploadConfig::default(),
    )
    .unwrap();

    assert_eq!(session.run_to_completion(), ResultCode::Success);
    assert_eq!(session.baud_rate(), 115_200);
    assert_eq!(session.failed_syncs(), 6);

    let module = session.connection().port();
    assert_eq!(module.erased, Some((4096, 0x10_0000)));
    assert_eq!(module.finished, Some(0));

    let written = &module.flash[0x10_0000..0x10_0000 + 4 * 1024];
    assert_eq!(&written[..image.len()], &image[..]);
    assert!(written[image.len()..].iter().all(|&b| b == 0));
}

#[test]
fn patches_firmware_header_and_stays_in_bootloader() {
    let mut image = test_image(2048);
    image[0] = 0xE9;
    image[2] = 0x02;
    image[3] = 0x20;

    let config = UploadConfig::default()
        .with_flash_params(FlashParams::new(0x0040, 0x00F0))
        .with_reboot(false);
    let conn = Connection::new(SimulatedModule::new(460_800), ManualClock::auto_advancing(5));
    let mut session = UploadSession::begin(conn, NoGpio, MemoryImage::from(image.clone()), 0, config)
        .unwrap();

    assert_eq!(session.run_to_completion(), ResultCode::Success);
    let module = session.connection().port();
    assert_eq!(&module.flash[..4], &[0xE9, image[1], 0x42, 0x20]);
    assert_eq!(&module.flash[4..2048], &image[4..]);
    assert_eq!(module.finished, Some(1));
    assert_eq!(
        module.opcodes,
        vec![0x08, 0x02, 0x03, 0x03, 0x04]
    );
}

#[test]
fn gives_up_when_module_never_answers() {
    let conn = Connection::new(SimulatedModule::new(9600), ManualClock::auto_advancing(10));
    let mut session = begin_upload(
        conn,
        NoGpio,
        MemoryImage::from(test_image(10)),
        0,
        UploadConfig::default(),
    )
    .unwrap();

    let mut last = Progress::InProgress(0);
    while let Progress::InProgress(_) = last {
        last = session.step();
    }
    assert_eq!(last, Progress::Done(ResultCode::ConnectFailed));
    assert_eq!(session.error().map(|e| e.code()), Some(ResultCode::ConnectFailed));
    assert_eq!(session.step(), Progress::Done(ResultCode::ConnectFailed));
    assert!(session.connection().port().erased.is_none());
}

#[test]
fn refuses_empty_image() {
    let conn = Connection::new(SimulatedModule::new(460_800), ManualClock::new());
    let result = begin_upload(conn, NoGpio, MemoryImage::default(), 0, UploadConfig::default());
    assert!(matches!(result, Err(wififlash::Error::EmptyFile)));
}
