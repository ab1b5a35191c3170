//! Flash erase, block write and finish commands.
//!
//! ## FLASH_BEGIN body
//!
//! ```text
//! +-----------+-------------+------------+--------------+
//! | Erase len | Block count | Block size | Flash offset |
//! +-----------+-------------+------------+--------------+
//! |  4 (LE)   |   4 (LE)    |   4 (LE)   |    4 (LE)    |
//! +-----------+-------------+------------+--------------+
//! ```
//!
//! ## FLASH_DATA body
//!
//! ```text
//! +-------------+----------+---------+---------+------------------+
//! | Data length | Sequence | Padding | Padding |    Block data    |
//! +-------------+----------+---------+---------+------------------+
//! |   4 (LE)    |  4 (LE)  |    4    |    4    |   1024 bytes     |
//! +-------------+----------+---------+---------+------------------+
//! ```

use {
    crate::{
        clock::Clock,
        error::{Error, Result},
        port::Port,
        protocol::packet::{Connection, Opcode, put_u32},
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, warn},
};

/// Flash write block size.
pub const BLOCK_SIZE: usize = 1024;

/// First byte of a bootable ESP8266 image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Seed of the block checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Flash erase sector size.
pub const SECTOR_SIZE: u32 = 4096;

/// Sectors per erase block.
pub const SECTORS_PER_BLOCK: u32 = 16;

/// Timeout for commands that do no flash work.
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Timeout for FLASH_BEGIN when it has to erase.
pub const ERASE_TIMEOUT_MS: u64 = 15_000;

/// Timeout for each FLASH_DATA attempt.
pub const BLOCK_WRITE_TIMEOUT_MS: u64 = 200;

/// Attempts per FLASH_DATA block.
pub const MAX_BLOCK_WRITE_ATTEMPTS: usize = 3;

/// Length of the FLASH_DATA header that precedes the block bytes.
const DATA_HEADER_LEN: usize = 16;

/// Flash mode/size/frequency bits to force into an image header.
///
/// Bytes 2..4 of a bootable image describe the flash chip. When `mask` is
/// non-zero, the masked bits of that little-endian field are replaced by
/// the matching bits of `value` as the first block is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashParams {
    /// Replacement bits.
    pub value: u16,
    /// Bits to replace.
    pub mask: u16,
}

impl FlashParams {
    /// Replace the bits selected by `mask` with `value`.
    pub fn new(value: u16, mask: u16) -> Self {
        Self { value, mask }
    }

    /// Whether any bits would be replaced.
    pub fn is_active(self) -> bool {
        self.mask != 0
    }

    /// Patch an image's first block in place. Returns whether it changed.
    pub fn apply(self, block: &mut [u8]) -> bool {
        if !self.is_active() || block.len() < 4 || block[0] != IMAGE_MAGIC {
            return false;
        }
        let current = LittleEndian::read_u16(&block[2..4]);
        let patched = (current & !self.mask) | self.value;
        LittleEndian::write_u16(&mut block[2..4], patched);
        debug!("Flash parameters {current:#06x} -> {patched:#06x}");
        true
    }
}

/// FLASH_BEGIN parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashBegin {
    /// Bytes to erase.
    pub size: u32,
    /// Number of blocks announced.
    pub blocks: u32,
    /// Block size.
    pub block_size: u32,
    /// Flash offset, aligned down to the block size.
    pub offset: u32,
}

impl FlashBegin {
    /// Layout for erasing `size` bytes at `address`.
    pub fn new(address: u32, size: u32) -> Self {
        Self {
            size,
            blocks: block_count(size),
            block_size: BLOCK_SIZE as u32,
            offset: align_to_block(address),
        }
    }

    /// Command body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16);
        put_u32(&mut body, self.size);
        put_u32(&mut body, self.blocks);
        put_u32(&mut body, self.block_size);
        put_u32(&mut body, self.offset);
        body
    }

    /// Erasing takes a while, an empty begin does not.
    pub fn timeout_ms(&self) -> u64 {
        if self.size > 0 {
            ERASE_TIMEOUT_MS
        } else {
            DEFAULT_TIMEOUT_MS
        }
    }
}

/// Blocks needed to hold `size` bytes.
pub fn block_count(size: u32) -> u32 {
    size.div_ceil(BLOCK_SIZE as u32)
}

/// Round `address` down to a block boundary.
pub fn align_to_block(address: u32) -> u32 {
    address & !(BLOCK_SIZE as u32 - 1)
}

/// XOR fold of `data` seeded with [`CHECKSUM_SEED`].
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_SEED, |acc, &b| acc ^ b)
}

/// Erase length to announce for an image of `size` bytes at `address`.
///
/// The ESP8266 ROM erases roughly twice the requested length when the
/// region starts mid-block, so the request is shrunk to compensate.
pub fn erase_size(size: u32, address: u32) -> u32 {
    let sectors = size.div_ceil(SECTOR_SIZE);
    let start_sector = address / SECTOR_SIZE;
    let head = (SECTORS_PER_BLOCK - start_sector % SECTORS_PER_BLOCK).min(sectors);
    if sectors < 2 * head {
        sectors.div_ceil(2) * SECTOR_SIZE
    } else {
        (sectors - head) * SECTOR_SIZE
    }
}

/// Announce an erase of `size` bytes at `address`.
pub fn flash_begin<P: Port, C: Clock>(
    conn: &mut Connection<P, C>,
    address: u32,
    size: u32,
) -> Result<()> {
    let begin = FlashBegin::new(address, size);
    debug!(
        "FLASH_BEGIN: {} bytes, {} blocks at {:#x}",
        begin.size, begin.blocks, begin.offset
    );
    conn.do_command(
        Opcode::FlashBegin,
        &begin.to_bytes(),
        0,
        begin.timeout_ms(),
    )?;
    Ok(())
}

/// Write block `index` of an image destined for `address`.
///
/// `data` holds at most [`BLOCK_SIZE`] bytes; a short final block is
/// zero-padded. The first block of an image written at address 0 gets its
/// flash parameters patched. Up to [`MAX_BLOCK_WRITE_ATTEMPTS`] tries are
/// made before the last error is returned.
pub fn flash_write_block<P: Port, C: Clock>(
    conn: &mut Connection<P, C>,
    index: u32,
    address: u32,
    data: &[u8],
    params: FlashParams,
) -> Result<()> {
    if data.len() > BLOCK_SIZE {
        return Err(Error::FileRead(format!(
            "block {index} holds {} bytes, more than {BLOCK_SIZE}",
            data.len()
        )));
    }

    let mut body = Vec::with_capacity(DATA_HEADER_LEN + BLOCK_SIZE);
    put_u32(&mut body, BLOCK_SIZE as u32);
    put_u32(&mut body, index);
    put_u32(&mut body, 0);
    put_u32(&mut body, 0);
    body.extend_from_slice(data);
    body.resize(DATA_HEADER_LEN + BLOCK_SIZE, 0);

    if index == 0 && address == 0 {
        params.apply(&mut body[DATA_HEADER_LEN..]);
    }
    let check = u32::from(checksum(&body[DATA_HEADER_LEN..]));

    let mut last_error = None;
    for attempt in 1..=MAX_BLOCK_WRITE_ATTEMPTS {
        match conn.do_command(Opcode::FlashData, &body, check, BLOCK_WRITE_TIMEOUT_MS) {
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!("Block {index} write attempt {attempt}/{MAX_BLOCK_WRITE_ATTEMPTS} failed: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(Error::Timeout {
        opcode: Opcode::FlashData,
        timeout_ms: BLOCK_WRITE_TIMEOUT_MS,
    }))
}

/// Close the flash session. With `reboot`, the module restarts into the
/// new image; otherwise it stays in the bootloader.
pub fn flash_end<P: Port, C: Clock>(conn: &mut Connection<P, C>, reboot: bool) -> Result<()> {
    let mut body = Vec::with_capacity(4);
    put_u32(&mut body, u32::from(!reboot));
    debug!("FLASH_END (reboot: {reboot})");
    conn.do_command(Opcode::FlashEnd, &body, 0, DEFAULT_TIMEOUT_MS)?;
    Ok(())
}
