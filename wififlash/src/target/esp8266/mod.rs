//! ESP8266 ROM bootloader support.
//!
//! The ROM bootloader is entered by holding GPIO0 low across a reset. It
//! auto-detects the host's baud rate from the sync command, then accepts
//! flash erase and write commands in 1 KiB blocks.

pub mod flash;
pub mod sync;

pub use flash::{
    BLOCK_SIZE, FlashBegin, FlashParams, block_count, checksum, erase_size, flash_begin,
    flash_end, flash_write_block,
};
pub use sync::{SYNC_PAYLOAD, sync};
