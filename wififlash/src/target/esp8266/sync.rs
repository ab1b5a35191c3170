//! Baud rate synchronization.

use {
    crate::{
        clock::Clock,
        error::{Error, Result},
        port::Port,
        protocol::packet::{Connection, Opcode, REPLY_BODY_LEN},
    },
    log::{debug, trace},
};

/// Sync command body: four fixed bytes followed by 32 bytes of `0x55`,
/// which the ROM uses to measure the host's bit timing.
pub const SYNC_PAYLOAD: [u8; 36] = {
    let mut payload = [0x55; 36];
    payload[0] = 0x07;
    payload[1] = 0x07;
    payload[2] = 0x12;
    payload[3] = 0x20;
    payload
};

/// Timeout for draining the duplicate replies that follow a good sync.
pub const DRAIN_TIMEOUT_MS: u64 = 500;

/// Non-sync replies tolerated after a sync before giving up.
const MAX_STRAY_REPLIES: usize = 10;

/// Try once to synchronize with the bootloader at the port's current baud
/// rate.
///
/// The ROM answers a good sync several times; once the first reply is in,
/// the rest are drained so they cannot be mistaken for later replies.
pub fn sync<P: Port, C: Clock>(conn: &mut Connection<P, C>, timeout_ms: u64) -> Result<()> {
    let mut result = conn
        .do_command(Opcode::Sync, &SYNC_PAYLOAD, 0, timeout_ms)
        .map(|_| ());

    // Left-over replies to earlier commands may be queued ahead of ours.
    let mut stray = 0;
    while stray < MAX_STRAY_REPLIES && matches!(result, Err(Error::ResponseHeader { .. })) {
        stray += 1;
        trace!("Skipping stray reply {stray} while syncing");
        result = conn.read_response(Opcode::Sync, timeout_ms).map(|_| ());
    }
    result?;

    let mut drained = 0;
    while let Ok(response) = conn.read_response(Opcode::Sync, DRAIN_TIMEOUT_MS) {
        if response.body.len() != REPLY_BODY_LEN {
            break;
        }
        drained += 1;
    }
    debug!(
        "Synced at {} baud, drained {drained} extra replies",
        conn.port().baud_rate()
    );
    Ok(())
}
