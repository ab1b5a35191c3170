//! Polled upload session.
//!
//! An [`UploadSession`] walks a Wi-Fi module through one complete reflash:
//!
//! ```text
//!            +-----------+  sync failed, reset budget left
//!            |           |<----------------------+
//!   begin -->| Resetting |                       |
//!            |           |---->+------------+----+
//!            +-----------+     | Connecting |
//!                  |           +------------+
//!     baud rates   |                 | synced
//!      exhausted   |                 v
//!                  |           +------------+   +-----------+
//!                  |           |  Erasing   |-->| Uploading |
//!                  |           +------------+   +-----------+
//!                  v                 |                |
//!            +-----------------------+----------------+
//!            |            Done(result code)           |
//!            +----------------------------------------+
//! ```
//!
//! Each call to [`UploadSession::step`] does at most one unit of work (one
//! sync attempt, one erase command or one block write) and returns. The
//! pacing delays between units are measured on the session's [`Clock`], so
//! `step` never sleeps and can be driven from a host's main loop.

use {
    crate::{
        clock::Clock,
        error::{Error, Result, ResultCode},
        gpio::UploadGpio,
        image::ImageSource,
        port::Port,
        protocol::packet::Connection,
        target::esp8266::{
            flash::{
                BLOCK_SIZE, FlashParams, block_count, erase_size, flash_begin, flash_end,
                flash_write_block,
            },
            sync::sync,
        },
    },
    log::{debug, info, warn},
    std::fmt,
};

/// Baud rates tried in order, fastest first.
pub const DEFAULT_BAUD_RATES: [u32; 4] = [460_800, 230_400, 115_200, 74_880];

/// What is being written, which fixes where it goes in flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum UploadKind {
    /// Module firmware.
    Firmware,
    /// Web-interface firmware bundle.
    WebFirmware,
    /// Web-interface file system.
    WebFiles,
}

impl UploadKind {
    /// Every kind, in display order.
    pub const ALL: [Self; 3] = [Self::Firmware, Self::WebFirmware, Self::WebFiles];

    /// Flash address images of this kind are written to.
    pub fn address(self) -> u32 {
        match self {
            Self::Firmware | Self::WebFirmware => 0x0000_0000,
            Self::WebFiles => 0x0010_0000,
        }
    }

    /// Short name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Firmware => "firmware",
            Self::WebFirmware => "web-firmware",
            Self::WebFiles => "web-files",
        }
    }

    /// Parse a short name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for UploadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct UploadConfig {
    /// Baud rates to try, in order.
    pub baud_rates: Vec<u32>,
    /// Failed syncs at one baud rate before moving to the next.
    pub retries_per_baud: u32,
    /// Failed syncs before resetting the module again. A reset also
    /// happens as soon as a baud rate has used up its retries.
    pub retries_per_reset: u32,
    /// Minimum gap between sync attempts.
    pub connect_interval_ms: u64,
    /// Wait after a reset before the first sync.
    pub reset_settle_ms: u64,
    /// Timeout of one sync attempt.
    pub sync_timeout_ms: u64,
    /// Minimum gap between flash commands.
    pub block_interval_ms: u64,
    /// Progress is reported each time it crosses a multiple of this.
    /// Values outside 1..=100 are clamped.
    pub percent_increment: u8,
    /// Flash parameter bits forced into a bootable image at address 0.
    pub flash_params: FlashParams,
    /// Reboot into the new image when done.
    pub reboot: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            retries_per_baud: 3,
            retries_per_reset: 3,
            connect_interval_ms: 50,
            reset_settle_ms: 500,
            sync_timeout_ms: 5000,
            block_interval_ms: 15,
            percent_increment: 5,
            flash_params: FlashParams::default(),
            reboot: true,
        }
    }
}

impl UploadConfig {
    /// Replace the baud rate ladder.
    #[must_use]
    pub fn with_baud_rates(mut self, baud_rates: impl Into<Vec<u32>>) -> Self {
        self.baud_rates = baud_rates.into();
        self
    }

    /// Force flash parameter bits into the image header.
    #[must_use]
    pub fn with_flash_params(mut self, flash_params: FlashParams) -> Self {
        self.flash_params = flash_params;
        self
    }

    /// Choose whether the module reboots into the new image.
    #[must_use]
    pub fn with_reboot(mut self, reboot: bool) -> Self {
        self.reboot = reboot;
        self
    }

    /// Total sync attempts before giving up.
    pub fn max_sync_attempts(&self) -> u32 {
        self.retries_per_baud()
            .saturating_mul(u32::try_from(self.baud_rates.len()).unwrap_or(u32::MAX))
    }

    fn retries_per_baud(&self) -> u32 {
        self.retries_per_baud.max(1)
    }

    fn retries_per_reset(&self) -> u32 {
        self.retries_per_reset.max(1)
    }

    fn percent_increment(&self) -> u8 {
        self.percent_increment.clamp(1, 100)
    }
}

/// Where a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// About to reset the module and reopen the port.
    Resetting,
    /// Trying to sync.
    Connecting {
        /// Failed syncs since the last reset.
        failures: u32,
    },
    /// Synced; the erase command is next.
    Erasing,
    /// Writing blocks.
    Uploading {
        /// Next percentage to report.
        next_percent: u8,
    },
    /// Finished; the result is frozen.
    Done(ResultCode),
}

/// What [`UploadSession::step`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Still working; percentage of blocks written.
    InProgress(u8),
    /// Finished with this result.
    Done(ResultCode),
}

/// One module reflash.
pub struct UploadSession<P, C, G, I>
where
    P: Port,
    C: Clock,
    G: UploadGpio,
    I: ImageSource,
{
    conn: Connection<P, C>,
    gpio: G,
    image: Option<I>,
    config: UploadConfig,
    state: UploadState,
    image_size: u32,
    address: u32,
    block_index: u32,
    baud_index: usize,
    syncs_at_baud: u32,
    failed_syncs: u32,
    resets: u32,
    last_attempt_ms: u64,
    last_reset_ms: u64,
    percent: u8,
    error: Option<Error>,
    on_progress: Option<Box<dyn FnMut(u8)>>,
}

/// Start an upload of `image` to `address`.
///
/// Fails with [`Error::EmptyFile`] before any I/O if the image is empty.
pub fn begin_upload<P, C, G, I>(
    conn: Connection<P, C>,
    gpio: G,
    image: I,
    address: u32,
    config: UploadConfig,
) -> Result<UploadSession<P, C, G, I>>
where
    P: Port,
    C: Clock,
    G: UploadGpio,
    I: ImageSource,
{
    UploadSession::begin(conn, gpio, image, address, config)
}

impl<P, C, G, I> UploadSession<P, C, G, I>
where
    P: Port,
    C: Clock,
    G: UploadGpio,
    I: ImageSource,
{
    /// Start an upload of `image` to `address`.
    ///
    /// Fails with [`Error::EmptyFile`] before any I/O if the image is empty.
    pub fn begin(
        conn: Connection<P, C>,
        gpio: G,
        image: I,
        address: u32,
        config: UploadConfig,
    ) -> Result<Self> {
        let image_size = image.size();
        if image_size == 0 {
            return Err(Error::EmptyFile);
        }
        info!(
            "Uploading {image_size} bytes ({} blocks) to {address:#x}",
            block_count(image_size)
        );
        Ok(Self {
            conn,
            gpio,
            image: Some(image),
            config,
            state: UploadState::Resetting,
            image_size,
            address,
            block_index: 0,
            baud_index: 0,
            syncs_at_baud: 0,
            failed_syncs: 0,
            resets: 0,
            last_attempt_ms: 0,
            last_reset_ms: 0,
            percent: 0,
            error: None,
            on_progress: None,
        })
    }

    /// Call `callback` with the percentage each time another increment of
    /// the image has been written.
    #[must_use]
    pub fn with_progress(mut self, callback: impl FnMut(u8) + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Do at most one unit of work.
    ///
    /// Once the session is done this keeps returning the same result
    /// without touching the module.
    pub fn step(&mut self) -> Progress {
        match self.state {
            UploadState::Done(code) => return Progress::Done(code),
            UploadState::Resetting => self.reset(),
            UploadState::Connecting { failures } => self.connect(failures),
            UploadState::Erasing => self.erase(),
            UploadState::Uploading { next_percent } => self.write_next_block(next_percent),
        }
        match self.state {
            UploadState::Done(code) => Progress::Done(code),
            _ => Progress::InProgress(self.percent),
        }
    }

    /// Step until done.
    pub fn run_to_completion(&mut self) -> ResultCode {
        loop {
            if let Progress::Done(code) = self.step() {
                return code;
            }
            std::thread::yield_now();
        }
    }

    /// Current state.
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Result, once done.
    pub fn result(&self) -> Option<ResultCode> {
        match self.state {
            UploadState::Done(code) => Some(code),
            _ => None,
        }
    }

    /// Whether the session has finished.
    pub fn is_done(&self) -> bool {
        self.result().is_some()
    }

    /// The error that ended the session, if it failed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Percentage of blocks written.
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Blocks written so far.
    pub fn blocks_written(&self) -> u32 {
        self.block_index
    }

    /// Blocks the image needs.
    pub fn total_blocks(&self) -> u32 {
        block_count(self.image_size)
    }

    /// Failed sync attempts so far.
    pub fn failed_syncs(&self) -> u32 {
        self.failed_syncs
    }

    /// Module resets so far.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Baud rate of the last reset.
    pub fn baud_rate(&self) -> u32 {
        self.conn.port().baud_rate()
    }

    /// Session tuning.
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// The connection, for inspection.
    pub fn connection(&self) -> &Connection<P, C> {
        &self.conn
    }

    /// Take the connection and GPIO back.
    pub fn into_parts(self) -> (Connection<P, C>, G) {
        (self.conn, self.gpio)
    }

    fn elapsed_since(&self, then: u64) -> u64 {
        self.conn.now_ms().saturating_sub(then)
    }

    fn reset(&mut self) {
        // At most one step down the ladder per reset.
        if self.syncs_at_baud >= self.config.retries_per_baud() {
            self.baud_index += 1;
            self.syncs_at_baud = 0;
        }
        let Some(&baud) = self.config.baud_rates.get(self.baud_index) else {
            self.finish(Err(Error::ConnectFailed {
                attempts: self.failed_syncs,
            }));
            return;
        };

        self.resets += 1;
        info!("Resetting module at {baud} baud (reset {})", self.resets);
        if let Err(e) = self.reset_module(baud) {
            self.finish(Err(e));
            return;
        }

        let now = self.conn.now_ms();
        self.last_reset_ms = now;
        self.last_attempt_ms = now;
        self.state = UploadState::Connecting { failures: 0 };
    }

    fn reset_module(&mut self, baud: u32) -> Result<()> {
        self.conn.port_mut().reopen(baud)?;
        self.gpio.enter_upload_mode()?;
        self.conn.port_mut().discard_input()
    }

    fn connect(&mut self, failures: u32) {
        if self.elapsed_since(self.last_attempt_ms) < self.config.connect_interval_ms
            || self.elapsed_since(self.last_reset_ms) < self.config.reset_settle_ms
        {
            return;
        }

        let result = sync(&mut self.conn, self.config.sync_timeout_ms);
        self.last_attempt_ms = self.conn.now_ms();
        match result {
            Ok(()) => {
                info!(
                    "Connected at {} baud after {} failed attempts",
                    self.baud_rate(),
                    self.failed_syncs
                );
                self.state = UploadState::Erasing;
            }
            Err(e) => {
                self.failed_syncs += 1;
                self.syncs_at_baud += 1;
                debug!("Sync attempt {} failed: {e}", self.failed_syncs);
                self.state = self.after_failed_sync(failures + 1);
            }
        }
    }

    /// Stay on this reset until its sync budget, or the baud rate's, is spent.
    fn after_failed_sync(&self, failures: u32) -> UploadState {
        if failures >= self.config.retries_per_reset()
            || self.syncs_at_baud >= self.config.retries_per_baud()
        {
            UploadState::Resetting
        } else {
            UploadState::Connecting { failures }
        }
    }

    fn erase(&mut self) {
        if self.elapsed_since(self.last_attempt_ms) < self.config.block_interval_ms {
            return;
        }

        let size = erase_size(self.image_size, self.address);
        info!("Erasing {size} bytes at {:#x}", self.address);
        match flash_begin(&mut self.conn, self.address, size) {
            Ok(()) => {
                self.block_index = 0;
                self.last_attempt_ms = self.conn.now_ms();
                self.state = UploadState::Uploading {
                    next_percent: self.config.percent_increment(),
                };
            }
            Err(e) => self.finish(Err(e)),
        }
    }

    fn write_next_block(&mut self, mut next_percent: u8) {
        if self.elapsed_since(self.last_attempt_ms) < self.config.block_interval_ms {
            return;
        }

        let total = self.total_blocks();
        if self.block_index >= total {
            let result = flash_end(&mut self.conn, self.config.reboot);
            self.finish(result);
            return;
        }

        let result = self.read_block().and_then(|data| {
            flash_write_block(
                &mut self.conn,
                self.block_index,
                self.address,
                &data,
                self.config.flash_params,
            )
        });
        self.last_attempt_ms = self.conn.now_ms();
        if let Err(e) = result {
            self.finish(Err(e));
            return;
        }

        self.block_index += 1;
        self.percent = u8::try_from(u64::from(self.block_index) * 100 / u64::from(total))
            .unwrap_or(100);
        if self.percent >= next_percent {
            debug!("Upload {}% ({}/{total} blocks)", self.percent, self.block_index);
            if let Some(callback) = self.on_progress.as_mut() {
                callback(self.percent);
            }
            let step = self.config.percent_increment();
            while next_percent <= self.percent && next_percent < u8::MAX - step {
                next_percent += step;
            }
        }
        self.state = UploadState::Uploading { next_percent };
    }

    fn read_block(&mut self) -> Result<Vec<u8>> {
        let offset = self.block_index * BLOCK_SIZE as u32;
        let expected = (self.image_size - offset).min(BLOCK_SIZE as u32) as usize;
        let image = self
            .image
            .as_mut()
            .ok_or_else(|| Error::FileRead("image already released".into()))?;

        let mut buf = vec![0u8; expected];
        let n = image.read(offset, &mut buf)?;
        if n < expected {
            return Err(Error::FileRead(format!(
                "short read at offset {offset}: {n} of {expected} bytes"
            )));
        }
        Ok(buf)
    }

    fn finish(&mut self, result: Result<()>) {
        let code = match result {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                warn!("Upload failed: {e}");
                let code = e.code();
                self.error = Some(e);
                code
            }
        };

        self.image = None;
        if let Err(e) = self.gpio.leave_upload_mode() {
            warn!("Failed to reset module into its application: {e}");
        }
        info!("Upload finished: {code}");
        self.state = UploadState::Done(code);
    }
}
