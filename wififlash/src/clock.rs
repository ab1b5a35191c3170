//! Monotonic millisecond clocks.
//!
//! Every timeout and pacing decision in the upload engine is made against a
//! [`Clock`], so the whole state machine can be driven from a simulated
//! clock in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond time source.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Simulated clock.
///
/// Clones share the same time, so a test can keep a handle and advance the
/// clock while a session owns another. With a non-zero auto step, every
/// reading moves time forward, which lets polling loops run to their
/// timeouts without real waiting.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    auto_step: u64,
}

impl ManualClock {
    /// Clock frozen at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock that advances by `step_ms` on every reading.
    pub fn auto_advancing(step_ms: u64) -> Self {
        Self {
            now: Arc::default(),
            auto_step: step_ms,
        }
    }

    /// Move time forward.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Current time without advancing.
    pub fn peek(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.fetch_add(self.auto_step, Ordering::SeqCst)
    }
}
