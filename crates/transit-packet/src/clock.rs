//! # Monotonic Timestamp Clock
//!
//! Packet timestamps are microseconds on a process-wide monotonic clock.
//! The epoch is taken on first use, so values are only comparable within
//! one process.

use once_cell::sync::Lazy;
use quanta::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Current monotonic time in microseconds.
pub fn now_us() -> u64 {
    Instant::now().duration_since(*EPOCH).as_micros() as u64
}
