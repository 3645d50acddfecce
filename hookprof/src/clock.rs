//! Monotonic clock and timer arithmetic
//!
//! All capture timestamps are `CLOCK_MONOTONIC` nanoseconds, the same clock
//! bpftrace's `nsecs` reads, so tracer lines and locally produced timers
//! share one time base. Wire timestamps are relative to a [`SessionClock`]
//! epoch.

#![allow(unsafe_code)] // clock_gettime() requires unsafe

use crate::domain::Timestamp;
use hookprof_common::Timer;

pub const NANOS_PER_MICRO: u64 = 1_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Raw monotonic nanoseconds since an unspecified start (boot on Linux)
#[must_use]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC always exists.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    #[allow(clippy::cast_sign_loss)]
    let (secs, nanos) = (ts.tv_sec as u64, ts.tv_nsec as u64);
    secs * 1_000_000_000 + nanos
}

#[must_use]
pub fn ns_to_us(ns: u64) -> u64 {
    ns / NANOS_PER_MICRO
}

#[must_use]
pub fn ns_to_ms(ns: u64) -> u64 {
    ns / NANOS_PER_MILLI
}

/// Nanoseconds as fractional milliseconds, for display and statistics
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn ns_to_ms_f64(ns: u64) -> f64 {
    ns as f64 / NANOS_PER_MILLI as f64
}

/// Capture session time base
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch_ns: u64,
}

impl SessionClock {
    /// Start a new session epoch at the current monotonic time
    #[must_use]
    pub fn start() -> Self {
        Self { epoch_ns: monotonic_ns() }
    }

    /// Session clock anchored at an explicit monotonic timestamp
    #[must_use]
    pub fn with_epoch(epoch_ns: u64) -> Self {
        Self { epoch_ns }
    }

    #[must_use]
    pub fn epoch_ns(&self) -> u64 {
        self.epoch_ns
    }

    /// Nanoseconds elapsed since the epoch
    #[must_use]
    pub fn now(&self) -> Timestamp {
        Timestamp(monotonic_ns().saturating_sub(self.epoch_ns))
    }

    /// Rebase a raw monotonic timestamp onto this session's epoch
    #[must_use]
    pub fn relative(&self, monotonic: u64) -> Timestamp {
        Timestamp(monotonic.saturating_sub(self.epoch_ns))
    }
}

/// Start/stop helpers on the shared [`Timer`] record
pub trait TimerExt {
    fn start_now(&mut self);
    fn stop_now(&mut self);
    fn reset(&mut self);
    fn elapsed_micros(&self) -> u64;
    fn elapsed_millis(&self) -> f64;
}

impl TimerExt for Timer {
    fn start_now(&mut self) {
        self.start = monotonic_ns();
        self.end = 0;
    }

    fn stop_now(&mut self) {
        self.end = monotonic_ns().max(self.start);
    }

    fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn elapsed_micros(&self) -> u64 {
        ns_to_us(self.elapsed_ns())
    }

    fn elapsed_millis(&self) -> f64 {
        ns_to_ms_f64(self.elapsed_ns())
    }
}

/// Adds its lifetime in milliseconds to a caller-owned accumulator on drop
///
/// ```
/// let mut total_ms = 0.0;
/// {
///     let _scope = hookprof::clock::ScopedTimer::new(&mut total_ms);
/// }
/// assert!(total_ms >= 0.0);
/// ```
pub struct ScopedTimer<'a> {
    start_ns: u64,
    accumulator: &'a mut f64,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(accumulator: &'a mut f64) -> Self {
        Self { start_ns: monotonic_ns(), accumulator }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        *self.accumulator += ns_to_ms_f64(monotonic_ns().saturating_sub(self.start_ns));
    }
}
