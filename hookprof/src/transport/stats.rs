//! Transport counters and advisory back-pressure
//!
//! Counters are plain atomics updated from the sender, receiver and
//! producer threads; [`TransportStats::snapshot`] derives rates since the
//! last reset.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct TransportStats {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    peak_outstanding: AtomicU64,
    dropped_frames: AtomicU64,
    oversized_frames: AtomicU64,
    dispatch_misses: AtomicU64,
    session_mismatches: AtomicU64,
    unsent: AtomicU64,
    since: Mutex<Instant>,
}

/// Point-in-time copy of [`TransportStats`] with derived rates
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub peak_outstanding: u64,
    pub dropped_frames: u64,
    pub oversized_frames: u64,
    pub dispatch_misses: u64,
    pub session_mismatches: u64,
    pub unsent: u64,
    pub messages_per_sec: f64,
    pub bytes_per_sec: f64,
}

impl Default for TransportStats {
    fn default() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            peak_outstanding: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            oversized_frames: AtomicU64::new(0),
            dispatch_misses: AtomicU64::new(0),
            session_mismatches: AtomicU64::new(0),
            unsent: AtomicU64::new(0),
            since: Mutex::new(Instant::now()),
        }
    }
}

impl TransportStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Track the deepest outbound queue observed
    pub fn record_outstanding(&self, depth: usize) {
        self.peak_outstanding.fetch_max(depth as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized(&self) {
        self.oversized_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_miss(&self) {
        self.dispatch_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_mismatch(&self) {
        self.session_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Outbound frame discarded because no peer was connected
    pub fn record_unsent(&self) {
        self.unsent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.messages_sent,
            &self.bytes_sent,
            &self.messages_received,
            &self.bytes_received,
            &self.peak_outstanding,
            &self.dropped_frames,
            &self.oversized_frames,
            &self.dispatch_misses,
            &self.session_mismatches,
            &self.unsent,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.since.lock() = Instant::now();
    }

    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.since.lock().elapsed().as_secs_f64().max(1e-3);
        let messages_sent = self.messages_sent.load(Ordering::Relaxed);
        let bytes_sent = self.bytes_sent.load(Ordering::Relaxed);
        StatsSnapshot {
            messages_sent,
            bytes_sent,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            peak_outstanding: self.peak_outstanding.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            oversized_frames: self.oversized_frames.load(Ordering::Relaxed),
            dispatch_misses: self.dispatch_misses.load(Ordering::Relaxed),
            session_mismatches: self.session_mismatches.load(Ordering::Relaxed),
            unsent: self.unsent.load(Ordering::Relaxed),
            messages_per_sec: messages_sent as f64 / elapsed,
            bytes_per_sec: bytes_sent as f64 / elapsed,
        }
    }
}

/// Advisory congestion check: the producer keeps going, but callers that
/// can defer work (new hook categories) wait while this holds.
#[must_use]
pub fn is_congested(outstanding: usize, threshold: usize) -> bool {
    threshold > 0 && outstanding >= threshold
}
