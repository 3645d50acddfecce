//! Capture transport
//!
//! Reliable, ordered, typed frames between the profiler and the stub:
//! - `frame`: wire layout and incremental decoding
//! - `dispatch`: session filtering and type-indexed callbacks
//! - `stats`: counters and advisory back-pressure
//! - `tcp`: the socket link with its sender/receiver/acceptor threads

pub mod dispatch;
pub mod frame;
pub mod stats;
pub mod tcp;

pub use dispatch::{Dispatch, Dispatcher, MAIN_THREAD_QUEUE_CAPACITY};
pub use frame::{decode_addresses, encode_addresses, ContextSwitch, FrameDecoder, Header, Message};
pub use stats::{is_congested, StatsSnapshot, TransportStats};
pub use tcp::{ConnectionEvent, TcpTransport};

/// Outbound half of a capture link
///
/// The session and the instrumentation controller only ever send through
/// this seam, so tests can substitute an in-memory link.
pub trait Link: Send + Sync {
    /// Queue a frame; never blocks
    fn send(&self, message: Message);

    fn has_connection(&self) -> bool;

    /// Frames queued but not yet written
    fn outstanding(&self) -> usize {
        0
    }

    fn disconnect(&self) {}
}
