//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a TID where a
//! callstack hash is expected, and make function signatures more expressive.

use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID
///
/// Kernel thread id of a target thread. The synthetic "All threads" entry of
/// a sampling report uses [`Tid::ALL_THREADS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl Tid {
    pub const ALL_THREADS: Tid = Tid(hookprof_common::ALL_THREADS_TID);

    #[must_use]
    pub fn is_all_threads(self) -> bool {
        self == Self::ALL_THREADS
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all_threads() {
            write!(f, "All threads")
        } else {
            write!(f, "TID:{}", self.0)
        }
    }
}

/// Content hash of a callstack
///
/// Stable across runs for the same ordered frames (and thread, for raw
/// stacks), so it can key maps that outlive a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallstackId(pub u64);

impl fmt::Display for CallstackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CS:{:016x}", self.0)
    }
}

/// Timestamp in nanoseconds since the capture session epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Convert to microseconds (integer)
    #[must_use]
    pub fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Convert to milliseconds (f64, display only)
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis())
    }
}
