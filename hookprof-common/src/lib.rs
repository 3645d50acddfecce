//! # Shared Wire Types (Stub ↔ Profiler)
//!
//! Defines the records and constants shared between the injected stub that
//! runs inside the target and the profiler host. Every record that crosses
//! the capture link has a fixed little-endian encoding so both sides agree
//! on layout without depending on the host compiler's struct packing.
//!
//! ## Key Types
//!
//! - [`Timer`] - One instrumented function invocation
//! - [`MessageType`] - Frame type tag carried by every transport frame
//! - [`FunctionKind`] - Hook category derived from a function's pretty name
//! - [`TimerKind`] - Category of an emitted [`Timer`]
//! - [`DataTransferKind`] - Payload class of a `GetData` / `SetData` reply
//!
//! ## Frame Layout
//!
//! ```text
//! ┌──────────┬────────────┬──────────────┬──────────────────┬─────────────┐
//! │ type u16 │ session u32│ payload u32  │ header block[24] │ payload ... │
//! └──────────┴────────────┴──────────────┴──────────────────┴─────────────┘
//! ```

#![no_std]

// ============================================================================
// Protocol Constants
// ============================================================================

/// Default TCP port the profiler listens on for the stub connection
pub const DEFAULT_CAPTURE_PORT: u16 = 1789;

/// Size of the fixed frame prefix: `type u16 | session-id u32 | payload-size u32`
pub const FRAME_PREFIX_SIZE: usize = 10;

/// Size of the per-type fixed header block that follows the prefix
///
/// Large enough for the widest header variant (`OrbitUnrealInfo`).
pub const HEADER_BLOCK_SIZE: usize = 24;

/// Largest payload a single frame may carry (64 MiB)
///
/// Frames announcing a larger payload are skipped by the receiver and
/// counted as oversized.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Encoded size of a [`Timer`] payload
pub const TIMER_WIRE_SIZE: usize = 48;

/// Default maximum number of frames captured per stack walk
pub const DEFAULT_MAX_STACK_DEPTH: usize = 64;

/// Seed used for every content hash (function names, callstacks)
pub const HASH_SEED: u64 = 0xBADD_CAFE_DEAD_10CC;

/// Thread id of the synthetic "All threads" sampling entry
pub const ALL_THREADS_TID: u32 = u32::MAX;

// ============================================================================
// Message Types
// ============================================================================

/// Frame type tag
///
/// The numeric values are part of the wire format and must never be
/// reordered; new types are appended at the end.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Announces the session id that all following frames carry
    NewSession = 1,
    StartCapture = 2,
    StopCapture = 3,
    /// Address list of plain function hooks
    FunctionHook = 4,
    FunctionHookZoneStart = 5,
    FunctionHookZoneStop = 6,
    FunctionHookOutputDebugString = 7,
    FunctionHookUnrealActor = 8,
    FunctionHookAlloc = 9,
    FunctionHookFree = 10,
    FunctionHookRealloc = 11,
    FunctionHookOrbitData = 12,
    /// Per-function argument read descriptors
    ArgTracking = 13,
    ClearArgTracking = 14,
    Timer = 15,
    CallStack = 16,
    HashedCallStack = 17,
    ContextSwitch = 18,
    GetData = 19,
    SetData = 20,
    WaitLoop = 21,
    ThawMainThread = 22,
    SavedContext = 23,
    RemoteProcessRequest = 24,
    OrbitUnrealInfo = 25,
    ValidateFramepointer = 26,
}

impl MessageType {
    /// Every known message type, in wire order
    pub const ALL: [MessageType; 26] = [
        MessageType::NewSession,
        MessageType::StartCapture,
        MessageType::StopCapture,
        MessageType::FunctionHook,
        MessageType::FunctionHookZoneStart,
        MessageType::FunctionHookZoneStop,
        MessageType::FunctionHookOutputDebugString,
        MessageType::FunctionHookUnrealActor,
        MessageType::FunctionHookAlloc,
        MessageType::FunctionHookFree,
        MessageType::FunctionHookRealloc,
        MessageType::FunctionHookOrbitData,
        MessageType::ArgTracking,
        MessageType::ClearArgTracking,
        MessageType::Timer,
        MessageType::CallStack,
        MessageType::HashedCallStack,
        MessageType::ContextSwitch,
        MessageType::GetData,
        MessageType::SetData,
        MessageType::WaitLoop,
        MessageType::ThawMainThread,
        MessageType::SavedContext,
        MessageType::RemoteProcessRequest,
        MessageType::OrbitUnrealInfo,
        MessageType::ValidateFramepointer,
    ];

    /// Decode a wire tag, `None` for unknown values
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as u16 == value)
    }

    /// Whether frames of this type carry a data-transfer header
    #[must_use]
    pub fn is_data_transfer(self) -> bool {
        matches!(self, MessageType::GetData | MessageType::SetData)
    }

    /// Whether frames of this type carry an address list of hooks to install
    #[must_use]
    pub fn is_function_hook(self) -> bool {
        (MessageType::FunctionHook as u16..=MessageType::FunctionHookOrbitData as u16)
            .contains(&(self as u16))
    }
}

// ============================================================================
// Function Kinds
// ============================================================================

/// Hook category of a function, derived from its pretty name
///
/// Anything other than [`FunctionKind::None`] is hooked on every capture even
/// when the user did not select the function.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum FunctionKind {
    #[default]
    None = 0,
    TimerStart = 1,
    TimerStop = 2,
    TimerStartAsync = 3,
    TimerStopAsync = 4,
    TrackInt = 5,
    TrackInt64 = 6,
    TrackUint = 7,
    TrackUint64 = 8,
    TrackFloat = 9,
    TrackDouble = 10,
    TrackFloatAsInt = 11,
    TrackDoubleAsInt64 = 12,
    Log = 13,
    OutputDebugString = 14,
    UnrealActor = 15,
    Alloc = 16,
    Free = 17,
    Realloc = 18,
    OrbitData = 19,
}

/// Prefix of the manual instrumentation API in pretty names
pub const TRACING_API_PREFIX: &str = "orbit_api::";

/// Marker → kind table for names under [`TRACING_API_PREFIX`]
///
/// Longer markers come first so `StartAsync(` wins over `Start(`, and
/// `TrackInt64(` over `TrackInt(`.
const API_MARKERS: [(&str, FunctionKind); 12] = [
    ("StartAsync(", FunctionKind::TimerStartAsync),
    ("StopAsync(", FunctionKind::TimerStopAsync),
    ("TrackDoubleAsInt64(", FunctionKind::TrackDoubleAsInt64),
    ("TrackFloatAsInt(", FunctionKind::TrackFloatAsInt),
    ("TrackUint64(", FunctionKind::TrackUint64),
    ("TrackInt64(", FunctionKind::TrackInt64),
    ("TrackDouble(", FunctionKind::TrackDouble),
    ("TrackFloat(", FunctionKind::TrackFloat),
    ("TrackUint(", FunctionKind::TrackUint),
    ("TrackInt(", FunctionKind::TrackInt),
    ("Start(", FunctionKind::TimerStart),
    ("Stop(", FunctionKind::TimerStop),
];

impl FunctionKind {
    /// Derive the hook category from a pretty name
    ///
    /// ```
    /// use hookprof_common::FunctionKind;
    /// assert_eq!(FunctionKind::detect("orbit_api::Start(char const*)"), FunctionKind::TimerStart);
    /// assert_eq!(FunctionKind::detect("OrbitLog"), FunctionKind::Log);
    /// assert_eq!(FunctionKind::detect("main"), FunctionKind::None);
    /// ```
    #[must_use]
    pub fn detect(pretty_name: &str) -> Self {
        if let Some(rest) = pretty_name.strip_prefix(TRACING_API_PREFIX) {
            for (marker, kind) in API_MARKERS {
                if rest.contains(marker) {
                    return kind;
                }
            }
            return FunctionKind::None;
        }

        match pretty_name {
            "OrbitStart" => FunctionKind::TimerStart,
            "OrbitStop" => FunctionKind::TimerStop,
            "OrbitLog" => FunctionKind::Log,
            "OutputDebugStringA" => FunctionKind::OutputDebugString,
            "OrbitSendData" => FunctionKind::OrbitData,
            _ => FunctionKind::None,
        }
    }

    /// Whether this kind is one of the value-tracking variants
    #[must_use]
    pub fn is_tracking(self) -> bool {
        (FunctionKind::TrackInt as u8..=FunctionKind::TrackDoubleAsInt64 as u8)
            .contains(&(self as u8))
    }

    /// Hook message that installs functions of this kind
    ///
    /// Async zones share the zone hooks; value tracking and log calls are
    /// installed as data hooks and read their arguments in the stub.
    #[must_use]
    pub fn hook_message(self) -> MessageType {
        match self {
            FunctionKind::None => MessageType::FunctionHook,
            FunctionKind::TimerStart | FunctionKind::TimerStartAsync => {
                MessageType::FunctionHookZoneStart
            }
            FunctionKind::TimerStop | FunctionKind::TimerStopAsync => {
                MessageType::FunctionHookZoneStop
            }
            FunctionKind::Log | FunctionKind::OutputDebugString => {
                MessageType::FunctionHookOutputDebugString
            }
            FunctionKind::UnrealActor => MessageType::FunctionHookUnrealActor,
            FunctionKind::Alloc => MessageType::FunctionHookAlloc,
            FunctionKind::Free => MessageType::FunctionHookFree,
            FunctionKind::Realloc => MessageType::FunctionHookRealloc,
            FunctionKind::OrbitData
            | FunctionKind::TrackInt
            | FunctionKind::TrackInt64
            | FunctionKind::TrackUint
            | FunctionKind::TrackUint64
            | FunctionKind::TrackFloat
            | FunctionKind::TrackDouble
            | FunctionKind::TrackFloatAsInt
            | FunctionKind::TrackDoubleAsInt64 => MessageType::FunctionHookOrbitData,
        }
    }
}

// ============================================================================
// Timer Record
// ============================================================================

/// Category of an emitted [`Timer`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimerKind {
    #[default]
    Function = 0,
    ZoneStart = 1,
    ZoneStop = 2,
    Alloc = 3,
    Free = 4,
    Realloc = 5,
    OrbitData = 6,
    OutputDebugString = 7,
}

impl TimerKind {
    /// Decode a wire tag, unknown values fall back to [`TimerKind::Function`]
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => TimerKind::ZoneStart,
            2 => TimerKind::ZoneStop,
            3 => TimerKind::Alloc,
            4 => TimerKind::Free,
            5 => TimerKind::Realloc,
            6 => TimerKind::OrbitData,
            7 => TimerKind::OutputDebugString,
            _ => TimerKind::Function,
        }
    }
}

/// One instrumented function invocation
///
/// Born when an entry record arrives, completed when the matching exit
/// arrives. Timestamps are nanoseconds since the capture session epoch.
///
/// **Invariant**: `end >= start` once closed. `depth` is the number of open
/// ancestor timers on the same thread at entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timer {
    /// Virtual address of the function in the target (the function key)
    pub function_address: u64,

    /// Entry timestamp (nanoseconds)
    pub start: u64,

    /// Exit timestamp (nanoseconds), 0 while open
    pub end: u64,

    /// Hash of the callstack captured at entry, 0 when none was captured
    pub callstack_hash: u64,

    /// Kernel thread id of the invoking thread
    pub tid: u32,

    /// Capture session that produced this timer
    pub session_id: u32,

    /// CPU the entry was observed on, -1 when unknown
    pub processor: i8,

    /// Stack depth at entry (0-based)
    pub depth: u8,

    /// [`TimerKind`] tag
    pub kind: u8,
}

impl Timer {
    /// Open a timer for `function_address` on `tid` at `start`
    #[must_use]
    pub fn open(function_address: u64, tid: u32, start: u64, depth: u8) -> Self {
        Self { function_address, tid, start, depth, processor: -1, ..Self::default() }
    }

    /// Decoded [`TimerKind`]
    #[must_use]
    pub fn timer_kind(&self) -> TimerKind {
        TimerKind::from_u8(self.kind)
    }

    /// Elapsed nanoseconds, saturating at zero for unclosed timers
    #[must_use]
    pub fn elapsed_ns(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Encode into the fixed little-endian wire layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TIMER_WIRE_SIZE] {
        let mut out = [0u8; TIMER_WIRE_SIZE];
        out[0..8].copy_from_slice(&self.function_address.to_le_bytes());
        out[8..16].copy_from_slice(&self.start.to_le_bytes());
        out[16..24].copy_from_slice(&self.end.to_le_bytes());
        out[24..32].copy_from_slice(&self.callstack_hash.to_le_bytes());
        out[32..36].copy_from_slice(&self.tid.to_le_bytes());
        out[36..40].copy_from_slice(&self.session_id.to_le_bytes());
        out[40..41].copy_from_slice(&self.processor.to_le_bytes());
        out[41] = self.depth;
        out[42] = self.kind;
        out
    }

    /// Decode from the wire layout, `None` when `bytes` is too short
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TIMER_WIRE_SIZE {
            return None;
        }
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        Some(Self {
            function_address: u64_at(0),
            start: u64_at(8),
            end: u64_at(16),
            callstack_hash: u64_at(24),
            tid: u32_at(32),
            session_id: u32_at(36),
            processor: i8::from_le_bytes([bytes[40]]),
            depth: bytes[41],
            kind: bytes[42],
        })
    }
}

// ============================================================================
// Data Transfer
// ============================================================================

/// Payload class of a data-transfer frame
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataTransferKind {
    /// Bytes of a watched variable
    Data = 0,
    /// Machine code of a function, for disassembly
    Code = 1,
}

impl DataTransferKind {
    /// Decode a wire tag
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(DataTransferKind::Data),
            1 => Some(DataTransferKind::Code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_api_prefix_kinds() {
        assert_eq!(FunctionKind::detect("orbit_api::Start(char const*)"), FunctionKind::TimerStart);
        assert_eq!(FunctionKind::detect("orbit_api::Stop()"), FunctionKind::TimerStop);
        assert_eq!(
            FunctionKind::detect("orbit_api::StartAsync(char const*, unsigned long)"),
            FunctionKind::TimerStartAsync
        );
        assert_eq!(FunctionKind::detect("orbit_api::StopAsync(unsigned long)"), FunctionKind::TimerStopAsync);
        assert_eq!(FunctionKind::detect("orbit_api::TrackInt(char const*, int)"), FunctionKind::TrackInt);
        assert_eq!(FunctionKind::detect("orbit_api::TrackInt64(char const*, long)"), FunctionKind::TrackInt64);
        assert_eq!(
            FunctionKind::detect("orbit_api::TrackDoubleAsInt64(char const*, double)"),
            FunctionKind::TrackDoubleAsInt64
        );
        assert_eq!(FunctionKind::detect("orbit_api::Unrelated()"), FunctionKind::None);
    }

    #[test]
    fn test_detect_exact_names() {
        assert_eq!(FunctionKind::detect("OrbitStart"), FunctionKind::TimerStart);
        assert_eq!(FunctionKind::detect("OrbitStop"), FunctionKind::TimerStop);
        assert_eq!(FunctionKind::detect("OrbitLog"), FunctionKind::Log);
        assert_eq!(FunctionKind::detect("OutputDebugStringA"), FunctionKind::OutputDebugString);
        assert_eq!(FunctionKind::detect("OrbitSendData"), FunctionKind::OrbitData);
        assert_eq!(FunctionKind::detect("OrbitStartX"), FunctionKind::None);
        assert_eq!(FunctionKind::detect("Start("), FunctionKind::None);
    }

    #[test]
    fn test_tracking_kinds_share_data_hook() {
        assert!(FunctionKind::TrackFloat.is_tracking());
        assert!(!FunctionKind::Log.is_tracking());
        assert_eq!(FunctionKind::TrackFloat.hook_message(), MessageType::FunctionHookOrbitData);
        assert_eq!(FunctionKind::None.hook_message(), MessageType::FunctionHook);
    }

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::from_u16(15), Some(MessageType::Timer));
        assert_eq!(MessageType::from_u16(0), None);
        assert_eq!(MessageType::from_u16(27), None);
        assert!(MessageType::GetData.is_data_transfer());
        assert!(MessageType::FunctionHookAlloc.is_function_hook());
        assert!(!MessageType::ArgTracking.is_function_hook());
    }

    #[test]
    fn test_timer_wire_layout() {
        let timer = Timer {
            function_address: 0x4000_1000,
            start: 1_000,
            end: 1_500,
            callstack_hash: 0xfeed,
            tid: 7,
            session_id: 3,
            processor: -1,
            depth: 2,
            kind: TimerKind::ZoneStart as u8,
        };
        let bytes = timer.to_bytes();
        assert_eq!(&bytes[32..36], &7u32.to_le_bytes());
        assert_eq!(Timer::from_bytes(&bytes), Some(timer));
        assert_eq!(Timer::from_bytes(&bytes[..10]), None);
        assert_eq!(timer.elapsed_ns(), 500);
        assert_eq!(timer.timer_kind(), TimerKind::ZoneStart);
    }
}
