//! Function-hook instrumentation
//!
//! - `controller`: per-capture hook buckets, argument tracking, teardown
//! - `router`: pairs zone timers and routes inbound capture data
//! - `pending`: per-thread stacks of open timers

pub mod controller;
pub mod pending;
pub mod router;

pub use controller::{
    ArgRead, ArgTrackingRule, HookConfig, HookReport, InstrumentationController, UnrealInfo,
    ALLOCATOR_FUNCTIONS, MIN_HOOKABLE_SIZE,
};
pub use pending::PendingTimers;
pub use router::{CaptureEvent, TimerRouter};
