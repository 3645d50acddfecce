//! Periodic stack sampling of a target process
//!
//! - `controller`: freeze/walk/thaw seam
//! - `ptrace`: Linux backend
//! - `threads`: /proc thread listing and CPU accounting
//! - `profiler`: the state machine and sampler thread
//! - `report`: roll-up into per-thread inclusive/exclusive counts

pub mod controller;
pub mod profiler;
pub mod ptrace;
pub mod report;
pub mod threads;

pub use controller::{sample_thread, ThreadController};
pub use profiler::{SamplingConfig, SamplingProfiler, SamplingState};
pub use ptrace::PtraceController;
pub use report::{process_samples, SampledFunction, SamplingReport, ThreadSampleData};
