//! Capture configuration
//!
//! Built from the command line in the binary, or directly by tests.

use crate::instrumentation::HookConfig;
use crate::sampling::SamplingConfig;
use crate::tracer::TracerConfig;
use hookprof_common::DEFAULT_CAPTURE_PORT;
use std::time::Duration;

/// How timers are obtained from the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// Stub in the target sends timers over the capture link
    #[default]
    Instrumented,
    /// Uprobes through a bpftrace child, no stub required
    Bpftrace,
    /// No hooks at all, only stack sampling
    SamplingOnly,
}

#[derive(Debug, Clone)]
pub struct CaptureParams {
    pub capture_port: u16,
    pub mode: CaptureMode,
    pub hooks: HookConfig,
    pub sampling: SamplingConfig,
    /// Run the sampling profiler alongside the capture
    pub sample: bool,
    pub tracer: TracerConfig,
    /// Connection polls after injecting, `inject_poll` apart
    pub inject_attempts: u32,
    pub inject_poll: Duration,
    /// The target connects on its own; never inject
    pub remote: bool,
    pub arguments: String,
    pub working_directory: String,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            capture_port: DEFAULT_CAPTURE_PORT,
            mode: CaptureMode::default(),
            hooks: HookConfig::default(),
            sampling: SamplingConfig::default(),
            sample: false,
            tracer: TracerConfig::default(),
            inject_attempts: 50,
            inject_poll: Duration::from_millis(100),
            remote: false,
            arguments: String::new(),
            working_directory: String::new(),
        }
    }
}

impl CaptureParams {
    /// Whether this mode talks to a stub over the capture link
    #[must_use]
    pub fn needs_link(&self) -> bool {
        self.mode == CaptureMode::Instrumented
    }
}
