//! CLI argument definitions

use crate::session::{CaptureMode, CaptureParams};
use clap::Parser;
use hookprof_common::DEFAULT_CAPTURE_PORT;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "hookprof",
    about = "Hook functions in a running process and time every call",
    after_help = "\
EXAMPLES:
    hookprof my-game --functions Render                 Hook matching functions through the stub
    sudo hookprof --pid 1234 --bpftrace -f 'net::'      Uprobes via bpftrace, no stub needed
    hookprof --pid 1234 --sample --duration 10          Stack sampling only
    hookprof my-game --load-preset frame.opr.json       Reuse a saved selection"
)]
pub struct Args {
    /// Process name to profile (auto-detects PID)
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID to profile
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// TCP port the stub connects back to
    #[arg(long, default_value_t = DEFAULT_CAPTURE_PORT)]
    pub capture_port: u16,

    /// Select every function whose name contains PATTERN (repeatable)
    #[arg(short, long = "functions", value_name = "PATTERN")]
    pub functions: Vec<String>,

    /// Hook functions too small for a safe detour (functions of unknown size stay unhooked)
    #[arg(long)]
    pub allow_unsafe_hooking: bool,

    /// Always hook OutputDebugString-style logging functions
    #[arg(long)]
    pub hook_output_debug_string: bool,

    /// Time calls with bpftrace uprobes instead of the in-process stub
    #[arg(long, conflicts_with = "remote")]
    pub bpftrace: bool,

    /// bpftrace executable
    #[arg(long, value_name = "PATH", default_value = "bpftrace")]
    pub bpftrace_path: String,

    /// Record a user stack on every timer (bpftrace mode)
    #[arg(long, requires = "bpftrace")]
    pub callstacks: bool,

    /// Sample thread stacks alongside the capture
    #[arg(long)]
    pub sample: bool,

    /// Sampling period in microseconds
    #[arg(long, value_name = "US", default_value = "1000")]
    pub sampling_period_us: u64,

    /// Deepest frame recorded per sample
    #[arg(long, default_value = "64")]
    pub max_depth: usize,

    /// The stub is already loaded and connects on its own
    #[arg(long)]
    pub remote: bool,

    /// Command that loads the stub, with {pid} and {port} substituted
    #[arg(long, value_name = "CMD")]
    pub inject_command: Option<String>,

    /// Stop after N seconds (0 = until Ctrl-C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Write the selection to FILE when the capture ends
    #[arg(long, value_name = "FILE")]
    pub save_preset: Option<PathBuf>,

    /// Select the functions stored in FILE
    #[arg(long, value_name = "FILE")]
    pub load_preset: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// `--bpftrace` wins; `--sample` without any function selection means sampling only
    #[must_use]
    pub fn mode(&self) -> CaptureMode {
        if self.bpftrace {
            CaptureMode::Bpftrace
        } else if self.sample && self.functions.is_empty() && self.load_preset.is_none() {
            CaptureMode::SamplingOnly
        } else {
            CaptureMode::Instrumented
        }
    }

    #[must_use]
    pub fn to_params(&self) -> CaptureParams {
        let mut params = CaptureParams {
            capture_port: self.capture_port,
            mode: self.mode(),
            sample: self.sample,
            remote: self.remote,
            ..CaptureParams::default()
        };
        params.hooks.allow_unsafe_hooking = self.allow_unsafe_hooking;
        params.hooks.hook_output_debug_string = self.hook_output_debug_string;
        params.sampling.period = Duration::from_micros(self.sampling_period_us.max(1));
        params.sampling.max_depth = self.max_depth;
        params.tracer.program.clone_from(&self.bpftrace_path);
        params.tracer.callstacks = self.callstacks;
        params
    }

    /// `--duration` as a deadline; `None` runs until interrupted
    #[must_use]
    pub fn duration_limit(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("hookprof").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_are_instrumented() {
        let args = parse(&["game", "-f", "Render", "-f", "Physics"]);
        assert_eq!(args.process.as_deref(), Some("game"));
        assert_eq!(args.functions, ["Render", "Physics"]);
        assert_eq!(args.mode(), CaptureMode::Instrumented);

        let params = args.to_params();
        assert_eq!(params.capture_port, 1789);
        assert!(!params.hooks.allow_unsafe_hooking);
        assert!(args.duration_limit().is_none());
    }

    #[test]
    fn test_bpftrace_mode() {
        let args = parse(&["--pid", "42", "--bpftrace", "--bpftrace-path", "/usr/sbin/bpftrace", "--callstacks"]);
        let params = args.to_params();
        assert_eq!(params.mode, CaptureMode::Bpftrace);
        assert_eq!(params.tracer.program, "/usr/sbin/bpftrace");
        assert!(params.tracer.callstacks);
    }

    #[test]
    fn test_sample_without_selection_is_sampling_only() {
        let args = parse(&["--pid", "42", "--sample", "--sampling-period-us", "250", "--duration", "3"]);
        let params = args.to_params();
        assert_eq!(params.mode, CaptureMode::SamplingOnly);
        assert!(params.sample);
        assert_eq!(params.sampling.period, Duration::from_micros(250));
        assert_eq!(args.duration_limit(), Some(Duration::from_secs(3)));

        let args = parse(&["--pid", "42", "--sample", "-f", "Tick"]);
        assert_eq!(args.mode(), CaptureMode::Instrumented);
    }

    #[test]
    fn test_callstacks_require_bpftrace() {
        assert!(Args::try_parse_from(["hookprof", "--pid", "1", "--callstacks"]).is_err());
        assert!(Args::try_parse_from(["hookprof", "--bpftrace", "--remote"]).is_err());
    }
}
