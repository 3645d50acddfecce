//! The UI capability the capture core reports through
//!
//! Every method has a no-op default so a front end only implements what it
//! displays. The core never learns who is listening.

use crate::callstack::CallStack;
use crate::catalog::Function;
use crate::sampling::SamplingReport;
use crate::transport::ContextSwitch;
use hookprof_common::Timer;
use parking_lot::Mutex;

pub trait Sink: Send + Sync {
    fn on_timer(&self, _timer: &Timer) {}

    fn on_callstack(&self, _stack: &CallStack) {}

    fn on_context_switch(&self, _switch: &ContextSwitch) {}

    /// A module finished loading; `functions` were added to the catalog
    fn on_symbols(&self, _module_path: &str, _functions: usize) {}

    /// Machine code of `function` fetched from the target
    fn on_disassembly(&self, _function: &Function, _code: &[u8]) {}

    fn on_sampling_report(&self, _report: &SamplingReport) {}

    fn log(&self, _line: &str) {}

    /// A single summarized message meant for the user
    fn send_message_to_ui(&self, _message: &str) {}
}

/// Sink for headless runs: forwards the user-facing parts to the logger
#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn on_symbols(&self, module_path: &str, functions: usize) {
        log::info!("Loaded {functions} functions from {module_path}");
    }

    fn on_sampling_report(&self, report: &SamplingReport) {
        log::info!(
            "Sampling report: {} samples over {} threads ({} unique callstacks)",
            report.total_samples,
            report.threads.len().saturating_sub(1),
            report.unique_callstacks
        );
    }

    fn log(&self, line: &str) {
        log::debug!("{line}");
    }

    fn send_message_to_ui(&self, message: &str) {
        log::warn!("{message}");
    }
}

/// Sink that keeps everything it is told, for tests and summaries
#[derive(Default)]
pub struct RecordingSink {
    pub timers: Mutex<Vec<Timer>>,
    pub callstacks: Mutex<Vec<CallStack>>,
    pub context_switches: Mutex<Vec<ContextSwitch>>,
    pub symbols: Mutex<Vec<(String, usize)>>,
    pub disassembly: Mutex<Vec<(u64, Vec<u8>)>>,
    pub reports: Mutex<Vec<SamplingReport>>,
    pub logs: Mutex<Vec<String>>,
    pub messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl Sink for RecordingSink {
    fn on_timer(&self, timer: &Timer) {
        self.timers.lock().push(*timer);
    }

    fn on_callstack(&self, stack: &CallStack) {
        self.callstacks.lock().push(stack.clone());
    }

    fn on_context_switch(&self, switch: &ContextSwitch) {
        self.context_switches.lock().push(*switch);
    }

    fn on_symbols(&self, module_path: &str, functions: usize) {
        self.symbols.lock().push((module_path.to_string(), functions));
    }

    fn on_disassembly(&self, function: &Function, code: &[u8]) {
        self.disassembly.lock().push((function.virtual_address(), code.to_vec()));
    }

    fn on_sampling_report(&self, report: &SamplingReport) {
        self.reports.lock().push(report.clone());
    }

    fn log(&self, line: &str) {
        self.logs.lock().push(line.to_string());
    }

    fn send_message_to_ui(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recording_sink_behind_trait_object() {
        let recording = Arc::new(RecordingSink::new());
        let sink: Arc<dyn Sink> = recording.clone();
        sink.on_timer(&Timer::open(0x10, 1, 5, 0));
        sink.send_message_to_ui("3 hooks rejected");
        sink.on_symbols("/usr/bin/game", 12);

        assert_eq!(recording.timer_count(), 1);
        assert_eq!(recording.messages(), vec!["3 hooks rejected".to_string()]);
        assert_eq!(recording.symbols.lock()[0], ("/usr/bin/game".to_string(), 12));
    }

    #[test]
    fn test_log_sink_accepts_everything() {
        let sink = LogSink;
        sink.on_timer(&Timer::open(0x10, 1, 5, 0));
        sink.on_sampling_report(&SamplingReport::default());
        sink.send_message_to_ui("done");
    }
}
