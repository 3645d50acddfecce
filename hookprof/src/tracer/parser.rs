//! bpftrace output parsing
//!
//! Owned by the reader thread, one line at a time, so it needs no locking.

use crate::callstack::CallStack;
use crate::domain::Tid;
use crate::instrumentation::PendingTimers;
use hookprof_common::Timer;

/// Something complete enough to hand on
#[derive(Debug, Clone, PartialEq)]
pub enum TracerOutput {
    Timer(Timer),
    /// Entry stack of the innermost open timer on its thread
    CallStack { stack: CallStack, symbols: Vec<FrameSymbol> },
}

/// Name bpftrace printed for one stack frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSymbol {
    pub address: u64,
    pub function: String,
    pub module: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserCounters {
    pub timers_emitted: u64,
    pub malformed_lines: u64,
    pub unmatched_ends: u64,
    /// `Attaching N probes...`, `Lost N events` and similar
    pub diagnostic_lines: u64,
    pub callstacks: u64,
    /// Stacks that arrived with no open timer on their thread
    pub orphan_stacks: u64,
}

enum Mode {
    Begin,
    End,
}

#[derive(Default)]
pub struct TimerLineParser {
    pending: PendingTimers,
    callstacks: bool,
    stack: Vec<u64>,
    symbols: Vec<FrameSymbol>,
    last_tid: Option<u32>,
    counters: ParserCounters,
}

impl TimerLineParser {
    #[must_use]
    pub fn new(callstacks: bool) -> Self {
        Self { callstacks, ..Self::default() }
    }

    pub fn parse_line(&mut self, line: &str) -> Option<TracerOutput> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            return None;
        }

        if self.callstacks {
            if line.starts_with('\t') {
                self.push_frame(line);
                return None;
            }
            if line == "d" {
                return self.finish_stack();
            }
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let mode = match tokens[0] {
            "b" => Mode::Begin,
            "e" => Mode::End,
            first if first.starts_with("Attaching") || first.starts_with("Lost") => {
                log::debug!("bpftrace: {line}");
                self.counters.diagnostic_lines += 1;
                return None;
            }
            _ => return self.malformed(line),
        };
        let Some((vaddr, tid, ns)) = Self::fields(&tokens) else {
            return self.malformed(line);
        };

        self.last_tid = Some(tid);
        match mode {
            Mode::Begin => {
                self.pending.open(Timer::open(vaddr, tid, ns, 0));
                None
            }
            Mode::End => match self.pending.close(tid, ns) {
                Some(timer) => {
                    self.counters.timers_emitted += 1;
                    Some(TracerOutput::Timer(timer))
                }
                None => {
                    self.counters.unmatched_ends = self.pending.unmatched_ends();
                    None
                }
            },
        }
    }

    /// `<mode> <vaddr> <tid> <ns>`, all decimal
    fn fields(tokens: &[&str]) -> Option<(u64, u32, u64)> {
        if tokens.len() != 4 {
            return None;
        }
        Some((tokens[1].parse().ok()?, tokens[2].parse().ok()?, tokens[3].parse().ok()?))
    }

    fn malformed(&mut self, line: &str) -> Option<TracerOutput> {
        log::trace!("Ignoring tracer line: {line}");
        self.counters.malformed_lines += 1;
        None
    }

    /// `\t<hex ip> <symbol+off> (<module>)`
    fn push_frame(&mut self, line: &str) {
        let mut tokens = line.split_whitespace();
        let ip = tokens
            .next()
            .and_then(|hex| u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok());
        let Some(ip) = ip else {
            self.malformed(line);
            return;
        };
        self.stack.push(ip);

        let function = tokens.next().map_or("", |symbol| symbol.split('+').next().unwrap_or(symbol));
        let module = tokens.next().map_or("", |m| m.trim_start_matches('(').trim_end_matches(')'));
        if !function.is_empty() && function != "[unknown]" {
            self.symbols.push(FrameSymbol { address: ip, function: function.to_string(), module: module.to_string() });
        }
    }

    fn finish_stack(&mut self) -> Option<TracerOutput> {
        let frames = std::mem::take(&mut self.stack);
        let symbols = std::mem::take(&mut self.symbols);
        let tid = self.last_tid.take()?;
        if frames.is_empty() {
            return None;
        }
        let stack = CallStack::new(frames, Tid(tid));
        if !self.pending.set_top_callstack(tid, stack.id().0) {
            self.counters.orphan_stacks += 1;
            return None;
        }
        self.counters.callstacks += 1;
        Some(TracerOutput::CallStack { stack, symbols })
    }

    /// Close every open timer at `now`
    pub fn flush(&mut self, now: u64) -> Vec<Timer> {
        let flushed = self.pending.flush_at(now);
        self.counters.timers_emitted += flushed.len() as u64;
        flushed
    }

    #[must_use]
    pub fn counters(&self) -> ParserCounters {
        self.counters
    }

    #[must_use]
    pub fn open_timers(&self) -> usize {
        self.pending.open_count()
    }
}
