//! bpftrace child process management
//!
//! The script is written to disk, `bpftrace <script>` is spawned with a piped
//! stdout, and a reader thread feeds each line to a [`TimerLineParser`].
//! Stopping sets the exit flag and kills the child, which closes the pipe
//! and unblocks the reader.

use super::parser::{ParserCounters, TimerLineParser, TracerOutput};
use crate::clock::monotonic_ns;
use crate::domain::TracerError;
use parking_lot::Mutex;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type TracerCallback = Box<dyn FnMut(TracerOutput) + Send>;

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub program: String,
    /// Arguments placed before the script path
    pub extra_args: Vec<String>,
    pub script_path: PathBuf,
    pub callstacks: bool,
    /// How long the child must survive before the start counts as successful
    pub startup_grace: Duration,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            program: "bpftrace".to_string(),
            extra_args: Vec::new(),
            script_path: std::env::temp_dir().join("hookprof.bt"),
            callstacks: false,
            startup_grace: Duration::from_millis(100),
        }
    }
}

pub struct BpftraceDriver {
    config: TracerConfig,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    stderr_reader: Option<JoinHandle<()>>,
    exit_requested: Arc<AtomicBool>,
    counters: Arc<Mutex<ParserCounters>>,
}

impl BpftraceDriver {
    #[must_use]
    pub fn new(config: TracerConfig) -> Self {
        Self {
            config,
            child: None,
            reader: None,
            stderr_reader: None,
            exit_requested: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Mutex::new(ParserCounters::default())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Write `script`, spawn the tracer and start streaming its output
    ///
    /// # Errors
    /// [`TracerError::EmptyScript`] for a blank script, otherwise write,
    /// spawn or early-exit failures. Nothing keeps running on error.
    pub fn start(&mut self, script: &str, mut callback: TracerCallback) -> Result<(), TracerError> {
        if script.trim().is_empty() {
            return Err(TracerError::EmptyScript);
        }
        self.stop();

        fs::write(&self.config.script_path, script)
            .map_err(|source| TracerError::ScriptWrite { path: self.config.script_path.clone(), source })?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.extra_args)
            .arg(&self.config.script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TracerError::Spawn { program: self.config.program.clone(), source })?;
        log::info!("Started {} (pid {})", self.config.program, child.id());

        thread::sleep(self.config.startup_grace);
        if let Ok(Some(status)) = child.try_wait() {
            let stderr = child.stderr.take().map(read_all).unwrap_or_default();
            return Err(TracerError::ChildExited(format!("{status}: {}", stderr.trim())));
        }

        let Some(stdout) = child.stdout.take() else {
            kill(&mut child);
            return Err(TracerError::NoStdout);
        };

        if let Some(stderr) = child.stderr.take() {
            self.stderr_reader = Some(thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log::warn!("bpftrace: {line}");
                }
            }));
        }

        self.exit_requested.store(false, Ordering::Release);
        *self.counters.lock() = ParserCounters::default();
        let exit_requested = Arc::clone(&self.exit_requested);
        let counters = Arc::clone(&self.counters);
        let mut parser = TimerLineParser::new(self.config.callstacks);

        self.reader = Some(thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            while !exit_requested.load(Ordering::Acquire) {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Some(output) = parser.parse_line(&line) {
                            callback(output);
                        }
                        *counters.lock() = parser.counters();
                    }
                    Err(e) => {
                        log::warn!("Reading tracer output failed: {e}");
                        break;
                    }
                }
            }
            if !exit_requested.load(Ordering::Acquire) {
                log::warn!("Tracer output ended before stop was requested");
            }
            for timer in parser.flush(monotonic_ns()) {
                callback(TracerOutput::Timer(timer));
            }
            *counters.lock() = parser.counters();
        }));

        self.child = Some(child);
        Ok(())
    }

    /// Stop the child and wait for the reader; returns the final counters
    pub fn stop(&mut self) -> ParserCounters {
        self.exit_requested.store(true, Ordering::Release);
        if let Some(mut child) = self.child.take() {
            kill(&mut child);
        }
        for handle in [self.reader.take(), self.stderr_reader.take()].into_iter().flatten() {
            if handle.join().is_err() {
                log::error!("Tracer reader thread panicked");
            }
        }
        *self.counters.lock()
    }

    #[must_use]
    pub fn is_running(&mut self) -> bool {
        self.child.as_mut().is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    #[must_use]
    pub fn counters(&self) -> ParserCounters {
        *self.counters.lock()
    }
}

impl Drop for BpftraceDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("Tracer already gone: {e}");
    }
    let _ = child.wait();
}

fn read_all(mut stream: impl std::io::Read) -> String {
    let mut out = String::new();
    let _ = stream.read_to_string(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use tempfile::TempDir;

    fn shell_config(dir: &TempDir, command: &str) -> TracerConfig {
        TracerConfig {
            program: "sh".to_string(),
            extra_args: vec!["-c".to_string(), command.to_string(), "stub".to_string()],
            script_path: dir.path().join("probe.bt"),
            callstacks: false,
            startup_grace: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_streams_timers_from_child() {
        let dir = TempDir::new().unwrap();
        let mut driver = BpftraceDriver::new(shell_config(
            &dir,
            "printf 'Attaching 2 probes...\\nb 100 7 1000\\ne 100 7 1500\\n'; exec sleep 5",
        ));
        let (tx, rx) = unbounded();

        driver
            .start("uprobe:/bin/true:main{}\n", Box::new(move |out| {
                let _ = tx.send(out);
            }))
            .unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(driver.is_running());

        let counters = driver.stop();
        let TracerOutput::Timer(timer) = first else {
            panic!("timer expected");
        };
        assert_eq!((timer.function_address, timer.tid, timer.start, timer.end), (100, 7, 1000, 1500));
        assert_eq!(counters.timers_emitted, 1);
        assert_eq!(counters.diagnostic_lines, 1);
        assert!(!driver.is_running());
        assert_eq!(fs::read_to_string(dir.path().join("probe.bt")).unwrap(), "uprobe:/bin/true:main{}\n");
    }

    #[test]
    fn test_callstack_mode_feeds_interner() {
        use crate::callstack::CallstackInterner;
        use crate::catalog::{Function, FunctionCatalog, Module};

        let catalog = Arc::new(FunctionCatalog::new());
        let mut module = Module::new("/bin/app", 0, 0x10_000, 0);
        module.add_function(Function::new("work", 0x1000, 0x40)).unwrap();
        module.add_function(Function::new("main", 0x2000, 0x40)).unwrap();
        catalog.add_module(module);
        let interner = Arc::new(CallstackInterner::new());

        let dir = TempDir::new().unwrap();
        let mut config = shell_config(
            &dir,
            "printf 'b 4096 7 1000\\n\\t1010 work+16 (/bin/app)\\n\\t2008 main+8 (/bin/app)\\n\\t3004 helper+4 (/lib/libh.so)\\n\\nd\\n\\ne 4096 7 1500\\n'; exec sleep 5",
        );
        config.callstacks = true;
        let mut driver = BpftraceDriver::new(config);

        let (tx, rx) = unbounded();
        let (stack_catalog, stack_interner) = (Arc::clone(&catalog), Arc::clone(&interner));
        driver
            .start(
                "uprobe:/bin/app:work{}\n",
                Box::new(move |output| match output {
                    TracerOutput::CallStack { stack, symbols } => {
                        for symbol in &symbols {
                            stack_catalog.add_frame_symbol(symbol.address, &symbol.function, &symbol.module);
                        }
                        stack_interner.intern(stack, &stack_catalog);
                    }
                    TracerOutput::Timer(timer) => {
                        let _ = tx.send(timer);
                    }
                }),
            )
            .unwrap();
        let timer = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let counters = driver.stop();

        assert_eq!((timer.function_address, timer.start, timer.end), (4096, 1000, 1500));
        assert_eq!(counters.callstacks, 1);
        let raw = crate::domain::CallstackId(timer.callstack_hash);
        assert_eq!(interner.get_raw(raw).unwrap().frames, vec![0x1010, 0x2008, 0x3004]);
        assert_eq!(interner.get_resolved(raw).unwrap().frames, vec![0x1000, 0x2000, 0x3004]);
        assert_eq!(catalog.find_exact(0x3004).unwrap().pretty_name, "helper");
        assert_eq!(interner.stacks_reaching(0x1000), vec![raw]);
    }

    #[test]
    fn test_empty_script_short_circuits() {
        let dir = TempDir::new().unwrap();
        let mut driver = BpftraceDriver::new(shell_config(&dir, "exit 0"));
        assert!(matches!(driver.start("  \n", Box::new(|_| {})), Err(TracerError::EmptyScript)));
        assert!(!dir.path().join("probe.bt").exists());
    }

    #[test]
    fn test_child_exiting_early_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut driver = BpftraceDriver::new(shell_config(&dir, "echo no permission >&2; exit 1"));
        let err = driver.start("x", Box::new(|_| {})).unwrap_err();
        let TracerError::ChildExited(message) = err else {
            panic!("expected early exit, got {err}");
        };
        assert!(message.contains("no permission"));
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let dir = TempDir::new().unwrap();
        let mut driver = BpftraceDriver::new(TracerConfig {
            program: "/nonexistent/bpftrace".to_string(),
            script_path: dir.path().join("probe.bt"),
            ..TracerConfig::default()
        });
        assert!(matches!(driver.start("x", Box::new(|_| {})), Err(TracerError::Spawn { .. })));
    }

    #[test]
    fn test_unwritable_script_path() {
        let mut driver = BpftraceDriver::new(TracerConfig {
            script_path: PathBuf::from("/nonexistent/dir/probe.bt"),
            ..TracerConfig::default()
        });
        assert!(matches!(driver.start("x", Box::new(|_| {})), Err(TracerError::ScriptWrite { .. })));
    }
}
