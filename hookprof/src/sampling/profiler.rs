//! The sampling state machine
//!
//! ```text
//! Idle -> Sampling -> PendingStop -> Processing -> DoneProcessing -> Idle
//! ```
//!
//! One background thread samples; the owner polls [`SamplingProfiler::poll_done`]
//! from its update tick to collect the report. Samples can also be fed from
//! outside (remote stubs, tracer stacks) without a sampler thread, in which
//! case stopping processes inline.

use super::controller::{sample_thread, ThreadController};
use super::ptrace::boost_current_thread;
use super::report::{process_samples, SamplingReport};
use super::threads::usage_percent;
use crate::callstack::{CallStack, CallstackEvent, CallstackInterner};
use crate::catalog::FunctionCatalog;
use crate::clock::SessionClock;
use crate::domain::{CallstackId, SamplingError, Tid};
use hookprof_common::DEFAULT_MAX_STACK_DEPTH;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingState {
    Idle = 0,
    Sampling = 1,
    PendingStop = 2,
    Processing = 3,
    DoneProcessing = 4,
}

impl SamplingState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Sampling,
            2 => Self::PendingStop,
            3 => Self::Processing,
            4 => Self::DoneProcessing,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SamplingConfig {
    pub period: Duration,
    pub max_depth: usize,
    /// How often per-thread CPU usage is sampled
    pub usage_period: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1),
            max_depth: DEFAULT_MAX_STACK_DEPTH,
            usage_period: Duration::from_millis(200),
        }
    }
}

pub type CompletionCallback = Arc<dyn Fn(&SamplingReport) + Send + Sync>;

#[derive(Default)]
struct SampleStore {
    events: Mutex<Vec<CallstackEvent>>,
    usage: Mutex<HashMap<Tid, Vec<f32>>>,
    report: Mutex<Option<SamplingReport>>,
    unwind_failures: AtomicU64,
    passes: AtomicU64,
}

impl SampleStore {
    fn clear(&self) {
        self.events.lock().clear();
        self.usage.lock().clear();
        *self.report.lock() = None;
        self.unwind_failures.store(0, Ordering::Relaxed);
        self.passes.store(0, Ordering::Relaxed);
    }
}

/// Everything the sampler thread and the inline path share
#[derive(Clone)]
struct Shared {
    state: Arc<AtomicU8>,
    store: Arc<SampleStore>,
    catalog: Arc<FunctionCatalog>,
    callstacks: Arc<CallstackInterner>,
    on_done: Option<CompletionCallback>,
}

impl Shared {
    fn state(&self) -> SamplingState {
        SamplingState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SamplingState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Processing -> DoneProcessing, then fire the callback once
    fn finish(&self) {
        self.set_state(SamplingState::Processing);
        let events = self.store.events.lock().clone();
        let usage = self.store.usage.lock().clone();
        let mut report = process_samples(&events, &usage, &self.callstacks, &self.catalog);
        report.unwind_failures = self.store.unwind_failures.load(Ordering::Relaxed);
        log::info!(
            "Sampling processed: {} samples, {} unique callstacks, {} threads",
            report.total_samples,
            report.unique_callstacks,
            report.threads.len().saturating_sub(1)
        );

        if let Some(callback) = &self.on_done {
            callback(&report);
        }
        *self.store.report.lock() = Some(report);
        self.set_state(SamplingState::DoneProcessing);
    }
}

pub struct SamplingProfiler {
    config: SamplingConfig,
    shared: Shared,
    clock: SessionClock,
    worker: Option<JoinHandle<()>>,
}

impl SamplingProfiler {
    #[must_use]
    pub fn new(
        config: SamplingConfig,
        catalog: Arc<FunctionCatalog>,
        callstacks: Arc<CallstackInterner>,
    ) -> Self {
        Self {
            config,
            shared: Shared {
                state: Arc::new(AtomicU8::new(SamplingState::Idle as u8)),
                store: Arc::new(SampleStore::default()),
                catalog,
                callstacks,
                on_done: None,
            },
            clock: SessionClock::start(),
            worker: None,
        }
    }

    /// Invoked once per capture when processing completes
    pub fn on_done<F>(&mut self, callback: F)
    where
        F: Fn(&SamplingReport) + Send + Sync + 'static,
    {
        self.shared.on_done = Some(Arc::new(callback));
    }

    #[must_use]
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SamplingConfig) {
        self.config = config;
    }

    #[must_use]
    pub fn state(&self) -> SamplingState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state(), SamplingState::Sampling | SamplingState::PendingStop | SamplingState::Processing)
    }

    /// Begin sampling with a background thread driving `controller`
    ///
    /// # Errors
    /// Returns [`SamplingError::AlreadySampling`] unless idle, or
    /// [`SamplingError::Spawn`] if the thread cannot be created.
    pub fn start_capture(&mut self, controller: Box<dyn ThreadController>) -> Result<(), SamplingError> {
        self.begin()?;

        let shared = self.shared.clone();
        let config = self.config.clone();
        let clock = self.clock;
        let handle = thread::Builder::new()
            .name("hookprof-sampler".into())
            .spawn(move || sampler_loop(&shared, controller, &config, clock))
            .map_err(|e| {
                self.shared.set_state(SamplingState::Idle);
                SamplingError::Spawn(e)
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Begin a capture whose samples arrive through [`add_callstack`](Self::add_callstack)
    ///
    /// # Errors
    /// Returns [`SamplingError::AlreadySampling`] unless idle.
    pub fn start_passive(&mut self) -> Result<(), SamplingError> {
        self.begin()
    }

    fn begin(&mut self) -> Result<(), SamplingError> {
        if self.state() != SamplingState::Idle {
            return Err(SamplingError::AlreadySampling);
        }
        self.join_worker();
        self.shared.store.clear();
        self.clock = SessionClock::start();
        self.shared.set_state(SamplingState::Sampling);
        Ok(())
    }

    /// Request a stop; processing happens on the sampler thread if there is one
    pub fn stop_capture(&mut self) {
        if self
            .shared
            .state
            .compare_exchange(
                SamplingState::Sampling as u8,
                SamplingState::PendingStop as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        if self.worker.is_none() {
            self.shared.finish();
        }
    }

    /// Collect the report once processing is done, returning to Idle
    pub fn poll_done(&mut self) -> Option<SamplingReport> {
        if self.state() != SamplingState::DoneProcessing {
            return None;
        }
        self.join_worker();
        let report = self.shared.store.report.lock().take();
        self.shared.set_state(SamplingState::Idle);
        report
    }

    /// Stop, wait for processing and return the report
    pub fn stop_and_wait(&mut self) -> Option<SamplingReport> {
        self.stop_capture();
        self.join_worker();
        self.poll_done()
    }

    /// Record an externally captured stack; ignored unless sampling
    pub fn add_callstack(&self, stack: CallStack, time: u64) -> Option<CallstackId> {
        if self.state() != SamplingState::Sampling || stack.frames.is_empty() {
            return None;
        }
        let tid = stack.tid.unwrap_or(Tid(0));
        let id = self.shared.callstacks.intern(stack, &self.shared.catalog);
        self.shared.store.events.lock().push(CallstackEvent { time, callstack_id: id, tid });
        Some(id)
    }

    /// Record a sample of an already-interned stack
    pub fn add_event(&self, event: CallstackEvent) -> bool {
        if self.state() != SamplingState::Sampling {
            return false;
        }
        self.shared.store.events.lock().push(event);
        true
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.shared.store.events.lock().len()
    }

    #[must_use]
    pub fn passes(&self) -> u64 {
        self.shared.store.passes.load(Ordering::Relaxed)
    }

    /// Abandon any capture and drop recorded samples
    pub fn reset(&mut self) {
        self.stop_capture();
        self.join_worker();
        self.shared.store.clear();
        self.shared.set_state(SamplingState::Idle);
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("Sampler thread panicked");
                self.shared.set_state(SamplingState::DoneProcessing);
            }
        }
    }
}

impl Drop for SamplingProfiler {
    fn drop(&mut self) {
        self.stop_capture();
        self.join_worker();
    }
}

fn sampler_loop(
    shared: &Shared,
    mut controller: Box<dyn ThreadController>,
    config: &SamplingConfig,
    clock: SessionClock,
) {
    boost_current_thread();
    let mut cpu_before: HashMap<Tid, u64> = HashMap::new();
    let mut last_usage = Instant::now();

    while shared.state() == SamplingState::Sampling {
        let pass_start = Instant::now();
        let threads = match controller.threads() {
            Ok(threads) => threads,
            Err(e) => {
                log::warn!("Target went away, ending sampling: {e}");
                break;
            }
        };

        for tid in &threads {
            match sample_thread(controller.as_mut(), *tid, config.max_depth) {
                Ok(frames) if !frames.is_empty() => {
                    let id = shared.callstacks.intern(CallStack::new(frames, *tid), &shared.catalog);
                    shared.store.events.lock().push(CallstackEvent {
                        time: clock.now().0,
                        callstack_id: id,
                        tid: *tid,
                    });
                }
                Ok(_) => {
                    shared.store.unwind_failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::trace!("Sample of thread {tid} failed: {e}");
                    shared.store.unwind_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        shared.store.passes.fetch_add(1, Ordering::Relaxed);

        if last_usage.elapsed() >= config.usage_period {
            #[allow(clippy::cast_possible_truncation)]
            let wall_ns = last_usage.elapsed().as_nanos() as u64;
            last_usage = Instant::now();
            record_usage(shared, controller.as_mut(), &threads, &mut cpu_before, wall_ns);
        }

        thread::sleep(config.period.saturating_sub(pass_start.elapsed()));
    }

    log::debug!("Sampler stopping after {} passes", shared.store.passes.load(Ordering::Relaxed));
    shared.finish();
}

fn record_usage(
    shared: &Shared,
    controller: &mut dyn ThreadController,
    threads: &[Tid],
    cpu_before: &mut HashMap<Tid, u64>,
    wall_ns: u64,
) {
    let mut usage = shared.store.usage.lock();
    for tid in threads {
        let Some(cpu_now) = controller.cpu_time_ns(*tid) else {
            continue;
        };
        if let Some(before) = cpu_before.insert(*tid, cpu_now) {
            usage.entry(*tid).or_default().push(usage_percent(before, cpu_now, wall_ns));
        }
    }
}
