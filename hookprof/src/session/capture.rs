//! Capture session state machine
//!
//! ```text
//!   Idle ──connect──▶ Connected ──start──▶ Capturing
//!    ▲                                       │ stop / link lost
//!    └──────────── update (drained) ◀── Draining
//! ```
//!
//! [`CaptureContext`] owns every subsystem of one profiling session and is
//! driven from a single thread: the binary calls [`CaptureContext::update`]
//! on every tick. Background threads (transport, sampler, tracer reader,
//! symbol loader) only ever hand data over through channels and flags.

use super::inject::{Injector, PreloadedStub};
use super::params::{CaptureMode, CaptureParams};
use super::preset::{Preset, PresetApplication};
use super::sink::Sink;
use crate::callstack::CallstackInterner;
use crate::catalog::{FunctionCatalog, StatsSnapshot};
use crate::clock::monotonic_ns;
use crate::domain::{InstrumentationError, Pid, SessionError, TransportError};
use crate::instrumentation::{CaptureEvent, HookReport, InstrumentationController, TimerRouter};
use crate::modules::{ModuleLoadOutcome, ModuleManager, ModuleRequest, SymbolProvider};
use crate::sampling::{PtraceController, SamplingProfiler, SamplingReport};
use crate::symbolization::module_mappings;
use crate::tracer::{generate_script, BpftraceDriver, ParserCounters, TracerOutput};
use crate::transport::{Dispatcher, Header, Link, Message, StatsSnapshot as TransportSnapshot, TcpTransport};
use crossbeam_channel::Receiver;
use hookprof_common::{MessageType, Timer};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Connected,
    Capturing,
    Draining,
}

impl CaptureState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Connected => "connected",
            CaptureState::Capturing => "capturing",
            CaptureState::Draining => "draining",
        }
    }
}

/// The process being profiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProcess {
    pub pid: Pid,
    pub path: String,
    pub modules: Vec<ModuleRequest>,
}

impl TargetProcess {
    /// Describe a running process from /proc
    ///
    /// # Errors
    /// [`SessionError::Symbols`] when its mappings cannot be read.
    pub fn from_pid(pid: Pid) -> Result<Self, SessionError> {
        let path = std::fs::read_link(format!("/proc/{}/exe", pid.0))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modules = module_mappings(pid)?
            .into_iter()
            .filter(|m| m.executable)
            .map(ModuleRequest::from)
            .collect();
        Ok(Self { pid, path, modules })
    }
}

/// End-of-capture numbers for the front end
#[derive(Debug, Clone, Default)]
pub struct CaptureSummary {
    pub session_id: u32,
    pub timers: u64,
    pub open_timers: usize,
    pub hooks: Option<HookReport>,
    pub tracer: Option<ParserCounters>,
    pub transport: TransportSnapshot,
    pub samples: usize,
}

pub struct CaptureContext {
    params: CaptureParams,
    state: CaptureState,
    target: Option<TargetProcess>,
    catalog: Arc<FunctionCatalog>,
    callstacks: Arc<CallstackInterner>,
    sampling: SamplingProfiler,
    dispatcher: Arc<Dispatcher>,
    link: Option<Arc<dyn Link>>,
    instrumentation: InstrumentationController,
    router: Arc<TimerRouter>,
    events: Receiver<CaptureEvent>,
    tracer: Option<BpftraceDriver>,
    tracer_counters: Option<ParserCounters>,
    modules: ModuleManager,
    injector: Box<dyn Injector>,
    sink: Arc<dyn Sink>,
    session_id: u32,
    timers: u64,
    last_hooks: Option<HookReport>,
    last_report: Option<SamplingReport>,
}

impl CaptureContext {
    #[must_use]
    pub fn new(params: CaptureParams, provider: Arc<dyn SymbolProvider>, sink: Arc<dyn Sink>) -> Self {
        let catalog = Arc::new(FunctionCatalog::new());
        let callstacks = Arc::new(CallstackInterner::new());

        let mut sampling =
            SamplingProfiler::new(params.sampling.clone(), Arc::clone(&catalog), Arc::clone(&callstacks));
        let report_sink = Arc::clone(&sink);
        sampling.on_done(move |report| report_sink.on_sampling_report(report));

        let dispatcher = Arc::new(Dispatcher::default());
        let (router, events) = TimerRouter::new(Arc::clone(&catalog));
        router.register(&dispatcher);

        Self {
            instrumentation: InstrumentationController::new(params.hooks.clone()),
            params,
            state: CaptureState::Idle,
            target: None,
            catalog,
            callstacks,
            sampling,
            dispatcher,
            link: None,
            router,
            events,
            tracer: None,
            tracer_counters: None,
            modules: ModuleManager::new(provider),
            injector: Box::new(PreloadedStub),
            sink,
            session_id: 0,
            timers: 0,
            last_hooks: None,
            last_report: None,
        }
    }

    #[must_use]
    pub fn with_injector(mut self, injector: Box<dyn Injector>) -> Self {
        self.injector = injector;
        self
    }

    /// Reset to an empty target with new parameters
    pub fn init(&mut self, params: CaptureParams) {
        if self.state == CaptureState::Capturing {
            self.stop();
        }
        self.instrumentation.set_config(params.hooks.clone());
        self.sampling.set_config(params.sampling.clone());
        self.params = params;
        self.target = None;
        self.state = CaptureState::Idle;
    }

    /// Listen for the stub on the configured capture port
    ///
    /// # Errors
    /// [`TransportError::Bind`] when the port is taken.
    pub fn listen(&mut self) -> Result<u16, SessionError> {
        let transport = TcpTransport::listen(self.params.capture_port, Arc::clone(&self.dispatcher))?;
        let port = transport.port();
        self.link = Some(Arc::new(transport));
        Ok(port)
    }

    /// Use an already established link instead of listening
    pub fn attach_link(&mut self, link: Arc<dyn Link>) {
        self.link = Some(link);
    }

    /// Select the process to profile and start loading its symbols
    ///
    /// # Errors
    /// [`SessionError::InvalidState`] while a capture is running.
    pub fn set_target(&mut self, target: TargetProcess) -> Result<(), SessionError> {
        self.require_not_capturing("change target")?;
        log::info!("Target {} ({}), {} modules", target.pid, target.path, target.modules.len());

        self.catalog.clear_selection();
        self.sampling.reset();
        self.modules.set_target_modules(target.modules.clone());
        for module in &target.modules {
            if !self.catalog.has_module(&module.path) {
                self.modules.request_load(module.clone());
            }
        }
        self.target = Some(target);
        Ok(())
    }

    /// Make sure the stub is in the target and connected
    ///
    /// Modes without a stub connect trivially; remote targets skip injection
    /// and only wait for the inbound connection.
    ///
    /// # Errors
    /// [`SessionError::NoTarget`], injection failures, or
    /// [`InstrumentationError::InjectTimeout`] when the stub never connects.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        let pid = self.target.as_ref().ok_or(SessionError::NoTarget)?.pid;
        if self.state != CaptureState::Idle {
            return Ok(());
        }
        if !self.params.needs_link() {
            self.state = CaptureState::Connected;
            return Ok(());
        }
        if self.link.is_none() {
            self.listen()?;
        }

        // Remote stubs dial in by themselves
        if !self.params.remote && !self.injector.is_injected(pid) {
            self.injector.inject(pid, self.params.capture_port)?;
        }
        for _ in 0..self.params.inject_attempts {
            if self.is_connected() {
                log::info!("Stub in {pid} connected");
                self.state = CaptureState::Connected;
                return Ok(());
            }
            thread::sleep(self.params.inject_poll);
        }
        Err(InstrumentationError::InjectTimeout {
            attempts: self.params.inject_attempts,
            port: self.params.capture_port,
        }
        .into())
    }

    /// Whether the capture link (if this mode uses one) is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.params.needs_link() || self.link.as_ref().is_some_and(|link| link.has_connection())
    }

    /// Begin a capture
    ///
    /// # Errors
    /// Precondition failures, or a tracer that could not be started; the
    /// state is unchanged on error.
    pub fn start(&mut self) -> Result<(), SessionError> {
        let pid = self.target.as_ref().ok_or(SessionError::NoTarget)?.pid;
        match self.state {
            CaptureState::Connected => {}
            CaptureState::Idle if self.is_connected() => {}
            state => return Err(SessionError::InvalidState { operation: "start a capture", state: state.as_str() }),
        }
        if !self.is_connected() {
            return Err(InstrumentationError::NotConnected.into());
        }

        self.drain_events();
        self.router.reset();
        self.catalog.reset_stats();
        self.timers = 0;
        self.tracer_counters = None;
        self.last_hooks = None;
        self.session_id = self.session_id.wrapping_add(1);
        self.dispatcher.set_session_id(self.session_id);
        self.router.set_recording(true);

        match self.params.mode {
            CaptureMode::Instrumented => self.start_instrumented(pid),
            CaptureMode::Bpftrace => {
                if let Err(e) = self.start_tracer() {
                    self.router.set_recording(false);
                    return Err(e);
                }
            }
            CaptureMode::SamplingOnly => {}
        }

        if self.params.sample || self.params.mode == CaptureMode::SamplingOnly {
            let started = if self.params.remote {
                self.sampling.start_passive()
            } else {
                self.sampling.start_capture(Box::new(PtraceController::new(pid)))
            };
            if let Err(e) = started {
                log::warn!("Sampling not started: {e}");
                self.sink.send_message_to_ui(&format!("Sampling not started: {e}"));
            }
        }

        self.state = CaptureState::Capturing;
        log::info!("Capture {} started on {pid}", self.session_id);
        self.sink.log(&format!("Capture {} started", self.session_id));
        Ok(())
    }

    fn start_instrumented(&mut self, pid: Pid) {
        let Some(link) = self.link.clone() else {
            return;
        };
        link.send(Message::new(MessageType::NewSession, self.session_id));
        self.instrumentation.pre_hook(&self.catalog, link.as_ref(), self.session_id);
        let report = self.instrumentation.send_hooks(&self.catalog, link.as_ref(), self.session_id);
        if !report.rejected.is_empty() {
            self.sink.send_message_to_ui(&format!(
                "{} functions were not hooked because they are too small to patch safely",
                report.rejected.len()
            ));
        }
        #[allow(clippy::cast_sign_loss)]
        let header = Header::Generic { address: pid.0 as u64 };
        link.send(Message::new(MessageType::StartCapture, self.session_id).with_header(header));
        self.last_hooks = Some(report);
    }

    fn start_tracer(&mut self) -> Result<(), SessionError> {
        let functions = self.catalog.selected_functions();
        let script = generate_script(&functions, self.params.tracer.callstacks).unwrap_or_default();

        let mut driver = BpftraceDriver::new(self.params.tracer.clone());
        let router = Arc::clone(&self.router);
        let catalog = Arc::clone(&self.catalog);
        driver.start(
            &script,
            Box::new(move |output| match output {
                TracerOutput::Timer(timer) => router.on_timer(timer),
                TracerOutput::CallStack { stack, symbols } => {
                    for symbol in &symbols {
                        catalog.add_frame_symbol(symbol.address, &symbol.function, &symbol.module);
                    }
                    router.on_callstack(stack);
                }
            }),
        )?;
        log::info!("Tracing {} functions with {}", functions.len(), self.params.tracer.program);
        self.tracer = Some(driver);
        Ok(())
    }

    /// End the capture; the session drains and returns to Idle on later ticks
    pub fn stop(&mut self) {
        if self.state != CaptureState::Capturing {
            return;
        }
        if let Some(mut tracer) = self.tracer.take() {
            self.tracer_counters = Some(tracer.stop());
        }

        let now = monotonic_ns();
        match self.link.clone() {
            Some(link) if self.params.needs_link() => {
                self.instrumentation.teardown(link.as_ref(), self.session_id, &self.router, now);
            }
            _ => {
                self.router.flush_at(now);
            }
        }

        self.sampling.stop_capture();
        self.router.set_recording(false);
        self.state = CaptureState::Draining;
        log::info!("Capture {} stopping", self.session_id);
    }

    /// Periodic tick: integrate loads, deliver capture data, advance the state machine
    pub fn update(&mut self) -> Vec<ModuleLoadOutcome> {
        let outcomes = self.modules.update(&self.catalog, self.sink.as_ref());

        for message in self.dispatcher.poll_main_thread() {
            self.handle_main_thread_message(&message);
        }
        self.drain_events();

        let link_lost = self.params.needs_link()
            && self.link.is_some()
            && !self.is_connected()
            && matches!(self.state, CaptureState::Connected | CaptureState::Capturing);
        if link_lost {
            self.on_connection_lost();
        }

        if self.state == CaptureState::Capturing
            && self.tracer.as_mut().is_some_and(|tracer| !tracer.is_running())
        {
            self.sink.send_message_to_ui("bpftrace exited, stopping capture");
            self.stop();
        }

        if let Some(report) = self.sampling.poll_done() {
            self.last_report = Some(report);
        }

        if self.state == CaptureState::Draining {
            self.drain_events();
            if !self.sampling.is_running() {
                if let Some(report) = self.sampling.poll_done() {
                    self.last_report = Some(report);
                }
                self.state = CaptureState::Idle;
                log::info!("Capture {} finished with {} timers", self.session_id, self.timers);
            }
        }
        outcomes
    }

    fn on_connection_lost(&mut self) {
        log::warn!("{}", TransportError::PeerClosed);
        if self.state == CaptureState::Capturing {
            let flushed = self.router.flush_last_seen();
            if flushed > 0 {
                log::info!("Closed {flushed} timers left open by the lost connection");
            }
            self.sampling.stop_capture();
            self.router.set_recording(false);
            self.state = CaptureState::Draining;
            self.sink.send_message_to_ui("Connection to the target was lost, capture stopped");
        } else {
            self.state = CaptureState::Idle;
        }
    }

    fn handle_main_thread_message(&mut self, message: &Message) {
        match message.kind {
            MessageType::SetData => {
                self.modules.route_message(message, &self.catalog, self.sink.as_ref());
            }
            kind => {
                log::debug!("Unhandled {kind:?} on main thread");
                self.dispatcher.stats().record_dispatch_miss();
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                CaptureEvent::Timer(timer) => {
                    self.timers += 1;
                    self.sink.on_timer(&timer);
                }
                CaptureEvent::CallStack(stack) => {
                    if self.sampling.add_callstack(stack.clone(), monotonic_ns()).is_none() {
                        self.callstacks.intern(stack.clone(), &self.catalog);
                    }
                    self.sink.on_callstack(&stack);
                }
                CaptureEvent::Sample(event) => {
                    self.sampling.add_event(event);
                }
                CaptureEvent::ContextSwitch(switch) => self.sink.on_context_switch(&switch),
            }
        }
    }

    /// Accept one timer as if it had arrived from the target
    pub fn on_timer(&mut self, timer: Timer) {
        self.router.on_timer(timer);
        self.drain_events();
    }

    /// Forget everything recorded by previous captures
    pub fn clear(&mut self) {
        self.drain_events();
        self.router.reset();
        self.callstacks.clear();
        self.catalog.reset_stats();
        self.instrumentation.reset_hooks();
        self.sampling.reset();
        self.timers = 0;
        self.last_report = None;
        self.tracer_counters = None;
    }

    /// Select a function; during a capture the change applies to the next one
    ///
    /// # Errors
    /// [`CatalogError::UnknownFunction`](crate::domain::CatalogError) outside a capture.
    pub fn select_function(&mut self, vaddr: u64) -> Result<(), crate::domain::CatalogError> {
        if self.state == CaptureState::Capturing {
            self.instrumentation.stage_select(vaddr);
            Ok(())
        } else {
            self.catalog.select(vaddr)
        }
    }

    /// # Errors
    /// See [`select_function`](Self::select_function).
    pub fn unselect_function(&mut self, vaddr: u64) -> Result<(), crate::domain::CatalogError> {
        if self.state == CaptureState::Capturing {
            self.instrumentation.stage_unselect(vaddr);
            Ok(())
        } else {
            self.catalog.unselect(vaddr)
        }
    }

    /// Select every function whose pretty name contains `pattern`
    pub fn select_matching(&mut self, pattern: &str) -> usize {
        let matches = self.catalog.find_matching(pattern);
        matches.iter().filter(|vaddr| self.select_function(**vaddr).is_ok()).count()
    }

    /// Block until queued symbol loads finish or `timeout` passes
    pub fn wait_for_symbols(&mut self, timeout: Duration) -> Vec<ModuleLoadOutcome> {
        self.modules.wait_idle(&self.catalog, self.sink.as_ref(), timeout)
    }

    /// # Errors
    /// Preset I/O failures.
    pub fn save_preset(&self, path: &Path) -> Result<usize, SessionError> {
        let mut preset = Preset::from_selection(&self.catalog);
        if let Some(target) = &self.target {
            preset.process_full_path.clone_from(&target.path);
        }
        preset.arguments.clone_from(&self.params.arguments);
        preset.working_directory.clone_from(&self.params.working_directory);
        preset.save(path)?;
        Ok(preset.function_count())
    }

    /// Re-select a saved preset; modules still loading are applied when they arrive
    ///
    /// # Errors
    /// Preset I/O, parse or version failures.
    pub fn load_preset(&mut self, path: &Path) -> Result<PresetApplication, SessionError> {
        let preset = Preset::load(path)?;
        Ok(self.modules.apply_preset(preset, &self.catalog, self.sink.as_ref()))
    }

    fn require_not_capturing(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.state {
            CaptureState::Capturing | CaptureState::Draining => {
                Err(SessionError::InvalidState { operation, state: self.state.as_str() })
            }
            _ => Ok(()),
        }
    }

    /// Selected functions with at least one timer, longest total first
    #[must_use]
    pub fn top_functions(&self, limit: usize) -> Vec<(String, StatsSnapshot)> {
        let mut rows: Vec<(String, StatsSnapshot)> = self
            .catalog
            .selected_functions()
            .into_iter()
            .chain(self.instrumentation.hooked().iter().filter_map(|v| self.catalog.find_exact(*v)))
            .map(|f| (f.pretty_name.clone(), f.stats.snapshot()))
            .filter(|(_, stats)| stats.count > 0)
            .collect();
        rows.sort_by(|a, b| b.1.total_ms.total_cmp(&a.1.total_ms).then_with(|| a.0.cmp(&b.0)));
        rows.dedup_by(|a, b| a.0 == b.0);
        rows.truncate(limit);
        rows
    }

    #[must_use]
    pub fn summary(&self) -> CaptureSummary {
        CaptureSummary {
            session_id: self.session_id,
            timers: self.timers,
            open_timers: self.router.open_timers(),
            hooks: self.last_hooks.clone(),
            tracer: self.tracer_counters.or_else(|| self.tracer.as_ref().map(BpftraceDriver::counters)),
            transport: self.dispatcher.stats().snapshot(),
            samples: self.sampling.sample_count(),
        }
    }

    #[must_use]
    pub fn state(&self) -> CaptureState {
        self.state
    }

    #[must_use]
    pub fn params(&self) -> &CaptureParams {
        &self.params
    }

    #[must_use]
    pub fn target(&self) -> Option<&TargetProcess> {
        self.target.as_ref()
    }

    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<FunctionCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn callstacks(&self) -> &Arc<CallstackInterner> {
        &self.callstacks
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn router(&self) -> &Arc<TimerRouter> {
        &self.router
    }

    #[must_use]
    pub fn sampling(&self) -> &SamplingProfiler {
        &self.sampling
    }

    pub fn modules_mut(&mut self) -> &mut ModuleManager {
        &mut self.modules
    }

    pub fn instrumentation_mut(&mut self) -> &mut InstrumentationController {
        &mut self.instrumentation
    }

    #[must_use]
    pub fn last_report(&self) -> Option<&SamplingReport> {
        self.last_report.as_ref()
    }

    #[must_use]
    pub fn timers_received(&self) -> u64 {
        self.timers
    }
}

impl Drop for CaptureContext {
    fn drop(&mut self) {
        self.stop();
        if let Some(link) = &self.link {
            link.disconnect();
        }
    }
}
