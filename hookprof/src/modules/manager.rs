//! Asynchronous module loading
//!
//! Loads are queued and handed to a single worker thread one at a time so
//! symbol parsing never competes with itself. Results come back over a
//! channel and are integrated on the main thread by [`ModuleManager::update`].

use super::provider::{ModuleRequest, SymbolProvider};
use super::watched::WatchedVariable;
use crate::catalog::{FunctionCatalog, Module};
use crate::domain::SymbolError;
use crate::session::preset::{Preset, PresetApplication};
use crate::session::Sink;
use crate::transport::{Header, Message};
use crossbeam_channel::{unbounded, Receiver, Sender};
use hookprof_common::DataTransferKind;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type LoadResult = (ModuleRequest, Result<Module, SymbolError>);

const IDLE_POLL: Duration = Duration::from_millis(5);

/// What happened to one module on integration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLoadOutcome {
    pub path: String,
    pub functions: usize,
    pub duplicates: usize,
    pub preset: Option<PresetApplication>,
    pub error: Option<String>,
}

pub struct ModuleManager {
    provider: Arc<dyn SymbolProvider>,
    queue: VecDeque<ModuleRequest>,
    in_flight: Option<(String, JoinHandle<()>)>,
    done_tx: Sender<LoadResult>,
    done_rx: Receiver<LoadResult>,
    target_modules: HashMap<String, ModuleRequest>,
    preset: Option<Preset>,
    /// Preset modules whose load has not completed yet
    preset_pending: BTreeSet<String>,
    preset_missing: usize,
    watched: BTreeMap<u64, WatchedVariable>,
}

impl ModuleManager {
    #[must_use]
    pub fn new(provider: Arc<dyn SymbolProvider>) -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            provider,
            queue: VecDeque::new(),
            in_flight: None,
            done_tx,
            done_rx,
            target_modules: HashMap::new(),
            preset: None,
            preset_pending: BTreeSet::new(),
            preset_missing: 0,
            watched: BTreeMap::new(),
        }
    }

    /// Modules mapped in the current target, used to resolve preset paths
    pub fn set_target_modules(&mut self, modules: Vec<ModuleRequest>) {
        self.target_modules = modules.into_iter().map(|m| (m.path.clone(), m)).collect();
    }

    #[must_use]
    pub fn target_module(&self, path: &str) -> Option<&ModuleRequest> {
        self.target_modules.get(path)
    }

    /// Queue a load; duplicates of a queued or running load are ignored
    pub fn request_load(&mut self, request: ModuleRequest) {
        let busy = self.in_flight.as_ref().is_some_and(|(path, _)| *path == request.path);
        if busy || self.queue.iter().any(|r| r.path == request.path) {
            return;
        }
        log::debug!("Queued symbol load for {}", request.path);
        self.queue.push_back(request);
        self.dispatch_next();
    }

    fn dispatch_next(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(request) = self.queue.pop_front() else {
            return;
        };
        let provider = Arc::clone(&self.provider);
        let done = self.done_tx.clone();
        let path = request.path.clone();
        let worker = thread::Builder::new().name("hookprof-symbols".into()).spawn(move || {
            let result = provider.load(&request);
            // The manager outlives its workers
            let _ = done.send((request, result));
        });
        match worker {
            Ok(handle) => self.in_flight = Some((path, handle)),
            Err(e) => {
                log::error!("Failed to spawn symbol loader for {path}: {e}");
                let _ = self.done_tx.send((
                    ModuleRequest::new(path.clone(), 0, 0),
                    Err(SymbolError::Parse { path: path.into(), message: e.to_string() }),
                ));
            }
        }
    }

    /// Integrate finished loads; call on every tick
    pub fn update(&mut self, catalog: &FunctionCatalog, sink: &dyn Sink) -> Vec<ModuleLoadOutcome> {
        let mut outcomes = Vec::new();
        while let Ok((request, result)) = self.done_rx.try_recv() {
            if self.in_flight.as_ref().is_some_and(|(path, _)| *path == request.path) {
                self.join_in_flight();
            }
            outcomes.push(self.integrate(&request, result, catalog, sink));
            self.dispatch_next();
        }

        // A worker that finished without reporting panicked inside the provider
        if self.in_flight.as_ref().is_some_and(|(_, handle)| handle.is_finished()) && self.done_rx.is_empty() {
            if let Some((path, handle)) = self.in_flight.take() {
                if handle.join().is_err() {
                    log::error!("Symbol loader panicked on {path}");
                }
                let request = self
                    .target_modules
                    .get(&path)
                    .cloned()
                    .unwrap_or_else(|| ModuleRequest::new(path.clone(), 0, 0));
                let error = SymbolError::Unavailable(path.into());
                outcomes.push(self.integrate(&request, Err(error), catalog, sink));
                self.dispatch_next();
            }
        }
        outcomes
    }

    fn join_in_flight(&mut self) {
        if let Some((path, handle)) = self.in_flight.take() {
            if handle.join().is_err() {
                log::error!("Symbol loader panicked on {path}");
            }
        }
    }

    fn integrate(
        &mut self,
        request: &ModuleRequest,
        result: Result<Module, SymbolError>,
        catalog: &FunctionCatalog,
        sink: &dyn Sink,
    ) -> ModuleLoadOutcome {
        let mut outcome = ModuleLoadOutcome {
            path: request.path.clone(),
            functions: 0,
            duplicates: 0,
            preset: None,
            error: None,
        };
        match result {
            Ok(module) => {
                let integration = catalog.add_module(module);
                outcome.functions = integration.added;
                outcome.duplicates = integration.duplicates;
                sink.on_symbols(&request.path, integration.added);
            }
            Err(e) => {
                log::warn!("{e}");
                catalog.mark_symbols_unavailable(&request.path, request.base_address, request.size);
                sink.send_message_to_ui(&format!("Could not load symbols for {}: {e}", request.path));
                outcome.error = Some(e.to_string());
            }
        }

        if self.preset_pending.remove(&request.path) {
            if let Some(preset) = &self.preset {
                let applied = preset.apply_module(catalog, &request.path);
                if outcome.error.is_some() {
                    self.preset_missing += preset.modules.get(&request.path).map_or(0, |m| m.function_hashes.len());
                } else {
                    self.preset_missing += applied.missing;
                    outcome.preset = Some(applied);
                }
            }
            self.finish_preset_if_done(sink);
        }
        outcome
    }

    /// Re-select a preset's functions, loading modules that are not in the catalog yet
    ///
    /// Modules already loaded are applied immediately; the rest are applied
    /// as their loads complete. Misses are reported once, in aggregate.
    pub fn apply_preset(&mut self, preset: Preset, catalog: &FunctionCatalog, sink: &dyn Sink) -> PresetApplication {
        let mut immediate = PresetApplication::default();
        self.preset_pending.clear();
        self.preset_missing = 0;

        for (path, module) in &preset.modules {
            if catalog.has_module(path) {
                let applied = preset.apply_module(catalog, path);
                immediate.selected += applied.selected;
                immediate.missing += applied.missing;
            } else if let Some(request) = self.target_modules.get(path).cloned() {
                self.preset_pending.insert(path.clone());
                self.request_load(request);
            } else {
                log::warn!("Preset module {path} is not loaded in the target");
                immediate.missing += module.function_hashes.len();
            }
        }
        self.preset_missing = immediate.missing;
        self.preset = Some(preset);
        self.finish_preset_if_done(sink);
        immediate
    }

    fn finish_preset_if_done(&mut self, sink: &dyn Sink) {
        if !self.preset_pending.is_empty() || self.preset.is_none() {
            return;
        }
        if self.preset_missing > 0 {
            sink.send_message_to_ui(&format!(
                "{} preset functions could not be found in the loaded modules",
                self.preset_missing
            ));
        }
        self.preset = None;
        self.preset_missing = 0;
    }

    #[must_use]
    pub fn has_pending_preset(&self) -> bool {
        self.preset.is_some()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none() && self.done_rx.is_empty()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    /// Tick until every queued load is integrated or `timeout` passes
    pub fn wait_idle(&mut self, catalog: &FunctionCatalog, sink: &dyn Sink, timeout: Duration) -> Vec<ModuleLoadOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcomes = self.update(catalog, sink);
        while !self.is_idle() && Instant::now() < deadline {
            thread::sleep(IDLE_POLL);
            outcomes.extend(self.update(catalog, sink));
        }
        outcomes
    }

    pub fn watch(&mut self, variable: WatchedVariable) {
        self.watched.insert(variable.address, variable);
    }

    pub fn unwatch(&mut self, address: u64) -> Option<WatchedVariable> {
        self.watched.remove(&address)
    }

    #[must_use]
    pub fn watched(&self, address: u64) -> Option<&WatchedVariable> {
        self.watched.get(&address)
    }

    pub fn watched_variables(&self) -> impl Iterator<Item = &WatchedVariable> {
        self.watched.values()
    }

    /// Hand data sent back by the stub to whoever asked for it
    ///
    /// Data goes to the watched variable at `address`; code goes to the
    /// disassembly sink with the function containing `address`. Returns
    /// whether anything consumed the bytes.
    pub fn route_data_transfer(
        &mut self,
        address: u64,
        kind: DataTransferKind,
        bytes: &[u8],
        catalog: &FunctionCatalog,
        sink: &dyn Sink,
    ) -> bool {
        match kind {
            DataTransferKind::Data => match self.watched.get_mut(&address) {
                Some(variable) => {
                    let rendered = variable.receive_value(bytes).map(ToString::to_string);
                    if let Some(value) = rendered {
                        sink.log(&format!("{} = {value}", variable.name));
                    }
                    true
                }
                None => {
                    log::debug!("No watched variable at 0x{address:x}");
                    false
                }
            },
            DataTransferKind::Code => match catalog.find_containing(address) {
                Some(function) => {
                    sink.on_disassembly(&function, bytes);
                    true
                }
                None => {
                    log::debug!("Code at 0x{address:x} belongs to no known function");
                    false
                }
            },
        }
    }

    /// [`route_data_transfer`](Self::route_data_transfer) for a raw `SetData` frame
    pub fn route_message(&mut self, message: &Message, catalog: &FunctionCatalog, sink: &dyn Sink) -> bool {
        let Header::DataTransfer { address, kind, .. } = message.header else {
            return false;
        };
        match DataTransferKind::from_u32(kind) {
            Some(kind) => self.route_data_transfer(address, kind, &message.payload, catalog, sink),
            None => {
                log::warn!("Unknown data transfer kind {kind}");
                false
            }
        }
    }
}

impl Drop for ModuleManager {
    fn drop(&mut self) {
        self.queue.clear();
        self.join_in_flight();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Function;
    use crate::hashing::string_hash;
    use crate::modules::watched::{VariableType, VariableValue};
    use crate::session::preset::PresetModule;
    use crate::session::RecordingSink;
    use hookprof_common::MessageType;
    use parking_lot::Mutex;

    /// Serves canned modules and records the order loads were requested in
    #[derive(Default)]
    struct FakeProvider {
        modules: HashMap<String, Vec<(&'static str, u64)>>,
        order: Mutex<Vec<String>>,
        active: Mutex<usize>,
        max_active: Mutex<usize>,
    }

    impl SymbolProvider for FakeProvider {
        fn load(&self, request: &ModuleRequest) -> Result<Module, SymbolError> {
            {
                let mut active = self.active.lock();
                *active += 1;
                let mut max = self.max_active.lock();
                *max = (*max).max(*active);
            }
            self.order.lock().push(request.path.clone());
            thread::sleep(Duration::from_millis(5));
            *self.active.lock() -= 1;

            let functions = self
                .modules
                .get(&request.path)
                .ok_or_else(|| SymbolError::Unavailable(request.path.clone().into()))?;
            let mut module = Module::new(&request.path, request.base_address, request.size, 0);
            for (name, address) in functions {
                module
                    .add_function(Function::new(*name, *address, 0x20))
                    .map_err(|e| SymbolError::Parse { path: request.path.clone().into(), message: e.to_string() })?;
            }
            Ok(module)
        }
    }

    fn provider() -> Arc<FakeProvider> {
        let mut modules = HashMap::new();
        modules.insert("/bin/game".to_string(), vec![("main", 0x100), ("render", 0x200)]);
        modules.insert("/lib/libphys.so".to_string(), vec![("step", 0x100)]);
        Arc::new(FakeProvider { modules, ..FakeProvider::default() })
    }

    #[test]
    fn test_loads_run_one_at_a_time_in_order() {
        let provider = provider();
        let mut manager = ModuleManager::new(provider.clone());
        let catalog = FunctionCatalog::new();
        let sink = RecordingSink::new();

        manager.request_load(ModuleRequest::new("/bin/game", 0x40_0000, 0x1000));
        manager.request_load(ModuleRequest::new("/lib/libphys.so", 0x7f00_0000, 0x1000));
        manager.request_load(ModuleRequest::new("/bin/game", 0x40_0000, 0x1000));
        assert_eq!(manager.pending(), 2);

        let outcomes = manager.wait_idle(&catalog, &sink, Duration::from_secs(5));
        assert_eq!(outcomes.len(), 2);
        assert_eq!(*provider.order.lock(), vec!["/bin/game".to_string(), "/lib/libphys.so".to_string()]);
        assert_eq!(*provider.max_active.lock(), 1);
        assert_eq!(catalog.len(), 3);
        assert_eq!(sink.symbols.lock().len(), 2);
    }

    #[test]
    fn test_failed_load_marks_module_unavailable() {
        let mut manager = ModuleManager::new(provider());
        let catalog = FunctionCatalog::new();
        let sink = RecordingSink::new();

        manager.request_load(ModuleRequest::new("/lib/stripped.so", 0x1000, 0x100));
        let outcomes = manager.wait_idle(&catalog, &sink, Duration::from_secs(5));
        assert!(outcomes[0].error.is_some());
        assert!(catalog.has_module("/lib/stripped.so"));
        assert!(!catalog.symbols_available("/lib/stripped.so"));
        assert_eq!(sink.messages().len(), 1);
    }

    #[test]
    fn test_preset_applies_as_modules_arrive() {
        let mut manager = ModuleManager::new(provider());
        let catalog = FunctionCatalog::new();
        let sink = RecordingSink::new();
        manager.set_target_modules(vec![ModuleRequest::new("/bin/game", 0x40_0000, 0x1000)]);

        let mut preset = Preset::default();
        preset.modules.insert(
            "/bin/game".to_string(),
            PresetModule { name: "game".to_string(), function_hashes: vec![string_hash("render"), 99] },
        );
        preset.modules.insert(
            "/lib/gone.so".to_string(),
            PresetModule { name: "gone.so".to_string(), function_hashes: vec![1, 2] },
        );

        let immediate = manager.apply_preset(preset, &catalog, &sink);
        assert_eq!(immediate, PresetApplication { selected: 0, missing: 2 });
        assert!(manager.has_pending_preset());

        let outcomes = manager.wait_idle(&catalog, &sink, Duration::from_secs(5));
        assert_eq!(outcomes[0].preset, Some(PresetApplication { selected: 1, missing: 1 }));
        assert_eq!(catalog.selected_addresses(), vec![0x40_0200]);
        assert!(!manager.has_pending_preset());
        assert_eq!(sink.messages(), vec!["3 preset functions could not be found in the loaded modules".to_string()]);
    }

    #[test]
    fn test_routes_data_and_code() {
        let mut manager = ModuleManager::new(provider());
        let catalog = FunctionCatalog::new();
        let sink = RecordingSink::new();
        manager.request_load(ModuleRequest::new("/bin/game", 0x40_0000, 0x1000));
        manager.wait_idle(&catalog, &sink, Duration::from_secs(5));

        manager.watch(WatchedVariable::new("g_frame", 0x50_0000, VariableType::U32));
        assert!(manager.route_data_transfer(0x50_0000, DataTransferKind::Data, &9u32.to_le_bytes(), &catalog, &sink));
        assert_eq!(manager.watched(0x50_0000).unwrap().value(), Some(&VariableValue::UInt(9)));
        assert!(!manager.route_data_transfer(0x60_0000, DataTransferKind::Data, &[0; 4], &catalog, &sink));

        let reply = Message::new(MessageType::SetData, 1)
            .with_header(Header::DataTransfer { address: 0x40_0210, kind: DataTransferKind::Code as u32, size: 2 })
            .with_payload(vec![0x55, 0xc3]);
        assert!(manager.route_message(&reply, &catalog, &sink));
        assert_eq!(sink.disassembly.lock()[0], (0x40_0200, vec![0x55, 0xc3]));
    }
}
