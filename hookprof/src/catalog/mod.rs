//! Function catalog
//!
//! Owns every [`Module`] of the current target and keeps the cross-module
//! indices keyed by virtual address:
//!
//! - address → function, for exact lookups and the containing-function
//!   lookup used when resolving stack frames
//! - the selected set
//!
//! The name-hash index used for preset replay lives per module.
//!
//! All structural operations go through one reader-writer lock. Statistics
//! are atomics inside each [`Function`], so stats updates only need the read
//! lock and never stall readers.

pub mod function;
pub mod module;

pub use function::{CallingConvention, Function, FunctionStats, StatsSnapshot};
pub use module::Module;

use crate::clock::ns_to_ms_f64;
use crate::domain::CatalogError;
use crate::hashing::string_hash;
use hookprof_common::{FunctionKind, Timer};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy)]
struct FunctionRef {
    module: usize,
    slot: usize,
}

#[derive(Default)]
struct CatalogInner {
    /// Module arena; unloaded modules leave a `None` slot behind
    modules: Vec<Option<Module>>,
    module_index: HashMap<String, usize>,
    by_vaddr: BTreeMap<u64, FunctionRef>,
    selected: BTreeSet<u64>,
}

impl CatalogInner {
    fn get(&self, r: FunctionRef) -> Option<&Function> {
        self.modules.get(r.module)?.as_ref()?.function(r.slot)
    }

    fn get_mut(&mut self, r: FunctionRef) -> Option<&mut Function> {
        self.modules.get_mut(r.module)?.as_mut()?.function_mut(r.slot)
    }

    fn module(&self, index: usize) -> Option<&Module> {
        self.modules.get(index)?.as_ref()
    }

    fn lookup(&self, vaddr: u64) -> Option<&Function> {
        self.by_vaddr.get(&vaddr).and_then(|r| self.get(*r))
    }

    fn containing(&self, vaddr: u64) -> Option<(u64, &Function)> {
        let (start, r) = self.by_vaddr.range(..=vaddr).next_back()?;
        let function = self.get(*r)?;
        if function.size > 0 {
            if vaddr - start >= function.size {
                return None;
            }
        } else if let Some(end) = self.module(r.module).and_then(Module::end_address) {
            if vaddr >= end {
                return None;
            }
        }
        Some((*start, function))
    }

    fn remove_module(&mut self, index: usize) -> Option<Module> {
        let module = self.modules.get_mut(index)?.take()?;
        self.module_index.remove(&module.path);
        for function in module.functions() {
            let vaddr = function.virtual_address();
            if matches!(self.by_vaddr.get(&vaddr), Some(r) if r.module == index) {
                self.by_vaddr.remove(&vaddr);
                self.selected.remove(&vaddr);
            }
        }
        Some(module)
    }
}

/// Result of integrating a module into the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleIntegration {
    pub added: usize,
    /// Functions whose virtual address was already owned by another module
    pub duplicates: usize,
}

#[derive(Default)]
pub struct FunctionCatalog {
    inner: RwLock<CatalogInner>,
}

impl FunctionCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate a freshly loaded module, replacing any module at the same path
    pub fn add_module(&self, module: Module) -> ModuleIntegration {
        let mut inner = self.inner.write();
        if let Some(previous) = inner.module_index.get(&module.path).copied() {
            debug!("Replacing previously loaded module {}", module.path);
            inner.remove_module(previous);
        }

        let index = inner.modules.len();
        let mut report = ModuleIntegration::default();
        for (slot, function) in module.functions().iter().enumerate() {
            let vaddr = function.virtual_address();
            if inner.by_vaddr.contains_key(&vaddr) {
                report.duplicates += 1;
                continue;
            }
            inner.by_vaddr.insert(vaddr, FunctionRef { module: index, slot });
            report.added += 1;
        }
        if report.duplicates > 0 {
            warn!("{}: {} functions overlap other modules", module.path, report.duplicates);
        }
        inner.module_index.insert(module.path.clone(), index);
        inner.modules.push(Some(module));
        report
    }

    /// Add a single function, creating its module on first use
    ///
    /// The module base and load bias of a newly created module are taken
    /// from the function itself.
    ///
    /// # Errors
    /// Returns [`CatalogError::DuplicateFunction`] if the virtual address is already taken.
    pub fn add(&self, mut function: Function) -> Result<u64, CatalogError> {
        function.kind = FunctionKind::detect(&function.pretty_name);
        let mut inner = self.inner.write();

        let index = if let Some(index) = inner.module_index.get(&function.module_path).copied() {
            index
        } else {
            let index = inner.modules.len();
            inner.modules.push(Some(Module::new(
                function.module_path.clone(),
                function.module_base_address,
                0,
                function.load_bias,
            )));
            inner.module_index.insert(function.module_path.clone(), index);
            index
        };

        let (base, bias) = inner
            .module(index)
            .map(|m| (m.base_address, m.load_bias))
            .ok_or(CatalogError::UnknownFunction(function.address))?;
        let vaddr = function.address.wrapping_sub(bias).wrapping_add(base);
        if inner.by_vaddr.contains_key(&vaddr) {
            return Err(CatalogError::DuplicateFunction(vaddr));
        }

        let module = inner.modules[index].as_mut().ok_or(CatalogError::UnknownFunction(vaddr))?;
        let slot = module.add_function(function)?;
        inner.by_vaddr.insert(vaddr, FunctionRef { module: index, slot });
        Ok(vaddr)
    }

    /// Name a stack frame that no known function covers
    ///
    /// The frame becomes a one-byte function of `module_path`, placed so its
    /// virtual address is `vaddr`. Returns whether anything was added.
    pub fn add_frame_symbol(&self, vaddr: u64, name: &str, module_path: &str) -> bool {
        if name.is_empty() || self.find_containing(vaddr).is_some() {
            return false;
        }
        let (base, bias) = {
            let inner = self.inner.read();
            inner
                .module_index
                .get(module_path)
                .and_then(|index| inner.module(*index))
                .map_or((0, 0), |m| (m.base_address, m.load_bias))
        };
        let address = vaddr.wrapping_sub(base).wrapping_add(bias);
        match self.add(Function::new(name, address, 1).in_module(module_path, base, bias)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Frame symbol {name} not added: {e}");
                false
            }
        }
    }

    /// Drop a module and every index entry and selection that points into it
    pub fn unload_module(&self, path: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.module_index.get(path).copied() {
            Some(index) => inner.remove_module(index).is_some(),
            None => false,
        }
    }

    #[must_use]
    pub fn has_module(&self, path: &str) -> bool {
        self.inner.read().module_index.contains_key(path)
    }

    #[must_use]
    pub fn module_paths(&self) -> Vec<String> {
        self.inner.read().modules.iter().flatten().map(|m| m.path.clone()).collect()
    }

    /// Mark a module whose symbols failed to load
    pub fn mark_symbols_unavailable(&self, path: &str, base_address: u64, size: u64) {
        let mut inner = self.inner.write();
        if inner.module_index.contains_key(path) {
            return;
        }
        let mut module = Module::new(path, base_address, size, 0);
        module.symbols_available = false;
        let index = inner.modules.len();
        inner.module_index.insert(path.to_string(), index);
        inner.modules.push(Some(module));
    }

    #[must_use]
    pub fn symbols_available(&self, path: &str) -> bool {
        let inner = self.inner.read();
        inner
            .module_index
            .get(path)
            .and_then(|i| inner.module(*i))
            .is_some_and(|m| m.symbols_available)
    }

    /// # Errors
    /// Returns [`CatalogError::UnknownFunction`] if no function lives at `vaddr`.
    pub fn select(&self, vaddr: u64) -> Result<(), CatalogError> {
        self.set_selected(vaddr, true)
    }

    /// # Errors
    /// Returns [`CatalogError::UnknownFunction`] if no function lives at `vaddr`.
    pub fn unselect(&self, vaddr: u64) -> Result<(), CatalogError> {
        self.set_selected(vaddr, false)
    }

    fn set_selected(&self, vaddr: u64, selected: bool) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        let r = *inner.by_vaddr.get(&vaddr).ok_or(CatalogError::UnknownFunction(vaddr))?;
        if let Some(function) = inner.get_mut(r) {
            function.selected = selected;
        }
        if selected {
            inner.selected.insert(vaddr);
        } else {
            inner.selected.remove(&vaddr);
        }
        Ok(())
    }

    pub fn clear_selection(&self) {
        let mut inner = self.inner.write();
        let selected: Vec<u64> = std::mem::take(&mut inner.selected).into_iter().collect();
        for vaddr in selected {
            if let Some(r) = inner.by_vaddr.get(&vaddr).copied() {
                if let Some(function) = inner.get_mut(r) {
                    function.selected = false;
                }
            }
        }
    }

    #[must_use]
    pub fn is_selected(&self, vaddr: u64) -> bool {
        self.inner.read().selected.contains(&vaddr)
    }

    /// Selected virtual addresses in ascending order
    #[must_use]
    pub fn selected_addresses(&self) -> Vec<u64> {
        self.inner.read().selected.iter().copied().collect()
    }

    #[must_use]
    pub fn selected_functions(&self) -> Vec<Function> {
        let inner = self.inner.read();
        inner.selected.iter().filter_map(|v| inner.lookup(*v).cloned()).collect()
    }

    /// Functions that get hooked on capture start: selected or API functions
    #[must_use]
    pub fn hookable_functions(&self) -> Vec<Function> {
        let inner = self.inner.read();
        inner
            .by_vaddr
            .values()
            .filter_map(|r| inner.get(*r))
            .filter(|f| f.selected || f.is_api_function())
            .cloned()
            .collect()
    }

    /// Every function in virtual address order
    #[must_use]
    pub fn functions_snapshot(&self) -> Vec<Function> {
        let inner = self.inner.read();
        inner.by_vaddr.values().filter_map(|r| inner.get(*r)).cloned().collect()
    }

    /// Function whose virtual address equals `vaddr`
    #[must_use]
    pub fn find_exact(&self, vaddr: u64) -> Option<Function> {
        self.inner.read().lookup(vaddr).cloned()
    }

    /// Function with the greatest virtual address not above `vaddr`
    ///
    /// Queries below the first function, past a sized function's end, or
    /// past the end of an unsized function's module return `None`.
    #[must_use]
    pub fn find_containing(&self, vaddr: u64) -> Option<Function> {
        self.inner.read().containing(vaddr).map(|(_, f)| f.clone())
    }

    /// Virtual address of the containing function, without cloning it
    #[must_use]
    pub fn containing_address(&self, vaddr: u64) -> Option<u64> {
        self.inner.read().containing(vaddr).map(|(start, _)| start)
    }

    /// Virtual address of the function in `module_path` with this name hash
    #[must_use]
    pub fn find_by_hash(&self, module_path: &str, hash: u64) -> Option<u64> {
        let inner = self.inner.read();
        let module = inner.module_index.get(module_path).and_then(|i| inner.module(*i))?;
        module.find_by_hash(hash).map(Function::virtual_address)
    }

    /// First function in any module with exactly this pretty name
    #[must_use]
    pub fn find_by_name(&self, pretty_name: &str) -> Option<u64> {
        let hash = string_hash(pretty_name);
        let inner = self.inner.read();
        inner
            .modules
            .iter()
            .flatten()
            .filter_map(|m| m.find_by_hash(hash))
            .find(|f| f.pretty_name == pretty_name)
            .map(Function::virtual_address)
    }

    /// Virtual addresses of functions whose pretty name contains `pattern`
    #[must_use]
    pub fn find_matching(&self, pattern: &str) -> Vec<u64> {
        let inner = self.inner.read();
        inner
            .by_vaddr
            .iter()
            .filter(|(_, r)| inner.get(**r).is_some_and(|f| f.pretty_name.contains(pattern)))
            .map(|(vaddr, _)| *vaddr)
            .collect()
    }

    /// Fold a closed timer into its function's statistics
    ///
    /// Returns `false` when the timer's function is not in the catalog.
    pub fn update_stats(&self, vaddr: u64, timer: &Timer) -> bool {
        let inner = self.inner.read();
        match inner.lookup(vaddr) {
            Some(function) => {
                function.stats.update(ns_to_ms_f64(timer.elapsed_ns()));
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn stats(&self, vaddr: u64) -> Option<StatsSnapshot> {
        self.inner.read().lookup(vaddr).map(|f| f.stats.snapshot())
    }

    pub fn reset_stats(&self) {
        let inner = self.inner.read();
        for function in inner.modules.iter().flatten().flat_map(Module::functions) {
            function.stats.reset();
        }
    }

    /// Override the detected kind, e.g. for engine integrations
    ///
    /// # Errors
    /// Returns [`CatalogError::UnknownFunction`] if no function lives at `vaddr`.
    pub fn set_kind(&self, vaddr: u64, kind: FunctionKind) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        let r = *inner.by_vaddr.get(&vaddr).ok_or(CatalogError::UnknownFunction(vaddr))?;
        inner.get_mut(r).ok_or(CatalogError::UnknownFunction(vaddr))?.kind = kind;
        Ok(())
    }

    /// Allow hooking this function even when its size is not confirmed safe
    ///
    /// # Errors
    /// Returns [`CatalogError::UnknownFunction`] if no function lives at `vaddr`.
    pub fn set_unsafe_override(&self, vaddr: u64, allow: bool) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        let r = *inner.by_vaddr.get(&vaddr).ok_or(CatalogError::UnknownFunction(vaddr))?;
        inner.get_mut(r).ok_or(CatalogError::UnknownFunction(vaddr))?.allow_unsafe_hook = allow;
        Ok(())
    }

    /// Path of the module that owns the function at `vaddr`
    #[must_use]
    pub fn module_of(&self, vaddr: u64) -> Option<String> {
        let inner = self.inner.read();
        let r = inner.by_vaddr.get(&vaddr)?;
        inner.module(r.module).map(|m| m.path.clone())
    }

    /// Run `visit` against one module under the read lock
    pub fn with_module<R>(&self, path: &str, visit: impl FnOnce(&Module) -> R) -> Option<R> {
        let inner = self.inner.read();
        inner.module_index.get(path).and_then(|i| inner.module(*i)).map(visit)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_vaddr.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every module and selection
    pub fn clear(&self) {
        *self.inner.write() = CatalogInner::default();
    }
}
