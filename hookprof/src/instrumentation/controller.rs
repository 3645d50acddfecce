//! Hook installation for one capture
//!
//! `pre_hook` resets the stub and gathers the implicit hooks, `send_hooks`
//! buckets every hookable function by message type and ships one address
//! list per bucket, and `teardown` stops the capture and closes whatever
//! zones are still open.

use super::router::TimerRouter;
use crate::catalog::{Function, FunctionCatalog};
use crate::transport::{is_congested, Header, Link, Message};
use hookprof_common::{FunctionKind, MessageType};
use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::Duration;

/// Smallest function body that fits a hook trampoline
pub const MIN_HOOKABLE_SIZE: u64 = 5;

/// Allocator entry points hooked when allocation tracking is on
pub const ALLOCATOR_FUNCTIONS: [(&str, FunctionKind); 4] = [
    ("malloc", FunctionKind::Alloc),
    ("calloc", FunctionKind::Alloc),
    ("free", FunctionKind::Free),
    ("realloc", FunctionKind::Realloc),
];

const OUTPUT_DEBUG_STRING: &str = "OutputDebugStringA";
const UNREAL_NAME_TABLE: &str = "GFNameTableForDebuggerVisualizers_MT";
const UNREAL_GET_FNAME: &str = "UObjectBase::GetFName";
const UNREAL_NAME_ENTRY_SIZE: u32 = 8;

/// Throttle polls before a bucket is sent regardless of congestion
const MAX_THROTTLE_POLLS: u32 = 50;

#[derive(Debug, Clone)]
pub struct HookConfig {
    pub allow_unsafe_hooking: bool,
    pub hook_output_debug_string: bool,
    pub hook_allocators: bool,
    pub unreal_support: bool,
    /// Outstanding frames above which new buckets wait
    pub congestion_threshold: usize,
    pub throttle: Duration,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            allow_unsafe_hooking: false,
            hook_output_debug_string: false,
            hook_allocators: true,
            unreal_support: false,
            congestion_threshold: 1024,
            throttle: Duration::from_millis(10),
        }
    }
}

/// One argument read: stack/register offset and byte count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgRead {
    pub offset: i32,
    pub size: u32,
}

/// Per-call argument export for one hooked function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgTrackingRule {
    pub function_vaddr: u64,
    pub args: Vec<ArgRead>,
}

impl ArgTrackingRule {
    /// `(offset i32 | size u32) * num_args`
    #[must_use]
    pub fn to_message(&self, session_id: u32) -> Message {
        let mut payload = Vec::with_capacity(self.args.len() * 8);
        for arg in &self.args {
            payload.extend_from_slice(&arg.offset.to_le_bytes());
            payload.extend_from_slice(&arg.size.to_le_bytes());
        }
        #[allow(clippy::cast_possible_truncation)]
        let num_args = self.args.len() as u32;
        Message::new(MessageType::ArgTracking, session_id)
            .with_header(Header::ArgTracking { address: self.function_vaddr, num_args })
            .with_payload(payload)
    }
}

/// Engine metadata the stub needs to name actors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnrealInfo {
    pub names_address: u64,
    pub actor_name_address: u64,
    pub entry_size: u32,
}

impl UnrealInfo {
    /// Resolve the engine symbols in `catalog`, `None` if any is missing
    #[must_use]
    pub fn locate(catalog: &FunctionCatalog) -> Option<Self> {
        Some(Self {
            names_address: catalog.find_by_name(UNREAL_NAME_TABLE)?,
            actor_name_address: catalog.find_by_name(UNREAL_GET_FNAME)?,
            entry_size: UNREAL_NAME_ENTRY_SIZE,
        })
    }
}

/// Outcome of [`InstrumentationController::send_hooks`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookReport {
    pub installed: usize,
    /// Virtual addresses refused by the hookability rule
    pub rejected: Vec<u64>,
    pub per_kind: BTreeMap<MessageType, usize>,
    pub arg_rules: usize,
    pub unreal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StagedChange {
    Select(u64),
    Unselect(u64),
}

#[derive(Debug, Default)]
pub struct InstrumentationController {
    config: HookConfig,
    buckets: BTreeMap<MessageType, Vec<u64>>,
    /// Implicit hooks found by `pre_hook`, with the kind they are hooked as
    implicit: Vec<(u64, FunctionKind)>,
    arg_rules: Vec<ArgTrackingRule>,
    staged: Vec<StagedChange>,
    hooked: BTreeSet<u64>,
    unreal: Option<UnrealInfo>,
}

impl InstrumentationController {
    #[must_use]
    pub fn new(config: HookConfig) -> Self {
        Self { config, ..Self::default() }
    }

    #[must_use]
    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: HookConfig) {
        self.config = config;
    }

    /// Whether `function` may be hooked under the current settings
    ///
    /// Functions of unknown size need their own override; the global unsafe
    /// flag only covers functions that are known to be too small.
    #[must_use]
    pub fn is_hookable(&self, function: &Function) -> bool {
        function.size >= MIN_HOOKABLE_SIZE
            || function.allow_unsafe_hook
            || (self.config.allow_unsafe_hooking && function.size > 0)
    }

    /// Reset the stub and collect the hooks every capture gets
    pub fn pre_hook(&mut self, catalog: &FunctionCatalog, link: &dyn Link, session_id: u32) {
        self.buckets.clear();
        self.implicit.clear();
        self.hooked.clear();
        link.send(Message::new(MessageType::ClearArgTracking, session_id));

        if self.config.hook_output_debug_string {
            match catalog.find_by_name(OUTPUT_DEBUG_STRING) {
                Some(vaddr) => self.implicit.push((vaddr, FunctionKind::OutputDebugString)),
                None => log::debug!("{OUTPUT_DEBUG_STRING} not found in target"),
            }
        }

        if self.config.hook_allocators {
            for (name, kind) in ALLOCATOR_FUNCTIONS {
                if let Some(vaddr) = catalog.find_by_name(name) {
                    self.implicit.push((vaddr, kind));
                }
            }
        }

        self.unreal = if self.config.unreal_support { UnrealInfo::locate(catalog) } else { None };
        if self.config.unreal_support && self.unreal.is_none() {
            log::info!("Unreal support enabled but engine symbols were not found");
        }
    }

    /// Apply staged selection changes, bucket hookable functions and send them
    pub fn send_hooks(&mut self, catalog: &FunctionCatalog, link: &dyn Link, session_id: u32) -> HookReport {
        self.apply_staged(catalog);
        let mut report = HookReport::default();

        let implicit = std::mem::take(&mut self.implicit);
        let candidates = implicit
            .iter()
            .filter_map(|(vaddr, kind)| catalog.find_exact(*vaddr).map(|f| (f, *kind)))
            .chain(catalog.hookable_functions().into_iter().map(|f| {
                let kind = f.kind;
                (f, kind)
            }));

        for (function, kind) in candidates {
            let vaddr = function.virtual_address();
            if self.hooked.contains(&vaddr) {
                continue;
            }
            if !self.is_hookable(&function) {
                log::debug!("Not hooking {} ({} bytes)", function.pretty_name, function.size);
                report.rejected.push(vaddr);
                continue;
            }
            self.hooked.insert(vaddr);
            self.buckets.entry(kind.hook_message()).or_default().push(vaddr);
        }
        self.implicit = implicit;

        for (kind, addresses) in &self.buckets {
            if addresses.is_empty() {
                continue;
            }
            self.wait_for_capacity(link);
            link.send(Message::new(*kind, session_id).with_addresses(addresses));
            report.per_kind.insert(*kind, addresses.len());
            report.installed += addresses.len();
        }

        for rule in &self.arg_rules {
            link.send(rule.to_message(session_id));
        }
        report.arg_rules = self.arg_rules.len();

        if let Some(info) = self.unreal {
            link.send(Message::new(MessageType::OrbitUnrealInfo, session_id).with_header(Header::UnrealInfo {
                names_address: info.names_address,
                actor_name_address: info.actor_name_address,
                entry_size: info.entry_size,
            }));
            report.unreal = true;
        }

        log::info!(
            "Sent {} hooks in {} categories ({} rejected)",
            report.installed,
            report.per_kind.len(),
            report.rejected.len()
        );
        report
    }

    /// Advisory back-pressure: give the sender a chance to drain
    fn wait_for_capacity(&self, link: &dyn Link) {
        let mut polls = 0;
        while is_congested(link.outstanding(), self.config.congestion_threshold) && polls < MAX_THROTTLE_POLLS {
            thread::sleep(self.config.throttle);
            polls += 1;
        }
        if polls == MAX_THROTTLE_POLLS {
            log::warn!("Link still congested after {polls} polls, sending anyway");
        }
    }

    /// Stop the capture in the stub and close open zones at `now`
    pub fn teardown(&mut self, link: &dyn Link, session_id: u32, router: &TimerRouter, now: u64) -> usize {
        link.send(Message::new(MessageType::StopCapture, session_id));
        let flushed = router.flush_at(now);
        if flushed > 0 {
            log::debug!("Closed {flushed} pending timers at teardown");
        }
        flushed
    }

    pub fn add_arg_rule(&mut self, rule: ArgTrackingRule) {
        self.arg_rules.retain(|r| r.function_vaddr != rule.function_vaddr);
        self.arg_rules.push(rule);
    }

    pub fn clear_arg_rules(&mut self) {
        self.arg_rules.clear();
    }

    #[must_use]
    pub fn arg_rules(&self) -> &[ArgTrackingRule] {
        &self.arg_rules
    }

    /// Defer a selection until the next capture starts
    pub fn stage_select(&mut self, vaddr: u64) {
        self.staged.push(StagedChange::Select(vaddr));
    }

    pub fn stage_unselect(&mut self, vaddr: u64) {
        self.staged.push(StagedChange::Unselect(vaddr));
    }

    #[must_use]
    pub fn staged_changes(&self) -> usize {
        self.staged.len()
    }

    fn apply_staged(&mut self, catalog: &FunctionCatalog) {
        for change in self.staged.drain(..) {
            let result = match change {
                StagedChange::Select(vaddr) => catalog.select(vaddr),
                StagedChange::Unselect(vaddr) => catalog.unselect(vaddr),
            };
            if let Err(e) = result {
                log::warn!("Dropping staged selection change: {e}");
            }
        }
    }

    /// Addresses hooked by the last `send_hooks`
    #[must_use]
    pub fn hooked(&self) -> &BTreeSet<u64> {
        &self.hooked
    }

    #[must_use]
    pub fn is_hooked(&self, vaddr: u64) -> bool {
        self.hooked.contains(&vaddr)
    }

    /// Drop the hook mirror and any staged selection changes
    pub fn reset_hooks(&mut self) {
        self.buckets.clear();
        self.implicit.clear();
        self.staged.clear();
        self.hooked.clear();
    }

    #[must_use]
    pub fn bucket(&self, kind: MessageType) -> &[u64] {
        self.buckets.get(&kind).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn unreal_info(&self) -> Option<UnrealInfo> {
        self.unreal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<Message>>,
    }

    impl Link for Capture {
        fn send(&self, message: Message) {
            self.sent.lock().push(message);
        }

        fn has_connection(&self) -> bool {
            true
        }
    }

    impl Capture {
        fn kinds(&self) -> Vec<MessageType> {
            self.sent.lock().iter().map(|m| m.kind).collect()
        }

        fn addresses(&self, kind: MessageType) -> Vec<u64> {
            self.sent
                .lock()
                .iter()
                .find(|m| m.kind == kind)
                .map(|m| m.addresses().unwrap())
                .unwrap_or_default()
        }
    }

    fn catalog() -> FunctionCatalog {
        let catalog = FunctionCatalog::new();
        for (name, address, size) in [
            ("render", 0x1000, 0x80),
            ("tiny", 0x2000, 2),
            ("unsized", 0x3000, 0),
            ("orbit_api::Start(char const*)", 0x4000, 0x20),
            ("malloc", 0x5000, 0x40),
            ("free", 0x6000, 0x40),
            ("OutputDebugStringA", 0x7000, 0x10),
        ] {
            catalog.add(Function::new(name, address, size).in_module("/bin/app", 0, 0)).unwrap();
        }
        catalog
    }

    #[test]
    fn test_buckets_by_kind_and_rejects_small() {
        let catalog = catalog();
        for vaddr in [0x1000, 0x2000, 0x3000] {
            catalog.select(vaddr).unwrap();
        }
        let link = Capture::default();
        let mut controller = InstrumentationController::new(HookConfig::default());

        controller.pre_hook(&catalog, &link, 3);
        let report = controller.send_hooks(&catalog, &link, 3);

        assert_eq!(link.kinds()[0], MessageType::ClearArgTracking);
        assert_eq!(link.addresses(MessageType::FunctionHook), vec![0x1000]);
        assert_eq!(link.addresses(MessageType::FunctionHookZoneStart), vec![0x4000]);
        assert_eq!(link.addresses(MessageType::FunctionHookAlloc), vec![0x5000]);
        assert_eq!(link.addresses(MessageType::FunctionHookFree), vec![0x6000]);
        assert_eq!(link.addresses(MessageType::FunctionHookOutputDebugString), vec![0x7000]);
        assert_eq!(report.rejected, vec![0x2000, 0x3000]);
        assert_eq!(report.installed, 5);
        assert!(link.sent.lock().iter().all(|m| m.session_id == 3));
    }

    #[test]
    fn test_unsafe_hooking_and_override() {
        let catalog = catalog();
        catalog.select(0x2000).unwrap();
        catalog.select(0x3000).unwrap();
        catalog.set_unsafe_override(0x2000, true).unwrap();
        let link = Capture::default();
        let mut controller = InstrumentationController::new(HookConfig { hook_allocators: false, ..HookConfig::default() });

        controller.pre_hook(&catalog, &link, 1);
        let report = controller.send_hooks(&catalog, &link, 1);
        assert_eq!(report.rejected, vec![0x3000]);

        controller.set_config(HookConfig { allow_unsafe_hooking: true, hook_allocators: false, ..HookConfig::default() });
        catalog.set_unsafe_override(0x2000, false).unwrap();
        controller.pre_hook(&catalog, &link, 1);
        let report = controller.send_hooks(&catalog, &link, 1);
        assert_eq!(report.rejected, vec![0x3000]);
        assert!(controller.is_hooked(0x2000));
        assert!(!controller.is_hooked(0x3000));

        // Unknown size needs a per-function override even with the global flag
        catalog.set_unsafe_override(0x3000, true).unwrap();
        controller.pre_hook(&catalog, &link, 1);
        let report = controller.send_hooks(&catalog, &link, 1);
        assert!(report.rejected.is_empty());
        assert!(controller.is_hooked(0x3000));
    }

    #[test]
    fn test_output_debug_string_and_arg_rules() {
        let catalog = catalog();
        let link = Capture::default();
        let mut controller = InstrumentationController::new(HookConfig {
            hook_output_debug_string: true,
            hook_allocators: false,
            ..HookConfig::default()
        });
        controller.add_arg_rule(ArgTrackingRule {
            function_vaddr: 0x1000,
            args: vec![ArgRead { offset: 8, size: 4 }],
        });

        controller.pre_hook(&catalog, &link, 2);
        let report = controller.send_hooks(&catalog, &link, 2);
        assert_eq!(link.addresses(MessageType::FunctionHookOutputDebugString), vec![0x7000]);
        assert_eq!(report.arg_rules, 1);

        let kinds = link.kinds();
        let hooks_end = kinds.iter().rposition(|k| k.is_function_hook()).unwrap();
        assert_eq!(kinds[hooks_end + 1], MessageType::ArgTracking);
    }

    #[test]
    fn test_staged_selection_applies_at_next_send() {
        let catalog = catalog();
        let link = Capture::default();
        let mut controller = InstrumentationController::new(HookConfig { hook_allocators: false, ..HookConfig::default() });

        controller.stage_select(0x1000);
        assert!(!catalog.is_selected(0x1000));
        assert_eq!(controller.staged_changes(), 1);

        controller.pre_hook(&catalog, &link, 1);
        controller.send_hooks(&catalog, &link, 1);
        assert!(catalog.is_selected(0x1000));
        assert_eq!(controller.bucket(MessageType::FunctionHook), &[0x1000]);
        assert_eq!(controller.staged_changes(), 0);
    }

    #[test]
    fn test_unreal_info_sent_when_symbols_present() {
        let catalog = catalog();
        catalog.add(Function::new(UNREAL_NAME_TABLE, 0x8000, 8).in_module("/bin/app", 0, 0)).unwrap();
        catalog.add(Function::new(UNREAL_GET_FNAME, 0x9000, 0x20).in_module("/bin/app", 0, 0)).unwrap();
        let link = Capture::default();
        let mut controller = InstrumentationController::new(HookConfig { unreal_support: true, ..HookConfig::default() });

        controller.pre_hook(&catalog, &link, 1);
        assert!(controller.send_hooks(&catalog, &link, 1).unreal);
        let sent = link.sent.lock();
        let info = sent.iter().find(|m| m.kind == MessageType::OrbitUnrealInfo).unwrap();
        assert_eq!(info.header.address(), 0x8000);
    }

    #[test]
    fn test_teardown_sends_stop_and_flushes() {
        use hookprof_common::{Timer, TimerKind};
        let catalog = std::sync::Arc::new(catalog());
        let (router, _rx) = TimerRouter::new(catalog.clone());
        router.set_recording(true);
        router.on_timer(Timer { function_address: 0x4000, tid: 1, start: 10, kind: TimerKind::ZoneStart as u8, ..Timer::default() });

        let link = Capture::default();
        let mut controller = InstrumentationController::new(HookConfig::default());
        assert_eq!(controller.teardown(&link, 5, &router, 90), 1);
        assert_eq!(link.kinds(), vec![MessageType::StopCapture]);
        assert_eq!(catalog.stats(0x4000).unwrap().count, 1);
    }
}
