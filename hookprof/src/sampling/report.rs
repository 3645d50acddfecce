//! Sample roll-up and report generation
//!
//! Folds the flat list of [`CallstackEvent`]s into per-thread counts, then
//! derives inclusive (anywhere on the stack) and exclusive (leaf only)
//! per-address counts from the resolved stacks.

#![allow(clippy::cast_precision_loss)]

use crate::callstack::{CallstackEvent, CallstackInterner};
use crate::catalog::FunctionCatalog;
use crate::domain::{CallstackId, Tid};
use crate::hashing::row_hash;
use std::collections::{HashMap, HashSet};

/// One row of a thread's report
#[derive(Debug, Clone, PartialEq)]
pub struct SampledFunction {
    pub name: String,
    pub module: String,
    pub file: String,
    pub line: u32,
    pub exclusive_percent: f32,
    pub inclusive_percent: f32,
    pub exclusive: u32,
    pub inclusive: u32,
    pub address: u64,
    /// Content hash over name, file and address
    pub hash: u64,
}

/// Per-thread aggregation
#[derive(Debug, Clone, Default)]
pub struct ThreadSampleData {
    pub tid: Option<Tid>,
    pub samples_count: u32,
    pub callstack_count: HashMap<CallstackId, u32>,
    pub inclusive: HashMap<u64, u32>,
    pub exclusive: HashMap<u64, u32>,
    pub usage_history: Vec<f32>,
    pub average_usage: f32,
    /// `(inclusive count, address)`, highest count first
    pub sorted_addresses: Vec<(u32, u64)>,
    pub functions: Vec<SampledFunction>,
}

impl ThreadSampleData {
    fn new(tid: Tid) -> Self {
        Self { tid: Some(tid), ..Self::default() }
    }

    #[must_use]
    pub fn thread_id(&self) -> Tid {
        self.tid.unwrap_or(Tid::ALL_THREADS)
    }

    #[must_use]
    pub fn inclusive_count(&self, address: u64) -> u32 {
        self.inclusive.get(&address).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn exclusive_count(&self, address: u64) -> u32 {
        self.exclusive.get(&address).copied().unwrap_or(0)
    }
}

/// Output of one sampling capture
#[derive(Debug, Clone, Default)]
pub struct SamplingReport {
    /// "All threads" first, then threads by descending average usage
    pub threads: Vec<ThreadSampleData>,
    pub total_samples: u32,
    pub unique_callstacks: usize,
    /// Events whose callstack was never interned
    pub unresolved_events: u32,
    pub unwind_failures: u64,
}

impl SamplingReport {
    #[must_use]
    pub fn thread(&self, tid: Tid) -> Option<&ThreadSampleData> {
        self.threads.iter().find(|t| t.thread_id() == tid)
    }

    #[must_use]
    pub fn all_threads(&self) -> Option<&ThreadSampleData> {
        self.threads.first().filter(|t| t.thread_id().is_all_threads())
    }
}

/// Build a [`SamplingReport`] from recorded events
#[must_use]
pub fn process_samples(
    events: &[CallstackEvent],
    usage: &HashMap<Tid, Vec<f32>>,
    callstacks: &CallstackInterner,
    catalog: &FunctionCatalog,
) -> SamplingReport {
    let mut report = SamplingReport::default();
    let mut all = ThreadSampleData::new(Tid::ALL_THREADS);
    let mut per_thread: HashMap<Tid, ThreadSampleData> = HashMap::new();
    let mut resolved: HashMap<CallstackId, Option<Vec<u64>>> = HashMap::new();

    for event in events {
        let frames = resolved
            .entry(event.callstack_id)
            .or_insert_with(|| callstacks.get_resolved(event.callstack_id).map(|s| s.frames));
        if frames.as_ref().is_none_or(Vec::is_empty) {
            report.unresolved_events += 1;
            continue;
        }
        for data in [&mut all, per_thread.entry(event.tid).or_insert_with(|| ThreadSampleData::new(event.tid))] {
            data.samples_count += 1;
            *data.callstack_count.entry(event.callstack_id).or_default() += 1;
        }
    }

    for (tid, history) in usage {
        let data = per_thread.entry(*tid).or_insert_with(|| ThreadSampleData::new(*tid));
        data.usage_history.clone_from(history);
        if !history.is_empty() {
            data.average_usage = history.iter().sum::<f32>() / history.len() as f32;
        }
    }

    let mut threads: Vec<ThreadSampleData> = per_thread.into_values().collect();
    threads.sort_by(|a, b| {
        b.average_usage
            .total_cmp(&a.average_usage)
            .then_with(|| b.samples_count.cmp(&a.samples_count))
            .then_with(|| a.tid.cmp(&b.tid))
    });
    if !threads.is_empty() {
        all.average_usage =
            threads.iter().map(|t| t.average_usage).sum::<f32>() / threads.len() as f32;
    }
    threads.insert(0, all);

    for data in &mut threads {
        fold_addresses(data, &resolved);
        data.functions = build_rows(data, catalog);
    }

    report.total_samples = threads[0].samples_count;
    report.unique_callstacks = resolved.values().filter(|f| f.is_some()).count();
    report.threads = threads;
    report
}

fn fold_addresses(data: &mut ThreadSampleData, resolved: &HashMap<CallstackId, Option<Vec<u64>>>) {
    for (id, count) in &data.callstack_count {
        let Some(Some(frames)) = resolved.get(id) else {
            continue;
        };
        let unique: HashSet<u64> = frames.iter().copied().collect();
        for address in unique {
            *data.inclusive.entry(address).or_default() += count;
        }
        if let Some(leaf) = frames.first() {
            *data.exclusive.entry(*leaf).or_default() += count;
        }
    }

    data.sorted_addresses = data.inclusive.iter().map(|(address, count)| (*count, *address)).collect();
    data.sorted_addresses.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
}

fn build_rows(data: &ThreadSampleData, catalog: &FunctionCatalog) -> Vec<SampledFunction> {
    let percent = |count: u32| {
        if data.samples_count == 0 {
            0.0
        } else {
            count as f32 * 100.0 / data.samples_count as f32
        }
    };

    data.sorted_addresses
        .iter()
        .map(|(inclusive, address)| {
            let function = catalog.find_exact(*address);
            let (name, module, file, line) = match function {
                Some(f) => (f.pretty_name, f.module_path, f.file, f.line),
                None => (format!("0x{address:x}"), String::new(), String::new(), 0),
            };
            let exclusive = data.exclusive_count(*address);
            SampledFunction {
                hash: row_hash(&name, &file, *address),
                name,
                module,
                file,
                line,
                exclusive_percent: percent(exclusive),
                inclusive_percent: percent(*inclusive),
                exclusive,
                inclusive: *inclusive,
                address: *address,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callstack::CallStack;
    use crate::catalog::Function;

    fn record(
        interner: &CallstackInterner,
        catalog: &FunctionCatalog,
        events: &mut Vec<CallstackEvent>,
        frames: &[u64],
        tid: u32,
        times: usize,
    ) {
        let id = interner.intern(CallStack::new(frames.to_vec(), Tid(tid)), catalog);
        for i in 0..times {
            events.push(CallstackEvent { time: i as u64, callstack_id: id, tid: Tid(tid) });
        }
    }

    #[test]
    fn test_inclusive_counts_each_address_once_per_stack() {
        let catalog = FunctionCatalog::new();
        let interner = CallstackInterner::new();
        let mut events = Vec::new();
        record(&interner, &catalog, &mut events, &[0xA, 0xB, 0xA], 1, 2);

        let report = process_samples(&events, &HashMap::new(), &interner, &catalog);
        let thread = report.thread(Tid(1)).unwrap();
        assert_eq!(thread.inclusive_count(0xA), 2);
        assert_eq!(thread.exclusive_count(0xA), 2);
        assert_eq!(thread.exclusive_count(0xB), 0);
    }

    #[test]
    fn test_all_threads_entry_first_and_sorted_by_usage() {
        let catalog = FunctionCatalog::new();
        let interner = CallstackInterner::new();
        let mut events = Vec::new();
        record(&interner, &catalog, &mut events, &[0x1], 1, 1);
        record(&interner, &catalog, &mut events, &[0x2], 2, 4);
        let usage = HashMap::from([(Tid(1), vec![80.0, 60.0]), (Tid(2), vec![10.0])]);

        let report = process_samples(&events, &usage, &interner, &catalog);
        let order: Vec<Tid> = report.threads.iter().map(ThreadSampleData::thread_id).collect();
        assert_eq!(order, vec![Tid::ALL_THREADS, Tid(1), Tid(2)]);
        assert_eq!(report.total_samples, 5);
        assert!((report.thread(Tid(1)).unwrap().average_usage - 70.0).abs() < 1e-4);
        assert_eq!(report.all_threads().unwrap().samples_count, 5);
    }

    #[test]
    fn test_rows_named_from_catalog() {
        let catalog = FunctionCatalog::new();
        catalog
            .add(Function::new("hot_loop", 0x1000, 0x100).in_module("/bin/app", 0, 0))
            .unwrap();
        let interner = CallstackInterner::new();
        let mut events = Vec::new();
        record(&interner, &catalog, &mut events, &[0x1010, 0x5000], 3, 4);

        let report = process_samples(&events, &HashMap::new(), &interner, &catalog);
        let rows = &report.thread(Tid(3)).unwrap().functions;
        let hot = rows.iter().find(|r| r.address == 0x1000).unwrap();
        assert_eq!(hot.name, "hot_loop");
        assert_eq!(hot.module, "/bin/app");
        assert!((hot.exclusive_percent - 100.0).abs() < 1e-4);
        let unknown = rows.iter().find(|r| r.address == 0x5000).unwrap();
        assert_eq!(unknown.name, "0x5000");
        assert_eq!(unknown.exclusive, 0);
        assert_eq!(unknown.hash, row_hash("0x5000", "", 0x5000));
    }

    #[test]
    fn test_unknown_callstack_events_are_skipped() {
        let catalog = FunctionCatalog::new();
        let interner = CallstackInterner::new();
        let events = vec![CallstackEvent { time: 0, callstack_id: CallstackId(42), tid: Tid(1) }];

        let report = process_samples(&events, &HashMap::new(), &interner, &catalog);
        assert_eq!(report.unresolved_events, 1);
        assert_eq!(report.total_samples, 0);
        assert_eq!(report.threads.len(), 1);
    }
}
