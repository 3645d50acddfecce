//! Function records and their per-function statistics

use crate::hashing::string_hash;
use hookprof_common::FunctionKind;
use std::sync::atomic::{AtomicU64, Ordering};

/// Calling convention reported by the symbol provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallingConvention {
    #[default]
    Default,
    Cdecl,
    Stdcall,
    Fastcall,
    Thiscall,
    Vectorcall,
}

/// Logical key for a callable in the target
///
/// `address` is module-relative; the cross-subsystem key is
/// [`Function::virtual_address`].
#[derive(Debug, Clone, Default)]
pub struct Function {
    pub address: u64,
    pub load_bias: u64,
    pub module_base_address: u64,
    pub pretty_name: String,
    /// Linkage name as it appears in the symbol table (probe target)
    pub mangled_name: String,
    pub module_path: String,
    pub file: String,
    pub line: u32,
    pub size: u64,
    pub calling_convention: CallingConvention,
    pub kind: FunctionKind,
    pub selected: bool,
    /// Host override allowing a hook even when the size is not confirmed safe
    pub allow_unsafe_hook: bool,
    pub stats: FunctionStats,
}

impl Function {
    #[must_use]
    pub fn new(pretty_name: impl Into<String>, address: u64, size: u64) -> Self {
        let pretty_name = pretty_name.into();
        Self {
            kind: FunctionKind::detect(&pretty_name),
            mangled_name: pretty_name.clone(),
            pretty_name,
            address,
            size,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_module(mut self, module_path: impl Into<String>, base: u64, load_bias: u64) -> Self {
        self.module_path = module_path.into();
        self.module_base_address = base;
        self.load_bias = load_bias;
        self
    }

    /// `address - load_bias + module_base_address`
    #[must_use]
    pub fn virtual_address(&self) -> u64 {
        self.address.wrapping_sub(self.load_bias).wrapping_add(self.module_base_address)
    }

    /// Pretty-name hash used by presets
    #[must_use]
    pub fn hash(&self) -> u64 {
        string_hash(&self.pretty_name)
    }

    /// Whether `vaddr` lies inside this function's known extent
    #[must_use]
    pub fn contains(&self, vaddr: u64) -> bool {
        let start = self.virtual_address();
        vaddr >= start && (self.size == 0 || vaddr - start < self.size)
    }

    /// `module:symbol` as bpftrace expects it
    #[must_use]
    pub fn probe(&self) -> String {
        let symbol = if self.mangled_name.is_empty() { &self.pretty_name } else { &self.mangled_name };
        format!("{}:{}", self.module_path, symbol)
    }

    /// Hooked on every capture regardless of selection
    #[must_use]
    pub fn is_api_function(&self) -> bool {
        self.kind != FunctionKind::None
    }
}

/// Per-function timing statistics
///
/// Fields are independent atomics: readers may observe a count that is one
/// ahead of the total, but never a torn value, and writers never block.
#[derive(Debug)]
pub struct FunctionStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

/// Copy of [`FunctionStats`] at one instant
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsSnapshot {
    pub count: u64,
    pub total_ms: f64,
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl Default for FunctionStats {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0f64.to_bits()),
            min_ms: AtomicU64::new(f64::INFINITY.to_bits()),
            max_ms: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
        }
    }
}

impl Clone for FunctionStats {
    fn clone(&self) -> Self {
        let copy = Self::default();
        copy.count.store(self.count.load(Ordering::Relaxed), Ordering::Relaxed);
        copy.total_ms.store(self.total_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        copy.min_ms.store(self.min_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        copy.max_ms.store(self.max_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        copy
    }
}

fn update_f64(cell: &AtomicU64, apply: impl Fn(f64) -> f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = apply(f64::from_bits(current)).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

impl FunctionStats {
    /// Fold one closed invocation into the statistics
    pub fn update(&self, elapsed_ms: f64) {
        update_f64(&self.total_ms, |total| total + elapsed_ms);
        update_f64(&self.min_ms, |min| min.min(elapsed_ms));
        update_f64(&self.max_ms, |max| max.max(elapsed_ms));
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        let fresh = Self::default();
        self.count.store(0, Ordering::Relaxed);
        self.total_ms.store(fresh.total_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        self.min_ms.store(fresh.min_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        self.max_ms.store(fresh.max_ms.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return StatsSnapshot::default();
        }
        let total_ms = f64::from_bits(self.total_ms.load(Ordering::Relaxed));
        StatsSnapshot {
            count,
            total_ms,
            average_ms: total_ms / count as f64,
            min_ms: f64::from_bits(self.min_ms.load(Ordering::Relaxed)),
            max_ms: f64::from_bits(self.max_ms.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_address_applies_bias_and_base() {
        let f = Function::new("foo", 0x1400, 0x20).in_module("/bin/app", 0x5555_0000_0000, 0x400);
        assert_eq!(f.virtual_address(), 0x5555_0000_1000);
        assert!(f.contains(0x5555_0000_101f));
        assert!(!f.contains(0x5555_0000_1020));
    }

    #[test]
    fn test_kind_detected_on_construction() {
        assert_eq!(Function::new("OrbitLog", 0, 0).kind, FunctionKind::Log);
        assert!(!Function::new("main", 0, 0).is_api_function());
    }

    #[test]
    fn test_probe_prefers_linkage_name() {
        let mut f = Function::new("app::run", 0x10, 4).in_module("/bin/app", 0, 0);
        f.mangled_name = "_ZN3app3run17h0123456789abcdefE".to_string();
        assert_eq!(f.probe(), "/bin/app:_ZN3app3run17h0123456789abcdefE");
    }

    #[test]
    fn test_stats_min_comes_from_first_sample() {
        let stats = FunctionStats::default();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());

        for elapsed in [3.0, 1.5, 4.5] {
            stats.update(elapsed);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.count, 3);
        assert!((snap.total_ms - 9.0).abs() < 1e-9);
        assert!((snap.average_ms - 3.0).abs() < 1e-9);
        assert!((snap.min_ms - 1.5).abs() < 1e-9);
        assert!((snap.max_ms - 4.5).abs() < 1e-9);

        stats.reset();
        stats.update(7.0);
        assert!((stats.snapshot().min_ms - 7.0).abs() < 1e-9);
    }
}
