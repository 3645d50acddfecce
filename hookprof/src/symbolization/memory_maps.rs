//! Module mappings of a target from /proc/pid/maps
//!
//! Each file-backed object may be mapped several times (text, rodata,
//! data); the mapping of a module spans from the lowest start to the highest
//! end of all of them.

use crate::domain::{Pid, SymbolError};
use crate::modules::ModuleRequest;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Memory range of a loaded binary in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One loaded module of the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMapping {
    pub path: String,
    pub range: MemoryRange,
    pub executable: bool,
}

impl From<ModuleMapping> for ModuleRequest {
    fn from(mapping: ModuleMapping) -> Self {
        ModuleRequest::new(mapping.path, mapping.range.start, mapping.range.len())
    }
}

/// Every file-backed mapping of `pid`, merged per path and sorted by address
///
/// # Errors
/// Returns [`SymbolError::Read`] if /proc/pid/maps cannot be read.
pub fn module_mappings(pid: Pid) -> Result<Vec<ModuleMapping>, SymbolError> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps = fs::read_to_string(&maps_path)
        .map_err(|source| SymbolError::Read { path: PathBuf::from(&maps_path), source })?;
    Ok(parse_maps(&maps))
}

/// Mapping of the module at `path` in `pid`
///
/// # Errors
/// Returns [`SymbolError::Unavailable`] when the module is not mapped.
pub fn find_module(pid: Pid, path: &str) -> Result<ModuleMapping, SymbolError> {
    let mapping = module_mappings(pid)?
        .into_iter()
        .find(|m| m.path == path)
        .ok_or_else(|| SymbolError::Unavailable(PathBuf::from(path)))?;
    log::info!(
        "{} mapped at 0x{:x} - 0x{:x} ({} KB)",
        mapping.path,
        mapping.range.start,
        mapping.range.end,
        mapping.range.len() / 1024
    );
    Ok(mapping)
}

/// Parse the text of a maps file: `start-end perms offset dev inode pathname`
#[must_use]
pub fn parse_maps(maps: &str) -> Vec<ModuleMapping> {
    let mut merged: BTreeMap<String, ModuleMapping> = BTreeMap::new();

    for line in maps.lines() {
        let mut parts = line.split_whitespace();
        let (Some(range), Some(perms)) = (parts.next(), parts.next()) else {
            continue;
        };
        // offset, dev, inode
        let Some(path) = parts.nth(3) else {
            continue;
        };
        if !path.starts_with('/') {
            continue;
        }
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16)) else {
            continue;
        };
        let executable = perms.contains('x');

        merged
            .entry(path.to_string())
            .and_modify(|m| {
                m.range.start = m.range.start.min(start);
                m.range.end = m.range.end.max(end);
                m.executable |= executable;
            })
            .or_insert(ModuleMapping { path: path.to_string(), range: MemoryRange { start, end }, executable });
    }

    let mut mappings: Vec<ModuleMapping> = merged.into_values().collect();
    mappings.sort_by_key(|m| m.range.start);
    mappings
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 08:01 1234 /usr/bin/game
55d0c0a02000-55d0c0a08000 r-xp 00002000 08:01 1234 /usr/bin/game
55d0c0a08000-55d0c0a0a000 rw-p 00008000 08:01 1234 /usr/bin/game
55d0c1000000-55d0c1021000 rw-p 00000000 00:00 0 [heap]
7f1e2c000000-7f1e2c1c0000 r-xp 00000000 08:01 999 /usr/lib/libc.so.6
7f1e2c400000-7f1e2c401000 rw-p 00000000 00:00 0
7ffd1a000000-7ffd1a021000 rw-p 00000000 00:00 0 [stack]";

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
        assert_eq!(range.len(), 0x1000);
    }

    #[test]
    fn test_parse_merges_segments_per_module() {
        let mappings = parse_maps(MAPS);
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].path, "/usr/bin/game");
        assert_eq!(mappings[0].range, MemoryRange { start: 0x55d0_c0a0_0000, end: 0x55d0_c0a0_a000 });
        assert!(mappings[0].executable);
        assert_eq!(mappings[1].path, "/usr/lib/libc.so.6");

        let request = ModuleRequest::from(mappings[1].clone());
        assert_eq!(request.base_address, 0x7f1e_2c00_0000);
        assert_eq!(request.size, 0x1c_0000);
    }

    #[test]
    fn test_own_executable_is_mapped() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid(std::process::id() as i32);
        let exe = std::env::current_exe().unwrap();
        let mappings = module_mappings(pid).unwrap();
        assert!(mappings.iter().any(|m| m.path == exe.to_string_lossy()));
    }

    #[test]
    fn test_unmapped_module_is_unavailable() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid(std::process::id() as i32);
        assert!(matches!(find_module(pid, "/not/mapped.so"), Err(SymbolError::Unavailable(_))));
    }
}
