//! Session presets: which functions to re-select, by pretty-name hash
//!
//! Stored as JSON. Readers accept any file whose major version is known and
//! ignore fields they do not understand.

use crate::catalog::FunctionCatalog;
use crate::domain::PresetError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const PRESET_VERSION: &str = "1.0";
pub const PRESET_EXTENSION: &str = ".opr.json";

const SUPPORTED_MAJOR: &str = "1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetModule {
    pub name: String,
    pub function_hashes: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub version: String,
    #[serde(default)]
    pub process_full_path: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub working_directory: String,
    /// Keyed by module path
    #[serde(default)]
    pub modules: BTreeMap<String, PresetModule>,
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            version: PRESET_VERSION.to_string(),
            process_full_path: String::new(),
            arguments: String::new(),
            working_directory: String::new(),
            modules: BTreeMap::new(),
        }
    }
}

/// Outcome of applying one module's part of a preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresetApplication {
    pub selected: usize,
    /// Saved hashes with no match in the loaded module
    pub missing: usize,
}

impl Preset {
    /// Snapshot the catalog's current selection, grouped by module
    #[must_use]
    pub fn from_selection(catalog: &FunctionCatalog) -> Self {
        let mut preset = Self::default();
        for function in catalog.selected_functions() {
            let name = std::path::Path::new(&function.module_path)
                .file_name()
                .map_or_else(|| function.module_path.clone(), |n| n.to_string_lossy().into_owned());
            preset
                .modules
                .entry(function.module_path.clone())
                .or_insert_with(|| PresetModule { name, function_hashes: Vec::new() })
                .function_hashes
                .push(function.hash());
        }
        for module in preset.modules.values_mut() {
            module.function_hashes.sort_unstable();
            module.function_hashes.dedup();
        }
        preset
    }

    /// Re-select the saved functions of `module_path`
    ///
    /// Misses are counted, never fatal.
    pub fn apply_module(&self, catalog: &FunctionCatalog, module_path: &str) -> PresetApplication {
        let mut result = PresetApplication::default();
        let Some(module) = self.modules.get(module_path) else {
            return result;
        };
        for hash in &module.function_hashes {
            match catalog.find_by_hash(module_path, *hash).map(|vaddr| catalog.select(vaddr)) {
                Some(Ok(())) => result.selected += 1,
                _ => result.missing += 1,
            }
        }
        result
    }

    #[must_use]
    pub fn function_count(&self) -> usize {
        self.modules.values().map(|m| m.function_hashes.len()).sum()
    }

    /// # Errors
    /// I/O and serialization failures.
    pub fn save(&self, path: &Path) -> Result<(), PresetError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        log::info!("Saved preset with {} functions to {}", self.function_count(), path.display());
        Ok(())
    }

    /// # Errors
    /// I/O and parse failures, or [`PresetError::UnsupportedVersion`] for an
    /// unknown major version.
    pub fn load(path: &Path) -> Result<Self, PresetError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// # Errors
    /// See [`Preset::load`].
    pub fn from_json(json: &str) -> Result<Self, PresetError> {
        let preset: Self = serde_json::from_str(json)?;
        let major = preset.version.split('.').next().unwrap_or_default();
        if major != SUPPORTED_MAJOR {
            return Err(PresetError::UnsupportedVersion(preset.version));
        }
        Ok(preset)
    }
}

/// Append the preset extension unless the path already carries it
#[must_use]
pub fn with_preset_extension(path: &Path) -> std::path::PathBuf {
    let text = path.to_string_lossy();
    if text.ends_with(PRESET_EXTENSION) {
        path.to_path_buf()
    } else {
        std::path::PathBuf::from(format!("{text}{PRESET_EXTENSION}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Function, Module};
    use tempfile::TempDir;

    fn catalog() -> FunctionCatalog {
        let catalog = FunctionCatalog::new();
        let mut module = Module::new("/usr/bin/game", 0x40_0000, 0x10000, 0);
        module.add_function(Function::new("main", 0x1000, 0x40)).unwrap();
        module.add_function(Function::new("render", 0x1100, 0x40)).unwrap();
        module.add_function(Function::new("update", 0x1200, 0x40)).unwrap();
        catalog.add_module(module);
        catalog
    }

    #[test]
    fn test_snapshot_groups_hashes_by_module() {
        let catalog = catalog();
        catalog.select(0x40_1100).unwrap();
        let preset = Preset::from_selection(&catalog);
        let module = &preset.modules["/usr/bin/game"];
        assert_eq!(module.name, "game");
        assert_eq!(module.function_hashes, vec![crate::hashing::string_hash("render")]);
    }

    #[test]
    fn test_apply_reselects_and_counts_misses() {
        let catalog = catalog();
        let mut preset = Preset::default();
        preset.modules.insert(
            "/usr/bin/game".to_string(),
            PresetModule {
                name: "game".to_string(),
                function_hashes: vec![crate::hashing::string_hash("update"), 42],
            },
        );
        let applied = preset.apply_module(&catalog, "/usr/bin/game");
        assert_eq!(applied, PresetApplication { selected: 1, missing: 1 });
        assert_eq!(catalog.selected_addresses(), vec![0x40_1200]);
        assert_eq!(preset.apply_module(&catalog, "/lib/other.so"), PresetApplication::default());
    }

    #[test]
    fn test_file_round_trip_ignores_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let path = with_preset_extension(&dir.path().join("session"));
        assert!(path.to_string_lossy().ends_with("session.opr.json"));

        let catalog = catalog();
        catalog.select(0x40_1000).unwrap();
        let mut preset = Preset::from_selection(&catalog);
        preset.process_full_path = "/usr/bin/game".to_string();
        preset.save(&path).unwrap();
        assert_eq!(Preset::load(&path).unwrap(), preset);

        let future = r#"{"version":"1.7","modules":{},"window_layout":"wide"}"#;
        assert_eq!(Preset::from_json(future).unwrap().version, "1.7");
    }

    #[test]
    fn test_unknown_major_version_rejected() {
        let err = Preset::from_json(r#"{"version":"2.0"}"#).unwrap_err();
        assert!(matches!(err, PresetError::UnsupportedVersion(v) if v == "2.0"));
    }
}
