//! Loaded modules: the sole owners of their functions

use super::function::Function;
use crate::domain::CatalogError;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// One mapped executable or shared object in the target
///
/// Functions live in an arena; the two indices hold arena slots keyed by
/// module-relative address and by pretty-name hash.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub path: String,
    pub base_address: u64,
    /// Mapped extent in the target, 0 when unknown
    pub size: u64,
    pub load_bias: u64,
    pub symbols_available: bool,
    functions: Vec<Function>,
    by_address: BTreeMap<u64, usize>,
    by_name_hash: HashMap<u64, usize>,
}

impl Module {
    #[must_use]
    pub fn new(path: impl Into<String>, base_address: u64, size: u64, load_bias: u64) -> Self {
        Self {
            path: path.into(),
            base_address,
            size,
            load_bias,
            symbols_available: true,
            ..Self::default()
        }
    }

    /// File name component of the path
    #[must_use]
    pub fn name(&self) -> &str {
        Path::new(&self.path).file_name().and_then(|n| n.to_str()).unwrap_or(&self.path)
    }

    /// Add a function, filling in this module's base, bias and path
    ///
    /// # Errors
    /// Returns [`CatalogError::DuplicateFunction`] if a function already
    /// exists at the same module-relative address.
    pub fn add_function(&mut self, mut function: Function) -> Result<usize, CatalogError> {
        function.module_path.clone_from(&self.path);
        function.module_base_address = self.base_address;
        function.load_bias = self.load_bias;

        if self.by_address.contains_key(&function.address) {
            return Err(CatalogError::DuplicateFunction(function.virtual_address()));
        }

        let slot = self.functions.len();
        self.by_address.insert(function.address, slot);
        self.by_name_hash.entry(function.hash()).or_insert(slot);
        self.functions.push(function);
        Ok(slot)
    }

    #[must_use]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub(crate) fn function_mut(&mut self, slot: usize) -> Option<&mut Function> {
        self.functions.get_mut(slot)
    }

    #[must_use]
    pub fn function(&self, slot: usize) -> Option<&Function> {
        self.functions.get(slot)
    }

    #[must_use]
    pub fn find_by_address(&self, address: u64) -> Option<&Function> {
        self.by_address.get(&address).and_then(|slot| self.functions.get(*slot))
    }

    #[must_use]
    pub fn find_by_hash(&self, hash: u64) -> Option<&Function> {
        self.by_name_hash.get(&hash).and_then(|slot| self.functions.get(*slot))
    }

    /// Virtual address one past the mapped extent, `None` when unknown
    #[must_use]
    pub fn end_address(&self) -> Option<u64> {
        (self.size > 0).then(|| self.base_address.saturating_add(self.size))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::string_hash;

    #[test]
    fn test_add_fills_module_fields() {
        let mut module = Module::new("/usr/lib/libfoo.so", 0x7f00_0000_0000, 0x10000, 0);
        let slot = module.add_function(Function::new("foo", 0x1000, 0x40)).unwrap();
        let f = module.function(slot).unwrap();
        assert_eq!(f.module_path, "/usr/lib/libfoo.so");
        assert_eq!(f.virtual_address(), 0x7f00_0000_1000);
        assert_eq!(module.name(), "libfoo.so");
        assert_eq!(module.end_address(), Some(0x7f00_0001_0000));
    }

    #[test]
    fn test_duplicate_relative_address_rejected() {
        let mut module = Module::new("/bin/app", 0, 0, 0);
        module.add_function(Function::new("a", 0x10, 0)).unwrap();
        assert!(matches!(
            module.add_function(Function::new("b", 0x10, 0)),
            Err(CatalogError::DuplicateFunction(0x10))
        ));
        assert_eq!(module.len(), 1);
    }

    #[test]
    fn test_lookup_by_name_hash() {
        let mut module = Module::new("/bin/app", 0, 0, 0);
        module.add_function(Function::new("render", 0x20, 8)).unwrap();
        assert_eq!(module.find_by_hash(string_hash("render")).unwrap().address, 0x20);
        assert!(module.find_by_hash(string_hash("missing")).is_none());
        assert_eq!(module.end_address(), None);
    }
}
