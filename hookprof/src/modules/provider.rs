//! Symbol loading seam

use crate::catalog::Module;
use crate::domain::SymbolError;

/// Where a module lives in the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRequest {
    pub path: String,
    pub base_address: u64,
    /// Mapped extent, 0 when unknown
    pub size: u64,
}

impl ModuleRequest {
    #[must_use]
    pub fn new(path: impl Into<String>, base_address: u64, size: u64) -> Self {
        Self { path: path.into(), base_address, size }
    }
}

/// Produces a module's functions from its debug information
///
/// Called on the loader thread, one module at a time.
pub trait SymbolProvider: Send + Sync {
    /// # Errors
    /// Any [`SymbolError`]; the module is then flagged as having no symbols.
    fn load(&self, request: &ModuleRequest) -> Result<Module, SymbolError>;
}
