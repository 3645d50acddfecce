//! Module loading and data routing
//!
//! - `provider`: the [`SymbolProvider`] seam symbol parsers plug into
//! - `manager`: one-at-a-time asynchronous loads, preset replay, data routing
//! - `watched`: variables read out of the target on demand

pub mod manager;
pub mod provider;
pub mod watched;

pub use manager::{ModuleLoadOutcome, ModuleManager};
pub use provider::{ModuleRequest, SymbolProvider};
pub use watched::{VariableType, VariableValue, WatchedVariable};
