//! Symbols of the target's modules
//!
//! - `memory_maps`: which modules are mapped where, from `/proc/<pid>/maps`
//! - `symbolizer`: [`ElfSymbolProvider`], turning an ELF file into a catalog
//!   [`Module`](crate::catalog::Module)
//!
//! ## Addresses
//!
//! Symbol tables hold link-time addresses. A module mapped at `base` places
//! a function at
//!
//! ```text
//! vaddr = symbol address - load bias + base
//! ```
//!
//! where the load bias is the link-time address of the first `PT_LOAD`
//! segment minus its file offset. For PIE objects the bias is usually 0; for
//! fixed-address executables it cancels the link-time base.

pub mod memory_maps;
pub mod symbolizer;

pub use memory_maps::{find_module, module_mappings, parse_maps, MemoryRange, ModuleMapping};
pub use symbolizer::{demangle_symbol, load_bias, DebugInfo, ElfSymbolProvider};
