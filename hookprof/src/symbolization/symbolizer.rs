use crate::catalog::{Function, Module};
use crate::domain::SymbolError;
use crate::modules::{ModuleRequest, SymbolProvider};
use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// Source locations from a module's DWARF line tables
pub struct DebugInfo {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
}

impl DebugInfo {
    /// `None` when the object carries no usable DWARF
    #[must_use]
    pub fn load(obj_file: &object::File<'_>) -> Option<Self> {
        let endian = if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section = |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
            let data = obj_file
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };

        let dwarf = gimli::Dwarf::load(&load_section).ok()?;
        let ctx = Context::from_dwarf(dwarf).ok()?;
        Some(Self { ctx })
    }

    /// File and line of the instruction at link-time address `addr`
    #[must_use]
    pub fn location(&self, addr: u64) -> Option<(String, u32)> {
        let location = self.ctx.find_location(addr).ok()??;
        Some((location.file?.to_string(), location.line.unwrap_or(0)))
    }
}

/// Demangle a symbol name, without the trailing hash
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    format!("{:#}", demangle(symbol))
}

/// Link-time address minus file offset of the first loadable segment
#[must_use]
pub fn load_bias(obj_file: &object::File<'_>) -> u64 {
    obj_file
        .segments()
        .next()
        .map_or(0, |segment| segment.address().wrapping_sub(segment.file_range().0))
}

/// Loads functions from an ELF file's `.symtab` and `.dynsym`
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfSymbolProvider;

impl ElfSymbolProvider {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parse `data` as the module described by `request`
    ///
    /// # Errors
    /// [`SymbolError::Parse`] for data that is not an object file, or
    /// [`SymbolError::Unavailable`] when it has no function symbols.
    pub fn parse(&self, request: &ModuleRequest, data: &[u8]) -> Result<Module, SymbolError> {
        let path = Path::new(&request.path);
        let obj_file = object::File::parse(data)
            .map_err(|e| SymbolError::Parse { path: path.to_path_buf(), message: e.to_string() })?;

        let bias = load_bias(&obj_file);
        let debug_info = DebugInfo::load(&obj_file);
        if debug_info.is_none() {
            log::debug!("{}: no DWARF, functions will have no source locations", request.path);
        }

        // Keyed by address so .symtab wins over the .dynsym copy of the same function
        let mut symbols: BTreeMap<u64, (&str, u64)> = BTreeMap::new();
        for symbol in obj_file.symbols().chain(obj_file.dynamic_symbols()) {
            if symbol.kind() != SymbolKind::Text || !symbol.is_definition() || symbol.address() == 0 {
                continue;
            }
            let Ok(name) = symbol.name() else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            symbols.entry(symbol.address()).or_insert((name, symbol.size()));
        }

        if symbols.is_empty() {
            return Err(SymbolError::Unavailable(path.to_path_buf()));
        }

        let mut module = Module::new(&request.path, request.base_address, request.size, bias);
        for (address, (name, size)) in symbols {
            let mut function = Function::new(demangle_symbol(name), address, size);
            function.mangled_name = name.to_string();
            if let Some((file, line)) = debug_info.as_ref().and_then(|d| d.location(address)) {
                function.file = file;
                function.line = line;
            }
            if let Err(e) = module.add_function(function) {
                log::debug!("{}: {e}", request.path);
            }
        }

        log::info!(
            "{}: {} functions, load bias 0x{:x}",
            module.name(),
            module.len(),
            module.load_bias
        );
        Ok(module)
    }
}

impl SymbolProvider for ElfSymbolProvider {
    fn load(&self, request: &ModuleRequest) -> Result<Module, SymbolError> {
        let data = fs::read(&request.path)
            .map_err(|source| SymbolError::Read { path: request.path.clone().into(), source })?;
        self.parse(request, &data)
    }
}
