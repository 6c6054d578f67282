//! Symbol resolution for captured stack addresses.
//!
//! Resolution goes through the [`SymbolSource`] trait so the lookup
//! strategy can be swapped out:
//!
//! * [`DebugInfoSource`] — reads native debug info from the crashing
//!   binaries on the local system. Parsed modules are cached for the
//!   lifetime of the source.
//! * [`TableSymbolSource`] — a fixed in-memory table, useful for tests.
//!
//! Addresses handed to a source are module-relative: absolute address
//! minus the owning image's load base.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use symbolic::common::Name;
use symbolic::debuginfo::{self, Object};
use symbolic::demangle::{Demangle, DemangleOptions};

/// What a [`SymbolSource`] knows about one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Demangled function name.
    pub function: String,
    /// Source file path as recorded in the debug info.
    pub file: Option<String>,
    /// 1-based line number.
    pub line: Option<u32>,
}

/// Something that can resolve module-relative addresses to symbols.
pub trait SymbolSource {
    /// Resolve `address` (relative to `module`'s load base) to a symbol.
    ///
    /// `None` means the source has nothing for this address; the caller
    /// keeps the frame as an address-only placeholder.
    fn resolve(&self, module: &Path, address: u64) -> Option<SymbolInfo>;
}

/// A symbol source which gets symbol information from the crashing
/// binaries on the local system.
#[derive(Default)]
pub struct DebugInfoSource {
    /// If a file fails to load for any reason, None is stored.
    loaded: Mutex<HashMap<PathBuf, Arc<Option<DebugInfo>>>>,
}

impl DebugInfoSource {
    pub fn new() -> DebugInfoSource {
        Default::default()
    }

    fn debug_info(&self, path: &Path) -> Arc<Option<DebugInfo>> {
        if let Some(info) = self.loaded.lock().unwrap().get(path) {
            return Arc::clone(info);
        }
        // Parse outside the lock; concurrent callers may both parse the
        // same module, the first insert wins.
        let info = Arc::new(DebugInfo::new(path));
        Arc::clone(
            self.loaded
                .lock()
                .unwrap()
                .entry(path.to_owned())
                .or_insert(info),
        )
    }
}

impl SymbolSource for DebugInfoSource {
    fn resolve(&self, module: &Path, address: u64) -> Option<SymbolInfo> {
        let info = self.debug_info(module);
        let info = info.as_ref().as_ref()?;
        let function = info.function_by_address(address)?;
        let name = function
            .name
            .try_demangle(DemangleOptions::complete())
            .into_owned();
        let (file, line) = function
            .line_info_at_address(address)
            .map(|line| (line.file.clone(), clamp_line(line.line)))
            .unzip();
        Some(SymbolInfo {
            function: name,
            file,
            line,
        })
    }
}

struct DebugInfo {
    // Sorted by function address, mutually exclusive
    functions: AddressRanges<Function>,
}

impl DebugInfo {
    fn new(file: &Path) -> Option<Self> {
        let file = File::open(file).ok()?;
        // # Safety
        // The file is presumably read-only (being some binary or debug
        // info file).
        let mapped = unsafe { Mmap::map(&file) }.ok()?;

        let object = Object::parse(&mapped).ok()?;
        Some(Self::from_object(object))
    }

    fn from_object(object: Object) -> Self {
        let functions = object
            .debug_session()
            .ok()
            .map(|session| {
                session
                    .functions()
                    .filter_map(Result::ok)
                    .map(Into::into)
                    .collect()
            })
            .unwrap_or_default();

        DebugInfo { functions }
    }

    /// Find the function which contains the given address, if any.
    fn function_by_address(&self, addr: u64) -> Option<&Function> {
        self.functions.find(addr)
    }
}

#[derive(Debug)]
struct LineInfo {
    pub address: u64,
    pub size: Option<u64>,
    pub file: String,
    pub line: u64,
}

#[derive(Debug)]
struct Function {
    pub address: u64,
    pub size: u64,
    pub name: Name<'static>,
    // Sorted by line address, mutually exclusive
    pub lines: AddressRanges<LineInfo>,
}

impl Function {
    fn line_info_at_address(&self, address: u64) -> Option<&LineInfo> {
        self.lines.find(address)
    }
}

trait AddressRange {
    fn start(&self) -> u64;
    fn end(&self) -> u64;
}

#[derive(Debug)]
struct AddressRanges<T> {
    inner: Vec<T>,
}

impl<T> Default for AddressRanges<T> {
    fn default() -> Self {
        AddressRanges {
            inner: Default::default(),
        }
    }
}

impl<T: AddressRange> AddressRanges<T> {
    fn find(&self, address: u64) -> Option<&T> {
        self.inner
            .binary_search_by(|item| {
                use std::cmp::Ordering::*;
                if address < item.start() {
                    Greater
                } else if item.end() <= address {
                    Less
                } else {
                    Equal
                }
            })
            .ok()
            .map(|index| &self.inner[index])
    }
}

impl<T: AddressRange> std::iter::FromIterator<T> for AddressRanges<T> {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut inner = Vec::from_iter(iter);
        inner.sort_unstable_by_key(|item| item.start());
        AddressRanges { inner }
    }
}

impl AddressRange for LineInfo {
    fn start(&self) -> u64 {
        self.address
    }

    fn end(&self) -> u64 {
        self.address + self.size.unwrap_or(1)
    }
}

impl AddressRange for Function {
    fn start(&self) -> u64 {
        self.address
    }

    fn end(&self) -> u64 {
        self.address + self.size
    }
}

impl From<debuginfo::LineInfo<'_>> for LineInfo {
    fn from(li: debuginfo::LineInfo) -> Self {
        LineInfo {
            address: li.address,
            size: li.size,
            file: li.file.path_str(),
            line: li.line,
        }
    }
}

impl From<debuginfo::Function<'_>> for Function {
    fn from(f: debuginfo::Function) -> Self {
        Function {
            address: f.address,
            size: f.size,
            name: {
                let mangling = f.name.mangling();
                let lang = f.name.language();
                Name::new(f.name.into_string(), mangling, lang)
            },
            lines: f.lines.into_iter().map(Into::into).collect(),
        }
    }
}

fn clamp_line(line: u64) -> u32 {
    u32::try_from(line).unwrap_or(u32::MAX)
}

/// One entry of a [`TableSymbolSource`].
#[derive(Debug, Clone)]
pub struct TableSymbol {
    /// Module-relative start address of the function.
    pub address: u64,
    /// Size of the function in bytes.
    pub size: u64,
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// A `SymbolSource` backed by a fixed table of symbols, useful for tests.
#[derive(Debug, Default)]
pub struct TableSymbolSource {
    modules: HashMap<PathBuf, Vec<TableSymbol>>,
}

impl TableSymbolSource {
    pub fn new() -> TableSymbolSource {
        Default::default()
    }

    pub fn add_symbol<P: Into<PathBuf>>(&mut self, module: P, symbol: TableSymbol) {
        self.modules.entry(module.into()).or_default().push(symbol);
    }
}

impl SymbolSource for TableSymbolSource {
    fn resolve(&self, module: &Path, address: u64) -> Option<SymbolInfo> {
        let symbols = self.modules.get(module)?;
        let hit = symbols
            .iter()
            .find(|s| address >= s.address && address < s.address + s.size)?;
        Some(SymbolInfo {
            function: hit.name.clone(),
            file: hit.file.clone(),
            line: hit.line,
        })
    }
}
