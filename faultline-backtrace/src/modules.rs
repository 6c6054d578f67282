//! Enumeration of the images loaded into the current process.
//!
//! Stack addresses are only meaningful relative to the image that contains
//! them: debug info stores function ranges relative to the image's load
//! base. [`ModuleMap`] snapshots the link map via `dl_iterate_phdr` and
//! answers "which image owns this address" lookups over the loadable
//! segments of every image.

use std::ffi::CStr;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use range_map::{Range, RangeMap};

/// A single loaded image: the main executable or a shared object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Path of the mapped file on disk.
    path: PathBuf,
    /// Load bias of the image. Module-relative addresses are computed by
    /// subtracting this from an absolute address.
    base_address: u64,
    /// Loadable segments as `(absolute start, size)` pairs.
    segments: Vec<(u64, u64)>,
}

impl ModuleInfo {
    pub fn new<P: Into<PathBuf>>(path: P, base_address: u64) -> ModuleInfo {
        ModuleInfo {
            path: path.into(),
            base_address,
            segments: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn add_segment(&mut self, start: u64, size: u64) {
        self.segments.push((start, size));
    }

    /// The inclusive address ranges of the image's loadable segments.
    /// Zero-sized or overflowing segments yield `None` and are skipped
    /// when the lookup map is built.
    fn segment_ranges(&self) -> impl Iterator<Item = Option<Range<u64>>> + '_ {
        self.segments.iter().map(|&(start, size)| {
            if size == 0 {
                return None;
            }
            Some(Range::new(start, start.checked_add(size)? - 1))
        })
    }
}

/// All images loaded into the process, with an address-range lookup.
#[derive(Debug, Clone)]
pub struct ModuleMap {
    modules: Vec<ModuleInfo>,
    segments_by_addr: RangeMap<u64, usize>,
}

impl ModuleMap {
    /// Return an empty `ModuleMap`.
    pub fn new() -> ModuleMap {
        ModuleMap {
            modules: vec![],
            segments_by_addr: RangeMap::new(),
        }
    }

    /// Create a `ModuleMap` from a list of `ModuleInfo`s.
    pub fn from_modules(modules: Vec<ModuleInfo>) -> ModuleMap {
        let ranges = modules
            .iter()
            .enumerate()
            .flat_map(|(i, module)| module.segment_ranges().map(move |range| (range, i)))
            .filter_map(|(range, i)| range.map(|r| (r, i)))
            .collect();
        ModuleMap {
            segments_by_addr: into_rangemap_safe(ranges),
            modules,
        }
    }

    /// Snapshot the images currently loaded into this process.
    pub fn current() -> ModuleMap {
        ModuleMap::from_modules(loaded_modules())
    }

    /// Returns the module corresponding to the main executable.
    ///
    /// The main executable is the first entry the loader reports.
    pub fn main_module(&self) -> Option<&ModuleInfo> {
        self.modules.first()
    }

    /// Return the `ModuleInfo` whose segments cover `address`.
    pub fn module_at_address(&self, address: u64) -> Option<&ModuleInfo> {
        self.segments_by_addr
            .get(address)
            .map(|&index| &self.modules[index])
    }

    /// Iterate over the modules in load order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }
}

impl Default for ModuleMap {
    fn default() -> ModuleMap {
        ModuleMap::new()
    }
}

/// Build a `RangeMap` from possibly-unsorted, possibly-overlapping input.
/// Overlapping ranges with conflicting values keep the first entry;
/// adjacent ranges with equal values are coalesced.
fn into_rangemap_safe<V: Clone + Eq + Debug>(mut input: Vec<(Range<u64>, V)>) -> RangeMap<u64, V> {
    input.sort_by_key(|x| x.0);
    let mut vec: Vec<(Range<u64>, V)> = Vec::with_capacity(input.len());
    for (range, val) in input {
        if let Some((last_range, last_val)) = vec.last_mut() {
            if range.start <= last_range.end && val != *last_val {
                tracing::warn!(
                    "overlapping segments {:?} and {:?}, dropping the latter",
                    last_range,
                    range
                );
                continue;
            }

            if range.start <= last_range.end.saturating_add(1) && &val == last_val {
                last_range.end = std::cmp::max(range.end, last_range.end);
                continue;
            }
        }
        vec.push((range, val));
    }
    RangeMap::try_from_iter(vec).unwrap_or_else(|err| err.non_overlapping)
}

/// Walk the link map with `dl_iterate_phdr` and collect every image and
/// its `PT_LOAD` segments. The loader reports the main executable first,
/// usually with an empty name; that entry gets the path of
/// `/proc/self/exe` instead so symbolization can open the file.
fn loaded_modules() -> Vec<ModuleInfo> {
    let mut modules: Vec<ModuleInfo> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(
            Some(collect_module),
            &mut modules as *mut Vec<ModuleInfo> as *mut libc::c_void,
        );
    }
    modules
}

unsafe extern "C" fn collect_module(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    // Safety: `data` is the Vec passed by `loaded_modules` above, and the
    // loader guarantees `info` is valid for the duration of the callback.
    let modules = unsafe { &mut *(data as *mut Vec<ModuleInfo>) };
    let info = unsafe { &*info };

    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(info.dlpi_name) }
            .to_string_lossy()
            .into_owned()
    };
    let path = if name.is_empty() {
        main_executable_path()
    } else {
        PathBuf::from(name)
    };

    let base = info.dlpi_addr as u64;
    let mut module = ModuleInfo::new(path, base);
    for i in 0..info.dlpi_phnum {
        let phdr = unsafe { &*info.dlpi_phdr.add(i as usize) };
        if phdr.p_type == libc::PT_LOAD {
            module.add_segment(base.wrapping_add(phdr.p_vaddr as u64), phdr.p_memsz as u64);
        }
    }
    modules.push(module);
    0
}

fn main_executable_path() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/proc/self/exe"))
}
