//! Native stack capture and symbolization.
//!
//! [`StackCapturer`] walks the calling thread's stack, maps each return
//! address to the image that contains it (via [`ModuleMap`]), resolves
//! function names, files and lines from native debug info (via a
//! [`SymbolSource`]) and optionally attaches surrounding source lines.
//!
//! Capture is best effort: an address that cannot be resolved produces a
//! frame that still carries the raw address, never an error. This matters
//! because captures happen on crash paths where failing loudly would mask
//! the original fault.

pub mod modules;
pub mod symbols;

use std::fs;
use std::path::Path;

use serde::Serialize;

pub use modules::{ModuleInfo, ModuleMap};
pub use symbols::{DebugInfoSource, SymbolInfo, SymbolSource, TableSymbol, TableSymbolSource};

/// Maximum number of raw return addresses collected per capture.
pub const MAX_FRAMES: usize = 128;

/// Number of source lines attached before and after a resolved line.
pub const CONTEXT_LINES: usize = 4;

/// One entry of a captured stack, ready for serialization.
///
/// Unresolved fields are omitted from the serialized form; a frame where
/// everything failed still serializes its address and `in_app` flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StackFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abs_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    /// Absolute instruction address, serialized as a hex string.
    #[serde(serialize_with = "serialize_hex_addr")]
    pub instruction_addr: u64,
    /// Whether the frame belongs to application code rather than runtime
    /// plumbing. Heuristic: the resolved name does not start with `_`.
    pub in_app: bool,
    /// Path of the image that contains the address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_line: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pre_context: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_context: Vec<String>,
}

fn serialize_hex_addr<S: serde::Serializer>(addr: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{addr:#x}"))
}

/// Captures and symbolizes the calling thread's stack.
pub struct StackCapturer {
    symbols: Box<dyn SymbolSource + Send + Sync>,
}

impl Default for StackCapturer {
    fn default() -> StackCapturer {
        StackCapturer::new()
    }
}

impl StackCapturer {
    /// A capturer resolving symbols from local debug info.
    pub fn new() -> StackCapturer {
        StackCapturer::with_symbol_source(Box::new(DebugInfoSource::new()))
    }

    pub fn with_symbol_source(symbols: Box<dyn SymbolSource + Send + Sync>) -> StackCapturer {
        StackCapturer { symbols }
    }

    /// Capture the calling thread's stack.
    ///
    /// `skip_front` drops that many of the newest frames (capture
    /// machinery, handler trampolines), `skip_back` drops the oldest
    /// (process startup below `main`). Frames are returned oldest call
    /// first, the most recent call last. At most [`MAX_FRAMES`] raw
    /// addresses are collected; if the skips exceed what was captured the
    /// result is empty.
    pub fn capture(&self, skip_front: usize, skip_back: usize, with_source: bool) -> Vec<StackFrame> {
        let mut addresses = Vec::with_capacity(MAX_FRAMES);
        backtrace::trace(|frame| {
            addresses.push(frame.ip() as u64);
            addresses.len() < MAX_FRAMES
        });
        tracing::trace!("captured {} raw frames", addresses.len());

        let modules = ModuleMap::current();
        self.symbolize(
            trim_addresses(&addresses, skip_front, skip_back),
            &modules,
            with_source,
        )
    }

    /// Symbolize raw addresses (given newest call first, as captured)
    /// against a module map. The output is reversed to oldest-first.
    pub fn symbolize(
        &self,
        addresses: &[u64],
        modules: &ModuleMap,
        with_source: bool,
    ) -> Vec<StackFrame> {
        addresses
            .iter()
            .rev()
            .map(|&address| {
                let mut frame = self.resolve_frame(address, modules);
                if with_source {
                    attach_source_context(&mut frame, CONTEXT_LINES);
                }
                frame
            })
            .collect()
    }

    fn resolve_frame(&self, address: u64, modules: &ModuleMap) -> StackFrame {
        let mut frame = StackFrame {
            instruction_addr: address,
            in_app: true,
            ..Default::default()
        };

        // An address outside every known segment is still worth a
        // resolution attempt against the main executable.
        let module = modules
            .module_at_address(address)
            .or_else(|| modules.main_module());
        let Some(module) = module else {
            return frame;
        };
        frame.package = Some(module.path().display().to_string());

        let relative = address.wrapping_sub(module.base_address());
        let Some(symbol) = self.symbols.resolve(module.path(), relative) else {
            return frame;
        };

        frame.in_app = !symbol.function.starts_with('_');
        frame.function = Some(symbol.function);
        if let Some(file) = symbol.file {
            frame.filename = Some(basename(&file).to_string());
            frame.abs_path = Some(file);
        }
        frame.lineno = symbol.line;
        frame
    }
}

/// Drop `skip_front` newest and `skip_back` oldest addresses.
fn trim_addresses(addresses: &[u64], skip_front: usize, skip_back: usize) -> &[u64] {
    if skip_front.saturating_add(skip_back) >= addresses.len() {
        return &[];
    }
    &addresses[skip_front..addresses.len() - skip_back]
}

fn attach_source_context(frame: &mut StackFrame, delta: usize) {
    let (Some(path), Some(lineno)) = (frame.abs_path.as_deref(), frame.lineno) else {
        return;
    };
    if let Some((pre, line, post)) = read_context_lines(Path::new(path), lineno as usize, delta) {
        frame.pre_context = pre;
        frame.context_line = Some(line);
        frame.post_context = post;
    }
}

/// Read the 1-based `line_no` from `path` together with up to `delta`
/// lines on each side. `None` if the file cannot be read or is shorter
/// than `line_no`.
pub fn read_context_lines(
    path: &Path,
    line_no: usize,
    delta: usize,
) -> Option<(Vec<String>, String, Vec<String>)> {
    if line_no == 0 {
        return None;
    }
    let contents = fs::read_to_string(path).ok()?;

    let first = line_no.saturating_sub(delta).max(1);
    let mut pre = Vec::new();
    let mut context = None;
    let mut post = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let current = index + 1;
        if current > line_no + delta {
            break;
        }
        if current >= first && current < line_no {
            pre.push(line.to_string());
        } else if current == line_no {
            context = Some(line.to_string());
        } else if current > line_no {
            post.push(line.to_string());
        }
    }
    context.map(|line| (pre, line, post))
}

fn basename(f: &str) -> &str {
    match f.rfind(|c| c == '/' || c == '\\') {
        None => f,
        Some(index) => &f[(index + 1)..],
    }
}
