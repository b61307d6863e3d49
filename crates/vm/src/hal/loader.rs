/// Library Loader - "The Linker"
///
/// Host-side libraries guest programs reach through `dynl` / `dyncall`.
/// `StaticLibraryLoader` is an in-process registry: libraries are named
/// tables of host functions registered before the VM starts.

use crate::error::Fault;
use crate::memory::MemoryRegion;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Guest parameter block: consecutive 64-bit slots in data memory
pub struct ParamBlock<'a> {
    data: &'a MemoryRegion,
    base: u64,
}

impl<'a> ParamBlock<'a> {
    pub fn new(data: &'a MemoryRegion, base: u64) -> Self {
        Self { data, base }
    }

    fn slot(&self, index: u64) -> Result<u64, Fault> {
        index
            .checked_mul(8)
            .and_then(|offset| self.base.checked_add(offset))
            .ok_or(Fault::OutOfBounds {
                region: self.data.kind(),
                address: self.base,
                width: 8,
            })
    }

    pub fn arg(&self, index: u64) -> Result<u64, Fault> {
        self.data.read_u64(self.slot(index)?)
    }

    pub fn set(&self, index: u64, value: u64) -> Result<(), Fault> {
        self.data.write_u64(self.slot(index)?, value)
    }

    /// Whole of data memory, for functions taking guest pointers
    pub fn memory(&self) -> &MemoryRegion {
        self.data
    }
}

/// A host function callable from the guest
pub type HostFunction = Arc<dyn Fn(&ParamBlock<'_>) -> Result<u64, Fault> + Send + Sync>;

/// Host capability: load / resolve / unload
pub trait LibraryLoader: Send + Sync {
    /// Open a library by name. Returns a non-zero handle.
    fn load(&self, name: &str) -> Option<u64>;

    /// Close a handle. Returns whether it was open.
    fn unload(&self, handle: u64) -> bool;

    fn resolve(&self, handle: u64, symbol: &str) -> Option<HostFunction>;
}

type Library = HashMap<String, HostFunction>;

#[derive(Default)]
pub struct StaticLibraryLoader {
    libraries: RwLock<HashMap<String, Library>>,
    open: Mutex<OpenLibraries>,
}

#[derive(Default)]
struct OpenLibraries {
    handles: HashMap<u64, String>,
    next: u64,
}

impl StaticLibraryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader preloaded with the `rayos` library (see `builtin_library`)
    pub fn with_builtins() -> Self {
        let loader = Self::new();
        for (symbol, function) in builtin_library() {
            loader.register("rayos", &symbol, function);
        }
        loader
    }

    /// Add `symbol` to `library`, creating the library if needed
    pub fn register(&self, library: &str, symbol: &str, function: HostFunction) {
        log::debug!("Registering {}::{}", library, symbol);
        self.libraries
            .write()
            .entry(library.to_string())
            .or_default()
            .insert(symbol.to_string(), function);
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().handles.len()
    }
}

impl LibraryLoader for StaticLibraryLoader {
    fn load(&self, name: &str) -> Option<u64> {
        if !self.libraries.read().contains_key(name) {
            log::warn!("Library {:?} is not registered", name);
            return None;
        }

        let mut open = self.open.lock();
        open.next += 1;
        let handle = open.next;
        open.handles.insert(handle, name.to_string());
        log::debug!("Loaded {:?} as handle {}", name, handle);
        Some(handle)
    }

    fn unload(&self, handle: u64) -> bool {
        self.open.lock().handles.remove(&handle).is_some()
    }

    fn resolve(&self, handle: u64, symbol: &str) -> Option<HostFunction> {
        let name = self.open.lock().handles.get(&handle)?.clone();
        self.libraries.read().get(&name)?.get(symbol).cloned()
    }
}

/// Functions of the `rayos` library:
/// - `sum(a, b)` returns `a + b`
/// - `print_u64(v)` writes `v` and a newline to stdout, returns 0
/// - `print_str(addr)` writes the guest string at `addr` to stdout, returns its length
pub fn builtin_library() -> Vec<(String, HostFunction)> {
    let sum: HostFunction = Arc::new(|p: &ParamBlock<'_>| -> Result<u64, Fault> {
        Ok(p.arg(0)?.wrapping_add(p.arg(1)?))
    });
    let print_u64: HostFunction = Arc::new(|p: &ParamBlock<'_>| -> Result<u64, Fault> {
        println!("{}", p.arg(0)?);
        Ok(0)
    });
    let print_str: HostFunction = Arc::new(|p: &ParamBlock<'_>| -> Result<u64, Fault> {
        let text = p.memory().read_cstr(p.arg(0)?)?;
        print!("{text}");
        Ok(text.len() as u64)
    });

    vec![
        ("sum".to_string(), sum),
        ("print_u64".to_string(), print_u64),
        ("print_str".to_string(), print_str),
    ]
}
