/// Host Abstraction Layer - "The Spine"
///
/// Host capabilities the VM is built on: page memory, dynamic libraries
/// and files.

pub mod allocator;
pub mod files;
pub mod loader;

use allocator::{HostPageAllocator, PageAllocator};
use loader::{LibraryLoader, StaticLibraryLoader};
use std::sync::Arc;

/// Capabilities handed to the supervisor at construction
#[derive(Clone)]
pub struct HostServices {
    pub allocator: Arc<dyn PageAllocator>,
    pub loader: Arc<dyn LibraryLoader>,
}

impl HostServices {
    pub fn new(allocator: Arc<dyn PageAllocator>, loader: Arc<dyn LibraryLoader>) -> Self {
        Self { allocator, loader }
    }

    /// Host mappings (bounded by `memory_budget` if given) plus the builtin library
    pub fn host(memory_budget: Option<usize>) -> Self {
        let allocator: Arc<dyn PageAllocator> = match memory_budget {
            Some(limit) => Arc::new(HostPageAllocator::with_limit(limit)),
            None => Arc::new(HostPageAllocator::new()),
        };
        Self {
            allocator,
            loader: Arc::new(StaticLibraryLoader::with_builtins()),
        }
    }
}

impl Default for HostServices {
    fn default() -> Self {
        Self::host(None)
    }
}
