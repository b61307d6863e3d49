/// Page Allocator - "The Host Memory"
///
/// Hands out zeroed, read/write page-backed blocks for instruction memory,
/// data memory and core stacks. Blocks are anonymous host mappings that are
/// released when the owning `PageBlock` is dropped.

use crate::error::AllocError;
use crate::types::PAGE_SIZE;
use memmap2::{MmapMut, MmapOptions};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Host capability: acquire N bytes of zeroed read/write memory
pub trait PageAllocator: Send + Sync {
    /// Acquire at least `len` bytes. The block is released on drop.
    fn acquire(&self, len: usize) -> Result<PageBlock, AllocError>;

    /// Bytes currently handed out
    fn in_use(&self) -> usize;
}

/// Round up to whole pages, never less than one page
pub fn page_align(len: usize) -> usize {
    let pages = len.div_ceil(PAGE_SIZE).max(1);
    pages.saturating_mul(PAGE_SIZE)
}

/// Usage accounting shared by an allocator and every block it handed out
#[derive(Debug, Default)]
pub struct AllocLedger {
    in_use: AtomicUsize,
    limit: Option<usize>,
}

impl AllocLedger {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            in_use: AtomicUsize::new(0),
            limit,
        }
    }

    /// Reserve `bytes` against the budget
    fn charge(&self, bytes: usize) -> Result<(), AllocError> {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(AllocError::BudgetExceeded {
                        requested: bytes,
                        in_use: current,
                        limit,
                    });
                }
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// A zeroed page-backed block owned by exactly one memory region
pub struct PageBlock {
    // Keeps the mapping alive; `base` points into it.
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
    ledger: Arc<AllocLedger>,
}

// SAFETY: the mapping is only ever accessed through `AtomicU8` views, and
// the pointer stays valid for as long as `_map` lives inside the block.
unsafe impl Send for PageBlock {}
unsafe impl Sync for PageBlock {}

impl PageBlock {
    fn new(mut map: MmapMut, ledger: Arc<AllocLedger>) -> Result<Self, AllocError> {
        let len = map.len();
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| AllocError::Host {
            requested: len,
            reason: "mapping returned a null base".to_string(),
        })?;
        Ok(Self {
            _map: map,
            base,
            len,
            ledger,
        })
    }

    /// Mapped length in bytes (page multiple)
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte view with relaxed per-byte atomicity
    pub fn cells(&self) -> &[AtomicU8] {
        // SAFETY: `base..base+len` is a live RW mapping owned by `self`, and
        // `AtomicU8` has the same size and alignment as `u8`.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr() as *const AtomicU8, self.len) }
    }
}

impl Drop for PageBlock {
    fn drop(&mut self) {
        self.ledger.release(self.len);
        log::debug!("Released {} bytes at {:p}", self.len, self.base.as_ptr());
    }
}

impl std::fmt::Debug for PageBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBlock")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

/// Page allocator backed by anonymous host mappings
#[derive(Debug)]
pub struct HostPageAllocator {
    ledger: Arc<AllocLedger>,
}

impl HostPageAllocator {
    pub fn new() -> Self {
        log::info!("Initializing host page allocator (unbounded)");
        Self {
            ledger: Arc::new(AllocLedger::new(None)),
        }
    }

    /// Allocator that refuses to hand out more than `bytes` in total
    pub fn with_limit(bytes: usize) -> Self {
        log::info!("Initializing host page allocator (budget {} bytes)", bytes);
        Self {
            ledger: Arc::new(AllocLedger::new(Some(bytes))),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.ledger.limit()
    }
}

impl Default for HostPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for HostPageAllocator {
    fn acquire(&self, len: usize) -> Result<PageBlock, AllocError> {
        let aligned = page_align(len);
        self.ledger.charge(aligned)?;

        let map = match MmapOptions::new().len(aligned).map_anon() {
            Ok(map) => map,
            Err(e) => {
                self.ledger.release(aligned);
                return Err(AllocError::Host {
                    requested: aligned,
                    reason: e.to_string(),
                });
            }
        };

        let block = match PageBlock::new(map, Arc::clone(&self.ledger)) {
            Ok(block) => block,
            Err(e) => {
                self.ledger.release(aligned);
                return Err(e);
            }
        };

        log::debug!("Mapped {} bytes at {:p}", aligned, block.base.as_ptr());
        Ok(block)
    }

    fn in_use(&self) -> usize {
        self.ledger.in_use()
    }
}
