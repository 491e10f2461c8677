// TEAM_301: Fixed-budget user frame pool.
// The pager draws every user frame from one of these so the number of
// resident pages is bounded independently of the kernel heap.

use alloc::boxed::Box;
use alloc::vec::Vec;

use vmm_utils::{HashSet, Mutex};

use crate::mmu::PAGE_SIZE;
use crate::traits::PageAllocator;

/// One page-aligned frame of backing memory.
#[repr(C, align(4096))]
struct PageFrame([u8; PAGE_SIZE]);

struct PoolInner {
    /// Every frame the pool owns, freed on drop
    frames: Vec<usize>,
    free: Vec<usize>,
    in_use: HashSet<usize>,
}

/// Pool of `capacity` frames carved out of the heap up front.
/// Behaviors: [P1]-[P4]
pub struct PagePool(Mutex<PoolInner>);

impl PagePool {
    /// [P1] All frames start free
    pub fn new(capacity: usize) -> Self {
        let frames: Vec<usize> = (0..capacity)
            .map(|_| Box::into_raw(Box::new(PageFrame([0; PAGE_SIZE]))) as usize)
            .collect();
        // Hand out low addresses first
        let free = frames.iter().rev().copied().collect();
        Self(Mutex::new(PoolInner {
            frames,
            free,
            in_use: HashSet::new(),
        }))
    }

    pub fn capacity(&self) -> usize {
        self.0.lock().frames.len()
    }

    pub fn free_count(&self) -> usize {
        self.0.lock().free.len()
    }

    pub fn in_use(&self) -> usize {
        self.0.lock().in_use.len()
    }
}

impl PageAllocator for PagePool {
    /// [P2] Returns `None` once every frame is handed out
    fn alloc_page(&self) -> Option<usize> {
        let mut inner = self.0.lock();
        let kva = inner.free.pop()?;
        inner.in_use.insert(kva);
        Some(kva)
    }

    /// [P3] Freed frames become available again, [P4] unknown or double frees are ignored
    fn free_page(&self, kva: usize) {
        let mut inner = self.0.lock();
        if inner.in_use.remove(&kva) {
            inner.free.push(kva);
        } else {
            log::error!("[POOL] free of page {kva:#x} not handed out by this pool");
        }
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let inner = self.0.get_mut();
        for &kva in &inner.frames {
            // SAFETY: every entry came from Box::into_raw in new() and is released once
            drop(unsafe { Box::from_raw(kva as *mut PageFrame) });
        }
        inner.frames.clear();
    }
}
