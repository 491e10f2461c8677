//! Supplemental page table: one per address space, keyed by page address.
//!
//! The table only indexes descriptors. Tearing a page down needs the frame
//! table and the address space's mapper, so `remove` and `destroy` live on
//! [`AddressSpace`](crate::AddressSpace) and use [`take`](SupplementalPageTable::take)
//! and [`drain`](SupplementalPageTable::drain) here.

use alloc::sync::Arc;
use alloc::vec::Vec;

use vmm_hal::mmu::{is_page_aligned, page_align_down};
use vmm_utils::{HashMap, Mutex};

use crate::error::VmError;
use crate::page::{Page, PageInit, PageRef};

/// Behaviors: [T1]-[T5]
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: Mutex<HashMap<usize, PageRef>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// [T1] Register an uninitialised page, [T2] duplicates are rejected
    /// without touching the existing page
    ///
    /// Never allocates a frame.
    pub fn create(&self, va: usize, writable: bool, init: PageInit) -> Result<PageRef, VmError> {
        self.insert(Page::uninit(va, writable, init))
    }

    pub(crate) fn insert(&self, page: Page) -> Result<PageRef, VmError> {
        let va = page.va();
        if !is_page_aligned(va) {
            return Err(VmError::Misaligned);
        }
        let mut pages = self.pages.lock();
        if pages.contains_key(&va) {
            log::warn!("[VM] page {va:#x} already registered");
            return Err(VmError::AlreadyMapped);
        }
        let page = Arc::new(Mutex::new(page));
        pages.insert(va, page.clone());
        Ok(page)
    }

    /// [T3] Look up the page containing `addr`
    pub fn find(&self, addr: usize) -> Option<PageRef> {
        self.pages.lock().get(&page_align_down(addr)).cloned()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.pages.lock().contains_key(&page_align_down(addr))
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Snapshot of every page, in no particular order.
    pub fn pages(&self) -> Vec<PageRef> {
        self.pages.lock().values().cloned().collect()
    }

    /// [T4] Unlink the page containing `addr`
    pub(crate) fn take(&self, addr: usize) -> Option<PageRef> {
        self.pages.lock().remove(&page_align_down(addr))
    }

    /// [T4] Unlink the page at `va` only if it is still `page`
    pub(crate) fn take_exact(&self, va: usize, page: &PageRef) -> bool {
        let mut pages = self.pages.lock();
        match pages.get(&va) {
            Some(current) if Arc::ptr_eq(current, page) => {
                pages.remove(&va);
                true
            }
            _ => false,
        }
    }

    /// [T5] Unlink every page; a second drain finds nothing
    pub(crate) fn drain(&self) -> Vec<PageRef> {
        self.pages.lock().drain().map(|(_, page)| page).collect()
    }
}
