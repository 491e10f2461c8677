//! File mappings.
//!
//! A mapping is a run of file-backed pages registered lazily; nothing is read
//! until the first fault. The address space keeps a registry of live mappings
//! so that `munmap` knows how far to walk and which pages are its own.

use alloc::sync::Arc;
use alloc::vec::Vec;

use vmm_hal::FileHandle;
use vmm_hal::mmu::{PAGE_SIZE, is_page_aligned, pages_for};

use crate::error::VmError;
use crate::file::FileSlice;
use crate::page::{PageInit, PageRef};
use crate::space::{AddressSpace, PendingPages};

/// Registry entry for one live mapping.
#[derive(Clone)]
pub(crate) struct Mapping {
    pub(crate) pages: usize,
    /// The reopened handle every page of the mapping reads through
    pub(crate) file: Arc<dyn FileHandle>,
}

impl Mapping {
    /// The page was created by this mapping, not merely placed in its range.
    fn owns(&self, page: &PageRef) -> bool {
        let page = page.lock();
        page.file_slice()
            .is_some_and(|slice| Arc::ptr_eq(slice.file(), &self.file))
    }
}

impl AddressSpace {
    /// Map `length` bytes of `file` from `offset` at `addr`, returning `addr`.
    ///
    /// Behaviors:
    /// - [MM1] null, misaligned, empty and out-of-range requests are rejected
    /// - [MM2] overlap with any existing page is rejected before anything is created
    /// - [MM3] the last page reads up to `length` or end of file, whichever
    ///   comes first, and zero-fills the rest
    /// - [MM4] the mapping keeps its own handle to the file
    pub fn mmap(
        &self,
        addr: usize,
        length: usize,
        writable: bool,
        file: &Arc<dyn FileHandle>,
        offset: u64,
    ) -> Result<usize, VmError> {
        // [MM1]
        if addr < PAGE_SIZE {
            return Err(VmError::NullAddress);
        }
        if !is_page_aligned(addr) {
            return Err(VmError::Misaligned);
        }
        if length == 0 {
            return Err(VmError::ZeroLength);
        }
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::Misaligned);
        }
        let file_len = file.len();
        if file_len == 0 {
            return Err(VmError::EmptyFile);
        }
        let count = pages_for(length);
        let end = count
            .checked_mul(PAGE_SIZE)
            .and_then(|span| addr.checked_add(span))
            .ok_or(VmError::KernelAddress)?;
        if end > self.vm.config().user_space_end {
            return Err(VmError::KernelAddress);
        }

        // [MM2]
        if (0..count).any(|k| self.spt.contains(addr + k * PAGE_SIZE)) {
            log::warn!("[MMAP] {addr:#x}+{length:#x} overlaps an existing page");
            return Err(VmError::AlreadyMapped);
        }

        // [MM4]
        let file = file.reopen()?;
        let mut pending = PendingPages::new(self);
        for k in 0..count {
            let page_offset = offset + (k * PAGE_SIZE) as u64;
            // [MM3] bytes past `length` are zero even if the file goes on
            let in_file = file_len.saturating_sub(page_offset).min(PAGE_SIZE as u64) as usize;
            let read_bytes = in_file.min(length - k * PAGE_SIZE);
            let slice = FileSlice::new(
                file.clone(),
                page_offset,
                read_bytes,
                PAGE_SIZE - read_bytes,
            );
            let va = addr + k * PAGE_SIZE;
            self.spt.create(va, writable, PageInit::File(slice))?;
            pending.track(va);
        }
        pending.commit();

        self.mappings.lock().insert(addr, Mapping { pages: count, file });
        log::debug!("[MMAP] mapped {count} pages at {addr:#x} from offset {offset:#x}");
        Ok(addr)
    }

    /// Remove the mapping based at `addr`, writing dirty pages back.
    ///
    /// [MM5] only the base of a live mapping is accepted, [MM6] every page is
    /// removed even if an earlier write-back fails; the first error is returned,
    /// [MM7] pages in the range that belong to something else are left alone
    pub fn munmap(&self, addr: usize) -> Result<(), VmError> {
        let Some(mapping) = self.mappings.lock().remove(&addr) else {
            log::warn!("[MMAP] munmap of unknown mapping {addr:#x}");
            return Err(VmError::NotMapped);
        };
        let mut result = Ok(());
        for k in 0..mapping.pages {
            let va = addr + k * PAGE_SIZE;
            // Already gone, e.g. removed page by page
            let Some(page) = self.spt.find(va) else {
                continue;
            };
            if !mapping.owns(&page) {
                log::debug!("[MMAP] {va:#x} was replaced, leaving it mapped");
                continue;
            }
            if !self.spt.take_exact(va, &page) {
                continue;
            }
            if let Err(err) = self.teardown(&page) {
                log::error!("[MMAP] unmapping {va:#x}: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        log::debug!("[MMAP] unmapped {} pages at {addr:#x}", mapping.pages);
        result
    }

    /// Live mappings as `(base, page count)`, lowest address first.
    pub fn mappings(&self) -> Vec<(usize, usize)> {
        self.mappings
            .lock()
            .iter()
            .map(|(&base, mapping)| (base, mapping.pages))
            .collect()
    }
}
