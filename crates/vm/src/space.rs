//! Per-process address space.
//!
//! TEAM_301: Ties one supplemental page table to the process-wide [`Vm`]
//! services and to the process's own page-table installer. Fault handling,
//! mmap and fork are implemented on this type in their own modules.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use vmm_hal::mmu::{PAGE_SIZE, is_page_aligned, page_bytes, page_bytes_mut, virt_to_phys};
use vmm_hal::{AddressMapper, FileHandle};
use vmm_utils::Mutex;

use crate::Vm;
use crate::error::VmError;
use crate::file::FileSlice;
use crate::mmap::Mapping;
use crate::page::{Page, PageInit, PageRef};
use crate::spt::SupplementalPageTable;

/// Behaviors: [V1]-[V9]
pub struct AddressSpace {
    pub(crate) vm: Arc<Vm>,
    pub(crate) mmu: Arc<dyn AddressMapper>,
    pub(crate) spt: SupplementalPageTable,
    /// Live file mappings by base address
    pub(crate) mappings: Mutex<BTreeMap<usize, Mapping>>,
}

impl AddressSpace {
    pub fn new(vm: Arc<Vm>, mmu: Arc<dyn AddressMapper>) -> Self {
        Self {
            vm,
            mmu,
            spt: SupplementalPageTable::new(),
            mappings: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn mmu(&self) -> &Arc<dyn AddressMapper> {
        &self.mmu
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// [V1] Register a lazily populated page at a user address
    pub fn create_page(
        &self,
        va: usize,
        writable: bool,
        init: PageInit,
    ) -> Result<PageRef, VmError> {
        self.vm.config().check_user_addr(va)?;
        self.spt.create(va, writable, init)
    }

    pub fn find_page(&self, addr: usize) -> Option<PageRef> {
        self.spt.find(addr)
    }

    /// [V2] Make the page at `va` resident now
    pub fn claim(&self, va: usize) -> Result<(), VmError> {
        let page = self.spt.find(va).ok_or(VmError::NotMapped)?;
        let mut guard = page.lock();
        self.claim_locked(&page, &mut guard)
    }

    /// Give a locked page a frame and map it. [V3] Already resident pages
    /// only get their mapping re-installed.
    pub(crate) fn claim_locked(&self, page_ref: &PageRef, page: &mut Page) -> Result<(), VmError> {
        if let Some(id) = page.frame {
            let kva = self.vm.frames().kva(id)?;
            self.mmu.install(page.va(), virt_to_phys(kva), page.writable())?;
            return Ok(());
        }
        let swap = self.vm.swap();
        self.attach_frame(page_ref, page, |page, frame| page.load_into(frame, swap))?;
        // Swap slots and loaders are only consumed once the mapping exists
        page.commit_load(swap);
        log::trace!("[VM] {:#x} resident", page.va());
        Ok(())
    }

    /// Acquire a frame, fill it, map it and record the owner. On failure the
    /// frame goes back to the pool and the page stays non-resident.
    pub(crate) fn attach_frame<F>(
        &self,
        page_ref: &PageRef,
        page: &mut Page,
        fill: F,
    ) -> Result<(), VmError>
    where
        F: FnOnce(&mut Page, &mut [u8; PAGE_SIZE]) -> Result<(), VmError>,
    {
        let frames = self.vm.frames();
        let (id, kva) = frames.acquire(self.vm.swap())?;
        // SAFETY: the frame was just acquired and has no owner or mapping yet
        let bytes = unsafe { page_bytes_mut(kva) };
        let installed = fill(&mut *page, bytes).and_then(|()| {
            self.mmu
                .install(page.va(), virt_to_phys(kva), page.writable())
                .map_err(VmError::from)
        });
        if let Err(err) = installed {
            if let Err(e) = frames.release(id) {
                log::error!("[FRAME] releasing unused frame: {e}");
            }
            return Err(err);
        }
        page.frame = Some(id);
        frames.set_owner(id, page_ref, self.mmu.clone(), page.va())
    }

    /// [V4] Drop the page at `addr`, writing back dirty file content and
    /// releasing its frame and swap slot
    pub fn remove(&self, addr: usize) -> Result<(), VmError> {
        let page = self.spt.take(addr).ok_or(VmError::NotMapped)?;
        self.teardown(&page)
    }

    pub(crate) fn teardown(&self, page_ref: &PageRef) -> Result<(), VmError> {
        let mut page = page_ref.lock();
        let Some(id) = page.frame.take() else {
            return page.destroy(None, false, self.vm.swap());
        };
        let dirty = self.mmu.invalidate(page.va());
        let result = match self.vm.frames().kva(id) {
            Ok(kva) => {
                // SAFETY: unmapped frame of a locked page
                let bytes = unsafe { page_bytes(kva) };
                page.destroy(Some(bytes), dirty, self.vm.swap())
            }
            Err(err) => Err(err),
        };
        if let Err(e) = self.vm.frames().release(id) {
            log::error!("[VM] releasing frame of {:#x}: {}", page.va(), e);
        }
        result
    }

    /// [V5] Tear down every page; calling it again is a no-op
    pub fn destroy(&self) {
        let pages = self.spt.drain();
        let count = pages.len();
        for page in pages {
            if let Err(err) = self.teardown(&page) {
                log::error!("[VM] teardown: {err}");
            }
        }
        self.mappings.lock().clear();
        if count > 0 {
            log::debug!("[VM] address space destroyed, {count} pages");
        }
    }

    /// [V6] Register and claim the first stack page, returning the initial
    /// stack pointer
    pub fn setup_stack(&self) -> Result<usize, VmError> {
        let top = self.vm.config().stack_top;
        let va = top - PAGE_SIZE;
        self.create_page(va, true, PageInit::zeroed())?;
        if let Err(err) = self.claim(va) {
            if let Err(e) = self.remove(va) {
                log::error!("[VM] rollback of stack page {va:#x}: {e}");
            }
            return Err(err);
        }
        Ok(top)
    }

    /// Lazily map an executable segment: one anonymous page per page of the
    /// segment, each loading its share of `file` on first touch.
    ///
    /// [V7] `read_bytes + zero_bytes` must cover whole pages, [V8] a failure
    /// part way removes the pages already registered
    pub fn load_segment(
        &self,
        file: &Arc<dyn FileHandle>,
        offset: u64,
        va: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        if !is_page_aligned(va) || offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::Misaligned);
        }
        let total = read_bytes + zero_bytes;
        if total == 0 || total % PAGE_SIZE != 0 {
            return Err(VmError::BadSegment);
        }
        let mut pending = PendingPages::new(self);
        let mut remaining = read_bytes;
        for k in 0..total / PAGE_SIZE {
            let page_read = remaining.min(PAGE_SIZE);
            let slice = FileSlice::new(
                file.clone(),
                offset + (k * PAGE_SIZE) as u64,
                page_read,
                PAGE_SIZE - page_read,
            );
            let page_va = va + k * PAGE_SIZE;
            self.create_page(page_va, writable, PageInit::anon_with(Arc::new(slice)))?;
            pending.track(page_va);
            remaining -= page_read;
        }
        pending.commit();
        log::debug!("[VM] segment {va:#x}+{total:#x} registered");
        Ok(())
    }
}

impl Drop for AddressSpace {
    /// [V9] Dropping the space destroys it
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Pages registered by an operation that may still fail.
/// Unless committed, everything tracked is removed again on drop.
pub(crate) struct PendingPages<'a> {
    space: &'a AddressSpace,
    created: Vec<usize>,
    committed: bool,
}

impl<'a> PendingPages<'a> {
    pub(crate) fn new(space: &'a AddressSpace) -> Self {
        Self {
            space,
            created: Vec::new(),
            committed: false,
        }
    }

    pub(crate) fn track(&mut self, va: usize) {
        self.created.push(va);
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingPages<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for &va in &self.created {
            if let Err(err) = self.space.remove(va) {
                log::error!("[VM] rollback of {va:#x}: {err}");
            }
        }
    }
}
