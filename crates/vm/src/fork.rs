//! Address-space duplication.
//!
//! Every page is copied eagerly; there is no copy-on-write. Deferred pages
//! stay deferred in the child and share the parent's loader.

use alloc::sync::Arc;

use vmm_hal::AddressMapper;
use vmm_hal::mmu::page_bytes;

use crate::anon::AnonPage;
use crate::error::VmError;
use crate::file::FilePage;
use crate::page::{Page, PageKind, PageRef};
use crate::space::AddressSpace;

impl AddressSpace {
    /// Duplicate this address space into a new one using `child_mmu`.
    ///
    /// Behaviors:
    /// - [K1] uninitialised pages stay uninitialised with the same loader
    /// - [K2] anonymous pages are brought in if needed and byte-copied
    /// - [K3] resident file pages are byte-copied and keep the parent's
    ///   unwritten changes pending for write-back
    /// - [K4] non-resident file pages re-read the file in the child
    /// - [K5] file mappings are copied
    /// - [K6] on error the partial child is torn down
    pub fn fork(&self, child_mmu: Arc<dyn AddressMapper>) -> Result<AddressSpace, VmError> {
        let child = AddressSpace::new(self.vm.clone(), child_mmu);
        let pages = self.spt.pages();
        for page in &pages {
            // [K6] dropping `child` destroys whatever was built
            if let Err(err) = self.fork_page(page, &child) {
                log::warn!("[FORK] failed after {} pages: {}", child.spt.len(), err);
                return Err(err);
            }
        }
        // [K5]
        *child.mappings.lock() = self.mappings.lock().clone();
        log::debug!("[FORK] copied {} pages", pages.len());
        Ok(child)
    }

    fn fork_page(&self, page_ref: &PageRef, child: &AddressSpace) -> Result<(), VmError> {
        let mut page = page_ref.lock();
        let va = page.va();
        let writable = page.writable();

        let kind = match page.kind() {
            // [K1]
            PageKind::Uninit(init) => {
                child.spt.create(va, writable, init.clone())?;
                return Ok(());
            }
            // [K4]
            PageKind::File(file) if !page.is_resident() => {
                let kind = PageKind::File(FilePage::new(file.slice().clone()));
                child.spt.insert(Page::new(va, writable, kind))?;
                return Ok(());
            }
            // [K3]
            PageKind::File(file) => {
                let pending = file.pending_write() || self.mmu.is_dirty(va);
                PageKind::File(FilePage::with_pending_write(file.slice().clone(), pending))
            }
            // [K2]
            PageKind::Anon(_) => PageKind::Anon(AnonPage::new()),
        };

        if !page.is_resident() {
            self.claim_locked(page_ref, &mut page)?;
        }
        let parent_frame = page.frame().ok_or(VmError::NotResident)?;
        let kva = self.vm.frames().kva(parent_frame)?;
        // SAFETY: the parent page is locked, so its frame cannot be evicted
        let source = unsafe { page_bytes(kva) };

        let child_ref = child.spt.insert(Page::new(va, writable, kind))?;
        let mut child_page = child_ref.lock();
        child.attach_frame(&child_ref, &mut child_page, |_, frame| {
            frame.copy_from_slice(source);
            Ok(())
        })
    }
}
