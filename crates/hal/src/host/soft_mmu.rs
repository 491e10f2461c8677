//! Software page table for host builds.
//!
//! Holds one leaf entry per user page and emulates the accessed and dirty
//! bits that hardware would set, so the pager's policies can be exercised
//! without a real MMU.

use vmm_utils::{HashMap, Mutex};

use crate::mmu::{
    MmuError, PAGE_MASK, PAGE_SIZE, PageFlags, is_page_aligned, page_align_down, page_bytes_mut,
    phys_to_virt,
};
use crate::traits::AddressMapper;

/// A 64-bit leaf entry: frame address plus [`PageFlags`].
#[derive(Clone, Copy)]
#[repr(transparent)]
struct PageTableEntry(u64);

impl PageTableEntry {
    const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    fn new(pa: usize, flags: PageFlags) -> Self {
        Self(((pa as u64) & Self::ADDR_MASK) | flags.bits())
    }

    fn address(self) -> usize {
        (self.0 & Self::ADDR_MASK) as usize
    }

    fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    fn insert(&mut self, flags: PageFlags) {
        self.0 |= flags.bits();
    }

    fn remove(&mut self, flags: PageFlags) {
        self.0 &= !flags.bits();
    }
}

/// Behaviors: [S1]-[S6]
#[derive(Default)]
pub struct SoftMmu {
    entries: Mutex<HashMap<usize, PageTableEntry>>,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live leaf entries.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    /// Flags of the entry at `va`, if mapped.
    pub fn flags(&self, va: usize) -> Option<PageFlags> {
        self.entries.lock().get(&page_align_down(va)).map(|e| e.flags())
    }

    /// [S4] Copy user memory out, failing on the first unmapped page
    pub fn read(&self, va: usize, buf: &mut [u8]) -> Result<(), MmuError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let offset = addr & PAGE_MASK;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            self.access(addr, false, |page| {
                buf[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// [S5] Copy user memory in, [S6] writes to read-only pages fault
    pub fn write(&self, va: usize, data: &[u8]) -> Result<(), MmuError> {
        let mut done = 0;
        while done < data.len() {
            let addr = va + done;
            let offset = addr & PAGE_MASK;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            self.access(addr, true, |page| {
                page[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Run `f` on the frame behind `addr` with the table locked, so an
    /// invalidation cannot race the copy.
    fn access<F>(&self, addr: usize, write: bool, f: F) -> Result<(), MmuError>
    where
        F: FnOnce(&mut [u8; PAGE_SIZE]),
    {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&page_align_down(addr))
            .ok_or(MmuError::NotMapped)?;
        if write && !entry.flags().contains(PageFlags::WRITABLE) {
            return Err(MmuError::PermissionFault);
        }
        entry.insert(if write {
            PageFlags::ACCESSED | PageFlags::DIRTY
        } else {
            PageFlags::ACCESSED
        });
        // SAFETY: entries only point at frames the pager installed and it
        // invalidates them under this lock before releasing the frame
        f(unsafe { page_bytes_mut(phys_to_virt(entry.address())) });
        Ok(())
    }
}

impl AddressMapper for SoftMmu {
    /// [S1] Install a fresh entry, [S2] same frame is a no-op
    fn install(&self, va: usize, pa: usize, writable: bool) -> Result<(), MmuError> {
        if !is_page_aligned(va) || !is_page_aligned(pa) {
            return Err(MmuError::Misaligned);
        }
        let mut entries = self.entries.lock();
        match entries.get(&va) {
            Some(entry) if entry.address() == pa => Ok(()),
            Some(_) => Err(MmuError::AlreadyMapped),
            None => {
                entries.insert(va, PageTableEntry::new(pa, PageFlags::user(writable)));
                Ok(())
            }
        }
    }

    /// [S3] Removal reports the dirty bit
    fn invalidate(&self, va: usize) -> bool {
        self.entries
            .lock()
            .remove(&page_align_down(va))
            .is_some_and(|e| e.flags().contains(PageFlags::DIRTY))
    }

    fn translate(&self, va: usize) -> Option<usize> {
        self.entries
            .lock()
            .get(&page_align_down(va))
            .map(|e| e.address() + (va & PAGE_MASK))
    }

    fn is_dirty(&self, va: usize) -> bool {
        self.flags(va).is_some_and(|f| f.contains(PageFlags::DIRTY))
    }

    fn is_accessed(&self, va: usize) -> bool {
        self.flags(va).is_some_and(|f| f.contains(PageFlags::ACCESSED))
    }

    fn clear_accessed(&self, va: usize) {
        if let Some(entry) = self.entries.lock().get_mut(&page_align_down(va)) {
            entry.remove(PageFlags::ACCESSED);
        }
    }
}
