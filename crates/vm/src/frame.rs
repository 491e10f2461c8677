//! Frame table and eviction.
//!
//! TEAM_301: Every user frame handed out by the page allocator is recorded in
//! an arena slot. Pages refer to their frame by [`FrameId`], an index plus
//! the slot's generation, so a handle that outlived its frame is detected
//! instead of aliasing the next occupant.
//!
//! When the allocator is empty a victim is picked by a clock sweep. A frame
//! whose mapping was accessed since the hand last passed gets its accessed
//! bit cleared and is skipped once. Frames with no owner and frames whose page
//! is locked (being populated, evicted or copied) are never chosen.
//!
//! The table lock only covers slot metadata. Victim pages are locked with
//! `try_lock` after the table lock is dropped, and the victim's write-out
//! runs with only the page lock held.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use vmm_hal::mmu::{page_bytes, virt_to_phys};
use vmm_hal::{AddressMapper, PageAllocator};
use vmm_utils::Mutex;

use crate::error::VmError;
use crate::page::{Page, PageRef};
use crate::swap::SwapTable;

/// Generational handle on a frame slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl FrameId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames currently allocated
    pub resident: usize,
    /// Frames reclaimed from a victim page
    pub evictions: u64,
    /// Victims skipped because they were recently accessed
    pub second_chances: u64,
}

/// The page occupying a frame and where it is mapped.
struct FrameOwner {
    page: Weak<Mutex<Page>>,
    mmu: Arc<dyn AddressMapper>,
    va: usize,
}

struct Frame {
    kva: usize,
    owner: Option<FrameOwner>,
}

struct Slot {
    generation: u32,
    frame: Option<Frame>,
}

struct Victim {
    id: FrameId,
    kva: usize,
    page: PageRef,
    mmu: Arc<dyn AddressMapper>,
    va: usize,
}

struct Inner {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    hand: usize,
    stats: FrameStats,
}

impl Inner {
    fn frame(&self, id: FrameId) -> Result<&Frame, VmError> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.frame.as_ref())
            .ok_or(VmError::StaleFrame)
    }

    fn frame_mut(&mut self, id: FrameId) -> Result<&mut Frame, VmError> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.frame.as_mut())
            .ok_or(VmError::StaleFrame)
    }

    fn insert(&mut self, kva: usize) -> FrameId {
        let frame = Frame { kva, owner: None };
        self.stats.resident += 1;
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            slot.frame = Some(frame);
            return FrameId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            frame: Some(frame),
        });
        FrameId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn remove(&mut self, id: FrameId) -> Result<usize, VmError> {
        let kva = self.frame(id)?.kva;
        let slot = &mut self.slots[id.index()];
        slot.frame = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        self.stats.resident -= 1;
        Ok(kva)
    }

    /// Hand the slot to a new occupant, invalidating the old handle.
    fn recycle(&mut self, id: FrameId) -> Result<FrameId, VmError> {
        self.frame_mut(id)?.owner = None;
        let slot = &mut self.slots[id.index()];
        slot.generation = slot.generation.wrapping_add(1);
        self.stats.evictions += 1;
        Ok(FrameId {
            index: id.index,
            generation: slot.generation,
        })
    }

    /// [E3] Clock sweep, at most two revolutions
    fn select_victim(&mut self) -> Option<Victim> {
        let n = self.slots.len();
        for _ in 0..2 * n {
            let index = self.hand % n;
            self.hand = (index + 1) % n;

            let slot = &self.slots[index];
            let Some(frame) = &slot.frame else { continue };
            // [E4] never an unowned frame
            let Some(owner) = &frame.owner else { continue };
            // [E5] recently used pages get a second chance
            if owner.mmu.is_accessed(owner.va) {
                owner.mmu.clear_accessed(owner.va);
                self.stats.second_chances += 1;
                continue;
            }
            let Some(page) = owner.page.upgrade() else { continue };
            // [E6] busy pages are skipped
            if page.is_locked() {
                continue;
            }
            return Some(Victim {
                id: FrameId {
                    index: index as u32,
                    generation: slot.generation,
                },
                kva: frame.kva,
                page,
                mmu: owner.mmu.clone(),
                va: owner.va,
            });
        }
        None
    }
}

/// Behaviors: [E1]-[E8]
pub struct FrameTable {
    allocator: Arc<dyn PageAllocator>,
    inner: Mutex<Inner>,
}

impl FrameTable {
    pub fn new(allocator: Arc<dyn PageAllocator>) -> Self {
        Self {
            allocator,
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                vacant: Vec::new(),
                hand: 0,
                stats: FrameStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> FrameStats {
        self.inner.lock().stats
    }

    /// Kernel address of a live frame.
    pub fn kva(&self, id: FrameId) -> Result<usize, VmError> {
        Ok(self.inner.lock().frame(id)?.kva)
    }

    /// Virtual address of the page occupying the frame.
    pub fn owner_va(&self, id: FrameId) -> Option<usize> {
        let inner = self.inner.lock();
        let owner = inner.frame(id).ok()?.owner.as_ref()?;
        Some(owner.va)
    }

    /// True when `page` is the recorded occupant of the frame.
    pub fn is_owned_by(&self, id: FrameId, page: &PageRef) -> bool {
        let inner = self.inner.lock();
        inner
            .frame(id)
            .ok()
            .and_then(|frame| frame.owner.as_ref())
            .is_some_and(|owner| core::ptr::eq(owner.page.as_ptr(), Arc::as_ptr(page)))
    }

    /// [E1] Fresh frame from the allocator, [E2] evict when it is empty
    ///
    /// The frame comes back unowned and unmapped; nothing can evict it until
    /// [`set_owner`](Self::set_owner) is called.
    pub(crate) fn acquire(&self, swap: &SwapTable) -> Result<(FrameId, usize), VmError> {
        if let Some(kva) = self.allocator.alloc_page() {
            let id = self.inner.lock().insert(kva);
            log::trace!("[FRAME] allocated {kva:#x}");
            return Ok((id, kva));
        }
        self.evict(swap)
    }

    /// Record `page`, mapped at `va` through `mmu`, as the frame's occupant.
    pub(crate) fn set_owner(
        &self,
        id: FrameId,
        page: &PageRef,
        mmu: Arc<dyn AddressMapper>,
        va: usize,
    ) -> Result<(), VmError> {
        self.inner.lock().frame_mut(id)?.owner = Some(FrameOwner {
            page: Arc::downgrade(page),
            mmu,
            va,
        });
        Ok(())
    }

    /// [E7] Return the frame to the allocator; the handle goes stale
    pub(crate) fn release(&self, id: FrameId) -> Result<(), VmError> {
        let kva = self.inner.lock().remove(id)?;
        self.allocator.free_page(kva);
        log::trace!("[FRAME] released {kva:#x}");
        Ok(())
    }

    /// Reclaim one frame from a victim page and hand it out again.
    ///
    /// [E8] A failed write-out puts the victim back exactly as it was
    fn evict(&self, swap: &SwapTable) -> Result<(FrameId, usize), VmError> {
        let attempts = self.inner.lock().slots.len() + 1;
        for _ in 0..attempts {
            let Some(victim) = self.inner.lock().select_victim() else {
                break;
            };
            let Some(mut page) = victim.page.try_lock() else {
                continue;
            };
            // Lost a race with teardown or another eviction
            if page.frame != Some(victim.id) {
                continue;
            }
            let owner = {
                let mut inner = self.inner.lock();
                match inner.frame_mut(victim.id)?.owner.take() {
                    Some(owner) => owner,
                    None => continue,
                }
            };

            let dirty = victim.mmu.invalidate(victim.va);
            // SAFETY: the frame is detached and unmapped and its page is
            // locked, so nothing else touches it until it is recycled
            let bytes = unsafe { page_bytes(victim.kva) };
            if let Err(err) = page.evict(bytes, dirty, swap) {
                log::warn!("[FRAME] evicting {:#x} failed: {}", victim.va, err);
                if let Err(e) =
                    victim
                        .mmu
                        .install(victim.va, virt_to_phys(victim.kva), page.writable())
                {
                    log::error!("[FRAME] could not restore {:#x}: {}", victim.va, e);
                }
                self.inner.lock().frame_mut(victim.id)?.owner = Some(owner);
                return Err(err);
            }

            page.frame = None;
            let id = self.inner.lock().recycle(victim.id)?;
            log::debug!(
                "[FRAME] evicted {:#x} ({:?}) from {:#x}",
                victim.va,
                page.page_type(),
                victim.kva
            );
            return Ok((id, victim.kva));
        }
        log::warn!("[FRAME] no evictable frame");
        Err(VmError::OutOfFrames)
    }
}

impl Drop for FrameTable {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for slot in &mut inner.slots {
            if let Some(frame) = slot.frame.take() {
                self.allocator.free_page(frame.kva);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageInit;
    use crate::testutil::{Fixture, fixture};
    use vmm_hal::host::SoftMmu;
    use vmm_hal::mmu::{PAGE_SIZE, page_bytes_mut};

    const BASE: usize = 0x1000_0000;

    /// Make a zero-filled anonymous page resident, the way a fault would.
    fn resident(fx: &Fixture, mmu: &Arc<SoftMmu>, va: usize) -> PageRef {
        let frames = fx.vm.frames();
        let page: PageRef = Arc::new(Mutex::new(Page::uninit(va, true, PageInit::zeroed())));
        let (id, kva) = frames.acquire(fx.vm.swap()).unwrap();
        {
            let mut guard = page.lock();
            // SAFETY: fresh unowned frame
            guard
                .load_into(unsafe { page_bytes_mut(kva) }, fx.vm.swap())
                .unwrap();
            guard.commit_load(fx.vm.swap());
            mmu.install(va, virt_to_phys(kva), true).unwrap();
            guard.frame = Some(id);
        }
        frames.set_owner(id, &page, mmu.clone(), va).unwrap();
        page
    }

    /// Tests: [E1] frames come from the allocator
    #[test]
    fn test_acquire_from_allocator() {
        let fx = fixture(2, 4);
        let frames = fx.vm.frames();
        let (a, ka) = frames.acquire(fx.vm.swap()).unwrap();
        let (b, kb) = frames.acquire(fx.vm.swap()).unwrap();
        assert_ne!(a, b);
        assert_ne!(ka, kb);
        assert_eq!(frames.stats().resident, 2);
        assert_eq!(fx.pool.free_count(), 0);
    }

    /// Tests: [E7] release goes back to the pool, handle is stale
    #[test]
    fn test_release_makes_handle_stale() {
        let fx = fixture(1, 1);
        let frames = fx.vm.frames();
        let (id, _) = frames.acquire(fx.vm.swap()).unwrap();
        frames.release(id).unwrap();
        assert_eq!(fx.pool.free_count(), 1);
        assert_eq!(frames.kva(id), Err(VmError::StaleFrame));
        assert_eq!(frames.release(id), Err(VmError::StaleFrame));

        let (again, _) = frames.acquire(fx.vm.swap()).unwrap();
        assert_eq!(again.index(), id.index());
        assert_ne!(again, id);
    }

    /// Tests: [E2] eviction when the pool is empty
    #[test]
    fn test_evicts_when_exhausted() {
        let fx = fixture(2, 4);
        let mmu = Arc::new(SoftMmu::new());
        let a = resident(&fx, &mmu, BASE);
        let b = resident(&fx, &mmu, BASE + PAGE_SIZE);
        mmu.write(BASE, &[0xAB; 16]).unwrap();
        mmu.clear_accessed(BASE);

        let old = a.lock().frame().unwrap();
        let (id, _) = fx.vm.frames().acquire(fx.vm.swap()).unwrap();

        // The first slot under the hand goes
        assert_eq!(id.index(), old.index());
        assert!(!a.lock().is_resident());
        assert!(a.lock().swap_slot().is_some());
        assert!(b.lock().is_resident());
        assert_eq!(mmu.translate(BASE), None);
        assert_eq!(fx.vm.frames().kva(old), Err(VmError::StaleFrame));
        assert_eq!(fx.vm.frames().stats().evictions, 1);
    }

    /// Tests: [E5] accessed page survives one sweep
    #[test]
    fn test_second_chance() {
        let fx = fixture(2, 4);
        let mmu = Arc::new(SoftMmu::new());
        let a = resident(&fx, &mmu, BASE);
        let b = resident(&fx, &mmu, BASE + PAGE_SIZE);
        let mut byte = [0u8; 1];
        mmu.read(BASE, &mut byte).unwrap();

        fx.vm.frames().acquire(fx.vm.swap()).unwrap();
        assert!(a.lock().is_resident());
        assert!(!b.lock().is_resident());
        assert!(!mmu.is_accessed(BASE));
        assert_eq!(fx.vm.frames().stats().second_chances, 1);
    }

    /// Tests: [E3] every page accessed still terminates with a victim
    #[test]
    fn test_all_accessed_still_evicts() {
        let fx = fixture(3, 4);
        let mmu = Arc::new(SoftMmu::new());
        let pages: Vec<PageRef> = (0..3)
            .map(|i| resident(&fx, &mmu, BASE + i * PAGE_SIZE))
            .collect();
        let mut byte = [0u8; 1];
        for i in 0..3 {
            mmu.read(BASE + i * PAGE_SIZE, &mut byte).unwrap();
        }
        fx.vm.frames().acquire(fx.vm.swap()).unwrap();
        let resident_now = pages.iter().filter(|p| p.lock().is_resident()).count();
        assert_eq!(resident_now, 2);
    }

    /// Tests: [E6] locked pages are never victims
    #[test]
    fn test_busy_pages_are_skipped() {
        let fx = fixture(2, 4);
        let mmu = Arc::new(SoftMmu::new());
        let a = resident(&fx, &mmu, BASE);
        let b = resident(&fx, &mmu, BASE + PAGE_SIZE);

        let _held = a.lock();
        fx.vm.frames().acquire(fx.vm.swap()).unwrap();
        assert!(!b.lock().is_resident());

        let _held_b = b.lock();
        assert_eq!(
            fx.vm.frames().acquire(fx.vm.swap()).err(),
            Some(VmError::OutOfFrames)
        );
    }

    /// Tests: [E4] unowned frames are not evictable
    #[test]
    fn test_unowned_frames_are_skipped() {
        let fx = fixture(2, 4);
        fx.vm.frames().acquire(fx.vm.swap()).unwrap();
        fx.vm.frames().acquire(fx.vm.swap()).unwrap();
        assert_eq!(
            fx.vm.frames().acquire(fx.vm.swap()).err(),
            Some(VmError::OutOfFrames)
        );
    }

    /// Tests: [E8] swap full leaves the victim mapped and owned
    #[test]
    fn test_failed_eviction_restores_victim() {
        let fx = fixture(1, 0);
        let mmu = Arc::new(SoftMmu::new());
        let a = resident(&fx, &mmu, BASE);
        mmu.write(BASE, b"keep").unwrap();
        mmu.clear_accessed(BASE);

        let err = fx.vm.frames().acquire(fx.vm.swap()).err();
        assert_eq!(err, Some(VmError::Swap(crate::SwapError::Exhausted)));

        let id = a.lock().frame().unwrap();
        assert!(fx.vm.frames().is_owned_by(id, &a));
        let mut back = [0u8; 4];
        mmu.read(BASE, &mut back).unwrap();
        assert_eq!(&back, b"keep");
        assert_eq!(fx.vm.frames().stats().resident, 1);
    }

    #[test]
    fn test_ownership_is_mutual() {
        let fx = fixture(2, 2);
        let mmu = Arc::new(SoftMmu::new());
        let a = resident(&fx, &mmu, BASE);
        let b = resident(&fx, &mmu, BASE + PAGE_SIZE);
        let ia = a.lock().frame().unwrap();
        let ib = b.lock().frame().unwrap();
        assert!(fx.vm.frames().is_owned_by(ia, &a));
        assert!(!fx.vm.frames().is_owned_by(ia, &b));
        assert_eq!(fx.vm.frames().owner_va(ib), Some(BASE + PAGE_SIZE));
    }
}
