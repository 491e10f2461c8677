//! Page descriptors and variant dispatch.
//!
//! A [`Page`] describes one virtual page of one address space. Every page is
//! born [`PageKind::Uninit`] and turns into its target variant the first time
//! it is populated. The three operations that differ per variant are
//! `load_into`, `evict` and `destroy`; they only move bytes between a frame and
//! the backing store. Frames, mappings and the frame table are handled by the
//! caller.

use alloc::sync::Arc;

use vmm_hal::mmu::PAGE_SIZE;
use vmm_utils::Mutex;

use crate::anon::AnonPage;
use crate::error::VmError;
use crate::file::{FilePage, FileSlice};
use crate::frame::FrameId;
use crate::swap::{SwapSlot, SwapTable};

/// Shared handle on a page descriptor. The lock serialises load, evict
/// and destroy of that page.
pub type PageRef = Arc<Mutex<Page>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Uninit,
    Anon,
    File,
}

/// Produces the initial content of a lazily loaded page.
pub trait PageLoader: Send + Sync {
    /// Fill the whole frame.
    fn load(&self, frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError>;
}

/// Deferred population of an uninitialised page: what to load and what the
/// page becomes afterwards.
#[derive(Clone)]
pub enum PageInit {
    /// Becomes anonymous. Zero-filled unless a loader is given.
    Anon { loader: Option<Arc<dyn PageLoader>> },
    /// Becomes file-backed over the given slice.
    File(FileSlice),
}

impl PageInit {
    /// Zero-filled anonymous page (stack, heap).
    pub fn zeroed() -> Self {
        Self::Anon { loader: None }
    }

    /// Anonymous page whose first content comes from `loader`.
    pub fn anon_with(loader: Arc<dyn PageLoader>) -> Self {
        Self::Anon {
            loader: Some(loader),
        }
    }

    /// The variant the page turns into.
    pub fn target(&self) -> PageType {
        match self {
            Self::Anon { .. } => PageType::Anon,
            Self::File(_) => PageType::File,
        }
    }

    fn load(&self, frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        match self {
            Self::Anon { loader: None } => {
                frame.fill(0);
                Ok(())
            }
            Self::Anon {
                loader: Some(loader),
            } => loader.load(frame),
            Self::File(slice) => slice.load(frame),
        }
    }

    fn materialize(&self) -> PageKind {
        match self {
            Self::Anon { .. } => PageKind::Anon(AnonPage::new()),
            Self::File(slice) => PageKind::File(FilePage::new(slice.clone())),
        }
    }
}

pub enum PageKind {
    Uninit(PageInit),
    Anon(AnonPage),
    File(FilePage),
}

/// Behaviors: [G1]-[G7]
pub struct Page {
    va: usize,
    writable: bool,
    pub(crate) kind: PageKind,
    pub(crate) frame: Option<FrameId>,
}

impl Page {
    pub(crate) fn new(va: usize, writable: bool, kind: PageKind) -> Self {
        Self {
            va,
            writable,
            kind,
            frame: None,
        }
    }

    pub(crate) fn uninit(va: usize, writable: bool, init: PageInit) -> Self {
        Self::new(va, writable, PageKind::Uninit(init))
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// [G1] Variant the page is or will become
    pub fn page_type(&self) -> PageType {
        match &self.kind {
            PageKind::Uninit(init) => init.target(),
            PageKind::Anon(_) => PageType::Anon,
            PageKind::File(_) => PageType::File,
        }
    }

    /// Variant right now, without looking through `Uninit`.
    pub fn current_type(&self) -> PageType {
        match &self.kind {
            PageKind::Uninit(_) => PageType::Uninit,
            PageKind::Anon(_) => PageType::Anon,
            PageKind::File(_) => PageType::File,
        }
    }

    /// Swap slot holding this page's content, if it is swapped out.
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match &self.kind {
            PageKind::Anon(anon) => anon.slot(),
            _ => None,
        }
    }

    /// File range behind the page, whether or not it was loaded yet.
    pub fn file_slice(&self) -> Option<&FileSlice> {
        match &self.kind {
            PageKind::Uninit(PageInit::File(slice)) => Some(slice),
            PageKind::File(file) => Some(file.slice()),
            _ => None,
        }
    }

    /// Fill `frame` with this page's content without changing the page.
    ///
    /// [G2] Uninit pages run their loader, [G3] a failed loader leaves the
    /// page untouched. Backing resources stay claimed until
    /// [`commit_load`](Self::commit_load), so a caller that fails to map the
    /// frame can simply drop it.
    pub(crate) fn load_into(
        &self,
        frame: &mut [u8; PAGE_SIZE],
        swap: &SwapTable,
    ) -> Result<(), VmError> {
        let result = match &self.kind {
            PageKind::Uninit(init) => init.load(frame),
            PageKind::Anon(anon) => anon.swap_in(frame, swap),
            PageKind::File(file) => file.swap_in(frame),
        };
        if let Err(err) = &result {
            log::warn!("[VM] loading {:#x} failed: {}", self.va, err);
        }
        result
    }

    /// The loaded frame is now mapped: [G2] Uninit pages switch to their
    /// target variant, [G7] anonymous pages give up their swap slot
    pub(crate) fn commit_load(&mut self, swap: &SwapTable) {
        let next = match &mut self.kind {
            PageKind::Uninit(init) => init.materialize(),
            PageKind::Anon(anon) => {
                anon.release_slot(swap);
                return;
            }
            PageKind::File(_) => return,
        };
        self.kind = next;
    }

    /// [G4] Move the frame's content to the backing store
    ///
    /// `dirty` is the mapping's dirty bit, sampled when the mapping was
    /// invalidated.
    pub(crate) fn evict(
        &mut self,
        frame: &[u8; PAGE_SIZE],
        dirty: bool,
        swap: &SwapTable,
    ) -> Result<(), VmError> {
        match &mut self.kind {
            PageKind::Anon(anon) => anon.swap_out(frame, swap),
            PageKind::File(file) => file.write_back(frame, dirty),
            PageKind::Uninit(_) => {
                log::error!("[VM] evicting uninitialised page {:#x}", self.va);
                Err(VmError::NotResident)
            }
        }
    }

    /// [G5] Release backing resources, writing back dirty file content,
    /// [G6] safe to call on a page that was already destroyed
    pub(crate) fn destroy(
        &mut self,
        frame: Option<&[u8; PAGE_SIZE]>,
        dirty: bool,
        swap: &SwapTable,
    ) -> Result<(), VmError> {
        match &mut self.kind {
            PageKind::Uninit(_) => Ok(()),
            PageKind::Anon(anon) => {
                anon.release_slot(swap);
                Ok(())
            }
            PageKind::File(file) => match frame {
                Some(bytes) => file.write_back(bytes, dirty),
                None => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixture;
    use vmm_hal::host::MemFile;

    fn populate(
        page: &mut Page,
        frame: &mut [u8; PAGE_SIZE],
        swap: &SwapTable,
    ) -> Result<(), VmError> {
        page.load_into(frame, swap)?;
        page.commit_load(swap);
        Ok(())
    }

    struct Pattern(u8);

    impl PageLoader for Pattern {
        fn load(&self, frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
            frame.fill(self.0);
            Ok(())
        }
    }

    struct Broken;

    impl PageLoader for Broken {
        fn load(&self, _frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
            Err(VmError::LoaderFailed)
        }
    }

    /// Tests: [G1] type query looks through uninit
    #[test]
    fn test_page_type() {
        let anon = Page::uninit(0x1000, true, PageInit::zeroed());
        assert_eq!(anon.page_type(), PageType::Anon);
        assert_eq!(anon.current_type(), PageType::Uninit);

        let file = MemFile::new(b"data");
        let slice = FileSlice::new(file.handle(), 0, 4, PAGE_SIZE - 4);
        let page = Page::uninit(0x2000, false, PageInit::File(slice));
        assert_eq!(page.page_type(), PageType::File);
        assert_eq!(page.file_slice().map(FileSlice::read_bytes), Some(4));
        assert!(anon.file_slice().is_none());
        assert!(!page.writable());
        assert!(!page.is_resident());
    }

    /// Tests: [G2] zero-fill and custom loader transitions
    #[test]
    fn test_populate_transitions_once() {
        let fx = fixture(1, 1);
        let mut frame = [0xFFu8; PAGE_SIZE];

        let mut page = Page::uninit(0x1000, true, PageInit::zeroed());
        populate(&mut page, &mut frame, fx.vm.swap()).unwrap();
        assert!(frame.iter().all(|&b| b == 0));
        assert_eq!(page.current_type(), PageType::Anon);
        assert_eq!(page.swap_slot(), None);

        let mut page = Page::uninit(0x2000, true, PageInit::anon_with(Arc::new(Pattern(7))));
        populate(&mut page, &mut frame, fx.vm.swap()).unwrap();
        assert!(frame.iter().all(|&b| b == 7));
        assert_eq!(page.current_type(), PageType::Anon);
    }

    /// Tests: [G3] failed loader
    #[test]
    fn test_failed_loader_keeps_uninit() {
        let fx = fixture(1, 1);
        let mut frame = [0u8; PAGE_SIZE];
        let mut page = Page::uninit(0x1000, true, PageInit::anon_with(Arc::new(Broken)));
        assert_eq!(
            populate(&mut page, &mut frame, fx.vm.swap()),
            Err(VmError::LoaderFailed)
        );
        assert_eq!(page.current_type(), PageType::Uninit);
    }

    /// Tests: [G4] anon eviction goes to swap and back
    #[test]
    fn test_anon_evict_round_trip() {
        let fx = fixture(1, 2);
        let swap = fx.vm.swap();
        let mut frame = [0u8; PAGE_SIZE];
        let mut page = Page::uninit(0x1000, true, PageInit::anon_with(Arc::new(Pattern(3))));
        populate(&mut page, &mut frame, swap).unwrap();

        page.evict(&frame, false, swap).unwrap();
        assert!(page.swap_slot().is_some());
        assert_eq!(swap.in_use(), 1);

        let mut back = [0u8; PAGE_SIZE];
        populate(&mut page, &mut back, swap).unwrap();
        assert_eq!(back, frame);
        assert_eq!(page.swap_slot(), None);
        assert_eq!(swap.in_use(), 0);
    }

    /// Tests: [G5] swapped anon page frees its slot, [G6] twice is harmless
    #[test]
    fn test_destroy_releases_slot() {
        let fx = fixture(1, 1);
        let swap = fx.vm.swap();
        let mut frame = [0u8; PAGE_SIZE];
        let mut page = Page::uninit(0x1000, true, PageInit::zeroed());
        populate(&mut page, &mut frame, swap).unwrap();
        page.evict(&frame, true, swap).unwrap();
        assert_eq!(swap.in_use(), 1);

        page.destroy(None, false, swap).unwrap();
        assert_eq!(swap.in_use(), 0);
        page.destroy(None, false, swap).unwrap();
        assert_eq!(swap.in_use(), 0);
    }

    /// Tests: [G7] the swap slot survives until the load is committed
    #[test]
    fn test_swap_slot_kept_until_commit() {
        let fx = fixture(1, 2);
        let swap = fx.vm.swap();
        let mut frame = [0u8; PAGE_SIZE];
        let mut page = Page::uninit(0x1000, true, PageInit::anon_with(Arc::new(Pattern(9))));
        populate(&mut page, &mut frame, swap).unwrap();
        page.evict(&frame, true, swap).unwrap();
        let slot = page.swap_slot();

        // A load whose mapping never got installed is simply dropped
        let mut scratch = [0u8; PAGE_SIZE];
        page.load_into(&mut scratch, swap).unwrap();
        assert_eq!(page.swap_slot(), slot);
        assert_eq!(swap.in_use(), 1);

        let mut back = [0u8; PAGE_SIZE];
        page.load_into(&mut back, swap).unwrap();
        page.commit_load(swap);
        assert!(back.iter().all(|&b| b == 9));
        assert_eq!(page.swap_slot(), None);
        assert_eq!(swap.in_use(), 0);
    }

    /// Tests: [G2] the variant switch happens on commit
    #[test]
    fn test_uninit_switches_on_commit() {
        let fx = fixture(1, 1);
        let mut frame = [0u8; PAGE_SIZE];
        let mut page = Page::uninit(0x1000, true, PageInit::zeroed());
        page.load_into(&mut frame, fx.vm.swap()).unwrap();
        assert_eq!(page.current_type(), PageType::Uninit);
        page.commit_load(fx.vm.swap());
        assert_eq!(page.current_type(), PageType::Anon);
    }

    #[test]
    fn test_evicting_uninit_is_invariant_error() {
        let fx = fixture(1, 1);
        let frame = [0u8; PAGE_SIZE];
        let mut page = Page::uninit(0x1000, true, PageInit::zeroed());
        let err = page.evict(&frame, false, fx.vm.swap()).err();
        assert_eq!(err, Some(VmError::NotResident));
        assert!(VmError::NotResident.is_fatal());
    }
}
