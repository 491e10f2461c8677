//! Page fault resolution and stack growth.
//!
//! One pass per fault: validate the address, find or synthesise the page,
//! check permissions, give it a frame. The trap handler decodes the hardware
//! state into a [`PageFault`] and kills the thread on `Err`.

use vmm_hal::mmu::page_align_down;

use crate::error::VmError;
use crate::page::{PageInit, PageRef};
use crate::space::AddressSpace;

/// Decoded fault metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting virtual address
    pub addr: usize,
    /// The access was a write
    pub write: bool,
    /// No mapping was present (as opposed to a permission fault)
    pub not_present: bool,
    /// User stack pointer at the time of the fault
    pub stack_pointer: usize,
}

impl PageFault {
    /// Fault on an address with no mapping installed.
    pub fn missing(addr: usize, write: bool, stack_pointer: usize) -> Self {
        Self {
            addr,
            write,
            not_present: true,
            stack_pointer,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// An existing page was made resident
    Resolved,
    /// A new stack page was created and made resident
    StackGrown,
}

impl AddressSpace {
    /// Resolve a page fault.
    ///
    /// Behaviors:
    /// - [PF1] null and kernel addresses are rejected
    /// - [PF2] faults on present mappings are protection faults
    /// - [PF3] an unknown address inside the stack window grows the stack
    /// - [PF4] any other unknown address is a segmentation fault
    /// - [PF5] writes to read-only pages are rejected
    /// - [PF6] a page another thread already brought in is just re-mapped
    pub fn handle_fault(&self, fault: &PageFault) -> Result<FaultOutcome, VmError> {
        let result = self.resolve(fault);
        match &result {
            Ok(outcome) => log::trace!("[FAULT] {:#x} {:?}", fault.addr, outcome),
            Err(err) if err.is_fatal() => {
                log::error!("[FAULT] {:#x}: {}", fault.addr, err);
            }
            Err(err) => log::warn!(
                "[FAULT] rejected {} at {:#x}: {}",
                if fault.write { "write" } else { "read" },
                fault.addr,
                err
            ),
        }
        result
    }

    fn resolve(&self, fault: &PageFault) -> Result<FaultOutcome, VmError> {
        // [PF1]
        self.vm.config().check_user_addr(fault.addr)?;
        // [PF2] no copy-on-write: a present mapping never needs fixing up
        if !fault.not_present {
            return Err(VmError::ProtectionViolation);
        }

        let va = page_align_down(fault.addr);
        let (page, outcome) = match self.spt.find(va) {
            Some(page) => (page, FaultOutcome::Resolved),
            None if self.is_stack_growth(fault) => self.grow_stack(va)?, // [PF3]
            None => return Err(VmError::NotMapped),                      // [PF4]
        };

        let mut guard = page.lock();
        // [PF5]
        if fault.write && !guard.writable() {
            return Err(VmError::ProtectionViolation);
        }
        // [PF6] handled inside claim_locked
        self.claim_locked(&page, &mut guard)?;
        Ok(outcome)
    }

    /// Faults between `max_stack_size` below the stack pointer and the top
    /// of the stack count as stack growth.
    fn is_stack_growth(&self, fault: &PageFault) -> bool {
        let config = self.vm.config();
        let floor = fault.stack_pointer.saturating_sub(config.max_stack_size);
        floor <= fault.addr && fault.addr < config.stack_top
    }

    fn grow_stack(&self, va: usize) -> Result<(PageRef, FaultOutcome), VmError> {
        match self.create_page(va, true, PageInit::zeroed()) {
            Ok(page) => {
                log::debug!("[FAULT] stack grown to {va:#x}");
                Ok((page, FaultOutcome::StackGrown))
            }
            // Another thread grew the same page first
            Err(VmError::AlreadyMapped) => self
                .spt
                .find(va)
                .map(|page| (page, FaultOutcome::Resolved))
                .ok_or(VmError::NotMapped),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;
    use alloc::sync::Arc;
    use vmm_hal::mmu::PAGE_SIZE;
    use crate::testutil::fixture;
    use vmm_hal::AddressMapper;
    use vmm_hal::host::MemFile;

    const VA: usize = 0x40_0000;

    /// Tests: [PF1] null and kernel addresses
    #[test]
    fn test_rejects_bad_addresses() {
        let fx = fixture(1, 1);
        let (space, _) = fx.space();
        let sp = fx.vm.config().stack_top;
        assert_eq!(
            space.handle_fault(&PageFault::missing(0, false, sp)),
            Err(VmError::NullAddress)
        );
        assert_eq!(
            space.handle_fault(&PageFault::missing(0x10, true, sp)),
            Err(VmError::NullAddress)
        );
        assert_eq!(
            space.handle_fault(&PageFault::missing(usize::MAX, false, sp)),
            Err(VmError::KernelAddress)
        );
    }

    /// Tests: [PF2] protection fault on present page
    #[test]
    fn test_protection_fault_is_rejected() {
        let fx = fixture(1, 1);
        let (space, _) = fx.space();
        space.create_page(VA, false, PageInit::zeroed()).unwrap();
        let fault = PageFault {
            addr: VA,
            write: true,
            not_present: false,
            stack_pointer: 0,
        };
        assert_eq!(
            space.handle_fault(&fault),
            Err(VmError::ProtectionViolation)
        );
    }

    /// Tests: [PF4] unknown address, [PF5] write to read-only page
    #[test]
    fn test_segfault_and_read_only() {
        let fx = fixture(1, 1);
        let (space, mmu) = fx.space();
        let sp = fx.vm.config().stack_top;
        assert_eq!(
            space.handle_fault(&PageFault::missing(VA, false, sp)),
            Err(VmError::NotMapped)
        );

        space.create_page(VA, false, PageInit::zeroed()).unwrap();
        assert_eq!(
            space.handle_fault(&PageFault::missing(VA + 8, true, sp)),
            Err(VmError::ProtectionViolation)
        );
        assert_eq!(mmu.translate(VA), None);
        assert_eq!(
            space.handle_fault(&PageFault::missing(VA + 8, false, sp)),
            Ok(FaultOutcome::Resolved)
        );
        assert!(mmu.translate(VA).is_some());
    }

    /// Tests: [PF3] stack window
    #[test]
    fn test_stack_growth_window() {
        let fx = fixture(2, 1);
        let (space, _) = fx.space();
        let config = *fx.vm.config();
        let sp = config.stack_top - 4 * PAGE_SIZE;

        let near = sp - 64;
        assert_eq!(
            space.handle_fault(&PageFault::missing(near, true, sp)),
            Ok(FaultOutcome::StackGrown)
        );
        let page = space.find_page(near).unwrap();
        assert!(page.lock().writable());
        assert_eq!(page.lock().page_type(), PageType::Anon);

        let deepest = sp - config.max_stack_size;
        assert_eq!(
            space.handle_fault(&PageFault::missing(deepest, false, sp)),
            Ok(FaultOutcome::StackGrown)
        );
        assert_eq!(
            space.handle_fault(&PageFault::missing(deepest - PAGE_SIZE, false, sp)),
            Err(VmError::NotMapped)
        );
        // At or above the top is not stack
        assert_eq!(
            space.handle_fault(&PageFault::missing(config.stack_top, false, sp)),
            Err(VmError::NotMapped)
        );
    }

    /// Tests: [PF6] fault on a page that is already resident
    #[test]
    fn test_resident_page_is_remapped() {
        let fx = fixture(1, 1);
        let (space, mmu) = fx.space();
        space.create_page(VA, true, PageInit::zeroed()).unwrap();
        space.claim(VA).unwrap();
        let pa = mmu.translate(VA);

        assert_eq!(
            space.handle_fault(&PageFault::missing(VA, false, 0)),
            Ok(FaultOutcome::Resolved)
        );
        assert_eq!(mmu.translate(VA), pa);
        assert_eq!(fx.vm.frames().stats().resident, 1);
    }

    #[test]
    fn test_loader_failure_leaves_table_intact() {
        let fx = fixture(1, 1);
        let (space, _) = fx.space();
        let file = MemFile::new(b"short");
        let slice = crate::FileSlice::new(file.handle(), 0, 100, PAGE_SIZE - 100);
        space
            .create_page(VA, true, PageInit::anon_with(Arc::new(slice)))
            .unwrap();

        assert_eq!(
            space.handle_fault(&PageFault::missing(VA, false, 0)),
            Err(VmError::LoaderFailed)
        );
        assert!(space.find_page(VA).is_some());
        assert_eq!(fx.pool.free_count(), 1);
    }
}
