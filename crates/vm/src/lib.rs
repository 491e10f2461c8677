//! TEAM_301: Demand-paged virtual memory for LevitateOS user processes.
//!
//! Pages are described lazily in a per-process [`SupplementalPageTable`] and
//! only get a physical frame on first fault. Frames are drawn from a bounded
//! pool; when it runs dry the [`FrameTable`] evicts a victim chosen by a clock
//! sweep, writing anonymous pages to swap and dirty file pages back to their
//! file.
//!
//! Two service objects exist:
//! - [`Vm`] is process-wide: frame table, swap table and configuration.
//! - [`AddressSpace`] is per process: its page table, its MMU handle and its
//!   file mappings.
//!
//! Lock order is page lock, then frame-table lock. The frame-table lock is
//! never held while waiting on a page and never across disk or file I/O.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod anon;
pub mod error;
pub mod fault;
pub mod file;
pub mod fork;
pub mod frame;
pub mod layout;
pub mod mmap;
pub mod page;
pub mod space;
pub mod spt;
pub mod swap;

use alloc::sync::Arc;

use vmm_hal::{BlockDevice, PageAllocator};

pub use error::{SwapError, VmError};
pub use fault::{FaultOutcome, PageFault};
pub use file::{FilePage, FileSlice};
pub use frame::{FrameId, FrameStats, FrameTable};
pub use page::{Page, PageInit, PageKind, PageLoader, PageRef, PageType};
pub use space::AddressSpace;
pub use spt::SupplementalPageTable;
pub use swap::{SwapSlot, SwapTable};

/// Run-time tunables of the address-space layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// First address that belongs to the kernel
    pub user_space_end: usize,
    /// Highest stack address (exclusive)
    pub stack_top: usize,
    /// How far below the stack pointer a fault still counts as stack growth
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_space_end: layout::USER_SPACE_END,
            stack_top: layout::STACK_TOP,
            max_stack_size: layout::MAX_STACK_SIZE,
        }
    }
}

impl VmConfig {
    /// Reject addresses in the null page or in kernel space.
    pub fn check_user_addr(&self, addr: usize) -> Result<(), VmError> {
        if addr < layout::PAGE_SIZE {
            return Err(VmError::NullAddress);
        }
        if addr >= self.user_space_end {
            return Err(VmError::KernelAddress);
        }
        Ok(())
    }
}

/// Process-wide paging services, built once at boot.
pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapTable,
}

impl Vm {
    pub fn new(
        config: VmConfig,
        allocator: Arc<dyn PageAllocator>,
        swap_device: Arc<dyn BlockDevice>,
    ) -> Arc<Self> {
        let swap = SwapTable::new(swap_device);
        log::info!(
            "[VM] paging up: {} swap slots, stack top {:#x}",
            swap.capacity(),
            config.stack_top
        );
        Arc::new(Self {
            config,
            frames: FrameTable::new(allocator),
            swap,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }
}
