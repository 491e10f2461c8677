//! User address space layout constants.

pub use vmm_hal::mmu::{PAGE_SHIFT, PAGE_SIZE};

use vmm_hal::BLOCK_SIZE;

/// End of user address space (exclusive).
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// Stack grows down from here.
pub const STACK_TOP: usize = 0x0000_7FFF_FFFF_0000;

/// Faults up to this far below the stack pointer grow the stack (1MB).
pub const MAX_STACK_SIZE: usize = 1 << 20;

/// Disk sectors backing one swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;
