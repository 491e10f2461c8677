#![cfg_attr(not(any(test, feature = "std")), no_std)]

// TEAM_301: HAL for the demand pager.
// Root holds the collaborator traits, their error types and the frame pool.
// Host stand-ins for MMU, disk and files live in `host`.

extern crate alloc;

pub mod block;
pub mod file;
pub mod logger;
pub mod memory;
pub mod mmu;
pub mod traits;

#[cfg(any(test, feature = "std"))]
pub mod host;

pub use block::{BLOCK_SIZE, BlockError};
pub use file::FileError;
pub use memory::PagePool;
pub use mmu::{MmuError, PAGE_SIZE};
pub use traits::{AddressMapper, BlockDevice, FileHandle, PageAllocator};
