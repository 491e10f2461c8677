//! Architecture-independent traits for the collaborators of the pager.
//!
//! TEAM_301: The VM core is written against these seams only. Real kernels
//! plug in their buddy allocator, page tables, disk driver and filesystem;
//! host tests plug in the implementations from [`crate::host`].

use alloc::sync::Arc;

use crate::block::BlockError;
use crate::file::FileError;
use crate::mmu::MmuError;

/// Trait for physical page allocation.
///
/// Addresses are kernel virtual addresses of 4KB frames, usable with
/// [`page_bytes_mut`](crate::mmu::page_bytes_mut).
pub trait PageAllocator: Send + Sync {
    /// Allocate a 4KB page, `None` when the pool is empty.
    fn alloc_page(&self) -> Option<usize>;
    /// Return a 4KB page to the pool.
    fn free_page(&self, kva: usize);
}

/// Per-address-space installer of user leaf mappings.
///
/// Implementations carry their own interior locking; every method takes
/// `&self` so the frame table can reach a victim's mapper while another
/// address space is faulting.
pub trait AddressMapper: Send + Sync {
    /// Map the 4KB page at `va` to physical address `pa`.
    /// Re-installing the same `pa` is a no-op.
    fn install(&self, va: usize, pa: usize, writable: bool) -> Result<(), MmuError>;

    /// Remove the mapping at `va`, reporting whether it had been written
    /// since it was installed. Unmapped addresses report `false`.
    fn invalidate(&self, va: usize) -> bool;

    /// Physical address currently mapped at `va`.
    fn translate(&self, va: usize) -> Option<usize>;

    /// True once the page at `va` has been written through this mapping.
    fn is_dirty(&self, va: usize) -> bool;

    /// True once the page at `va` has been touched through this mapping.
    fn is_accessed(&self, va: usize) -> bool;

    /// Clear the accessed bit for `va`.
    fn clear_accessed(&self, va: usize);
}

/// Sector-addressed backing store.
pub trait BlockDevice: Send + Sync {
    /// Number of [`BLOCK_SIZE`](crate::block::BLOCK_SIZE) sectors.
    fn block_count(&self) -> usize;

    /// Read one sector into `buf` (exactly one sector long).
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write one sector from `buf` (exactly one sector long).
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), BlockError>;
}

/// An open file usable as a page source.
pub trait FileHandle: Send + Sync {
    /// Current length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes at `offset`, returning the count read.
    /// Short counts only happen at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FileError>;

    /// Write up to `buf.len()` bytes at `offset`. Writes never extend the file.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FileError>;

    /// Open an independent handle on the same file, so the mapping
    /// outlives the caller closing its descriptor.
    fn reopen(&self) -> Result<Arc<dyn FileHandle>, FileError>;
}
