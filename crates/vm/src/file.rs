//! File-backed pages.
//!
//! A file page never touches swap: eviction and teardown write dirty content
//! back to the file, and a later fault reads it in again.

use alloc::sync::Arc;

use vmm_hal::FileHandle;
use vmm_hal::mmu::PAGE_SIZE;

use crate::error::VmError;
use crate::page::PageLoader;

/// A page-sized window of a file: `read_bytes` from `offset`, then
/// `zero_bytes` of zero fill.
#[derive(Clone)]
pub struct FileSlice {
    file: Arc<dyn FileHandle>,
    offset: u64,
    read_bytes: usize,
    zero_bytes: usize,
}

impl FileSlice {
    pub fn new(
        file: Arc<dyn FileHandle>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Self {
        Self {
            file,
            offset,
            read_bytes: read_bytes.min(PAGE_SIZE),
            zero_bytes: zero_bytes.min(PAGE_SIZE - read_bytes.min(PAGE_SIZE)),
        }
    }

    pub fn file(&self) -> &Arc<dyn FileHandle> {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn zero_bytes(&self) -> usize {
        self.zero_bytes
    }

    /// Read the file part and zero everything after it. Bytes past
    /// `read_bytes + zero_bytes` are zeroed too, the frame may be recycled.
    fn fill(&self, frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        let (head, tail) = frame.split_at_mut(self.read_bytes);
        let n = self.file.read_at(head, self.offset)?;
        if n != self.read_bytes {
            log::warn!(
                "[MMAP] short read at {:#x}: {} of {} bytes",
                self.offset,
                n,
                self.read_bytes
            );
            return Err(VmError::LoaderFailed);
        }
        tail.fill(0);
        Ok(())
    }
}

impl PageLoader for FileSlice {
    fn load(&self, frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        self.fill(frame)
    }
}

/// Behaviors: [B1]-[B4]
pub struct FilePage {
    slice: FileSlice,
    /// Content newer than the file that a failed write-back left behind
    pending_write: bool,
}

impl FilePage {
    pub fn new(slice: FileSlice) -> Self {
        Self {
            slice,
            pending_write: false,
        }
    }

    pub(crate) fn with_pending_write(slice: FileSlice, pending_write: bool) -> Self {
        Self {
            slice,
            pending_write,
        }
    }

    pub fn slice(&self) -> &FileSlice {
        &self.slice
    }

    /// True when the next eviction must write back even if the mapping is clean.
    pub fn pending_write(&self) -> bool {
        self.pending_write
    }

    /// [B1] Re-read the recorded range
    pub(crate) fn swap_in(&self, frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        self.slice.fill(frame)
    }

    /// [B2] Clean pages are dropped, [B3] dirty pages write `read_bytes` at
    /// `offset`, [B4] a failed write is retried on the next write-back
    pub(crate) fn write_back(
        &mut self,
        frame: &[u8; PAGE_SIZE],
        dirty: bool,
    ) -> Result<(), VmError> {
        if !dirty && !self.pending_write {
            return Ok(());
        }
        let len = self.slice.read_bytes;
        match self.slice.file.write_at(&frame[..len], self.slice.offset) {
            Ok(_) => {
                self.pending_write = false;
                log::trace!("[MMAP] wrote back {len} bytes at {:#x}", self.slice.offset);
                Ok(())
            }
            Err(err) => {
                self.pending_write = true;
                log::error!("[MMAP] write-back at {:#x} failed: {err}", self.slice.offset);
                Err(err.into())
            }
        }
    }
}
