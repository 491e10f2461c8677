//! In-memory file with shared contents across reopened handles.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use vmm_utils::Mutex;

use crate::file::FileError;
use crate::traits::FileHandle;

#[derive(Default)]
struct Shared {
    data: Mutex<Vec<u8>>,
    fail_io: AtomicBool,
    reopens: AtomicUsize,
}

/// Behaviors: [F1]-[F4]
#[derive(Clone, Default)]
pub struct MemFile {
    shared: Arc<Shared>,
}

impl MemFile {
    pub fn new(contents: &[u8]) -> Self {
        let file = Self::default();
        file.shared.data.lock().extend_from_slice(contents);
        file
    }

    /// A trait-object handle on this file.
    pub fn handle(&self) -> Arc<dyn FileHandle> {
        Arc::new(self.clone())
    }

    /// Snapshot of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.shared.data.lock().clone()
    }

    /// Make reads and writes fail until cleared.
    pub fn set_fail_io(&self, fail: bool) {
        self.shared.fail_io.store(fail, Ordering::SeqCst);
    }

    /// How many times any handle on this file was reopened.
    pub fn reopens(&self) -> usize {
        self.shared.reopens.load(Ordering::SeqCst)
    }

    fn failing(&self) -> bool {
        self.shared.fail_io.load(Ordering::SeqCst)
    }
}

impl FileHandle for MemFile {
    fn len(&self) -> u64 {
        self.shared.data.lock().len() as u64
    }

    /// [F1] Short reads at end of file
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FileError> {
        if self.failing() {
            return Err(FileError::ReadFailed);
        }
        let data = self.shared.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    /// [F2] Writes stop at end of file
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FileError> {
        if self.failing() {
            return Err(FileError::WriteFailed);
        }
        let mut data = self.shared.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    /// [F3] Reopened handles share contents, [F4] reopen is counted
    fn reopen(&self) -> Result<Arc<dyn FileHandle>, FileError> {
        self.shared.reopens.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle())
    }
}
