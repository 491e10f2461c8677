//! Memory-backed block device.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use vmm_utils::Mutex;

use crate::block::{BLOCK_SIZE, BlockError};
use crate::traits::BlockDevice;

/// Behaviors: [D1]-[D3]
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    block_count: usize,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl RamDisk {
    /// [D1] Zero-filled disk of `block_count` sectors
    pub fn new(block_count: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; block_count * BLOCK_SIZE]),
            block_count,
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make every following write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Sectors successfully written so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn range(&self, block_id: usize, len: usize) -> Result<core::ops::Range<usize>, BlockError> {
        if len != BLOCK_SIZE {
            return Err(BlockError::InvalidBufferSize);
        }
        if block_id >= self.block_count {
            return Err(BlockError::OutOfRange);
        }
        let start = block_id * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn block_count(&self) -> usize {
        self.block_count
    }

    /// [D2] Buffers must be exactly one sector and in range
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(block_id, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    /// [D3] Injected failures leave the sector untouched
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(block_id, buf.len())?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BlockError::WriteFailed);
        }
        self.data.lock()[range].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests: [D1] [D2] sector round trip and bounds
    #[test]
    fn test_sector_io() {
        let disk = RamDisk::new(4);
        let mut buf = [0u8; BLOCK_SIZE];
        disk.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        disk.write_block(3, &[9; BLOCK_SIZE]).unwrap();
        disk.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, [9; BLOCK_SIZE]);
        assert_eq!(disk.writes(), 1);

        assert_eq!(disk.read_block(4, &mut buf), Err(BlockError::OutOfRange));
        assert_eq!(
            disk.write_block(0, &[0; 16]),
            Err(BlockError::InvalidBufferSize)
        );
    }

    /// Tests: [D3] failure injection
    #[test]
    fn test_failed_write_keeps_old_data() {
        let disk = RamDisk::new(1);
        disk.write_block(0, &[1; BLOCK_SIZE]).unwrap();
        disk.set_fail_writes(true);
        assert_eq!(disk.write_block(0, &[2; BLOCK_SIZE]), Err(BlockError::WriteFailed));
        let mut buf = [0u8; BLOCK_SIZE];
        disk.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, [1; BLOCK_SIZE]);
    }
}
