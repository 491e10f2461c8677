//! Shared harness for the paging integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use vmm::layout::SECTORS_PER_PAGE;
use vmm::{AddressSpace, PageFault, Vm, VmConfig, VmError};
use vmm_hal::PagePool;
use vmm_hal::host::{RamDisk, SoftMmu};

pub use vmm_hal::mmu::PAGE_SIZE;

/// Base of the heap-like region the tests populate.
pub const HEAP: usize = 0x1000_0000;

pub struct TestEnv {
    pub vm: Arc<Vm>,
    pub pool: Arc<PagePool>,
    pub disk: Arc<RamDisk>,
}

/// One process: its address space and the MMU it runs on.
pub struct Process {
    pub space: AddressSpace,
    pub mmu: Arc<SoftMmu>,
}

impl TestEnv {
    /// `frames` physical pages and `swap_pages` pages of swap.
    pub fn new(frames: usize, swap_pages: usize) -> Self {
        vmm_hal::logger::init(log::LevelFilter::Warn);
        let pool = Arc::new(PagePool::new(frames));
        let disk = Arc::new(RamDisk::new(swap_pages * SECTORS_PER_PAGE));
        let vm = Vm::new(VmConfig::default(), pool.clone(), disk.clone());
        Self { vm, pool, disk }
    }

    pub fn process(&self) -> Process {
        let mmu = Arc::new(SoftMmu::new());
        Process {
            space: AddressSpace::new(self.vm.clone(), mmu.clone()),
            mmu,
        }
    }
}

impl Process {
    /// Fork into a fresh MMU.
    pub fn fork(&self) -> Result<Process, VmError> {
        let mmu = Arc::new(SoftMmu::new());
        let space = self.space.fork(mmu.clone())?;
        Ok(Process { space, mmu })
    }

    /// Fault `va` in until the access succeeds, like a CPU retrying the
    /// instruction after the handler returns.
    fn access<F>(&self, va: usize, write: bool, mut op: F) -> Result<(), VmError>
    where
        F: FnMut(&SoftMmu) -> bool,
    {
        let sp = self.space.vm().config().stack_top;
        for _ in 0..64 {
            if op(&self.mmu) {
                return Ok(());
            }
            self.space.handle_fault(&PageFault::missing(va, write, sp))?;
        }
        assert!(op(&self.mmu), "access at {va:#x} never succeeded");
        Ok(())
    }

    pub fn read(&self, va: usize, buf: &mut [u8]) -> Result<(), VmError> {
        self.access(va, false, |mmu| mmu.read(va, buf).is_ok())
    }

    pub fn write(&self, va: usize, data: &[u8]) -> Result<(), VmError> {
        self.access(va, true, |mmu| mmu.write(va, data).is_ok())
    }

    pub fn read_u64(&self, va: usize) -> Result<u64, VmError> {
        let mut buf = [0u8; 8];
        self.read(va, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, va: usize, value: u64) -> Result<(), VmError> {
        self.write(va, &value.to_le_bytes())
    }
}

/// Distinct, recognisable content for page `i`.
pub fn pattern(i: usize) -> u64 {
    0xC0DE_0000_0000_0000 | i as u64
}
