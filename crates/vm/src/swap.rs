//! Swap slot manager.
//!
//! TEAM_301: The swap device is one contiguous region split into page-sized
//! slots; slot `i` occupies sectors `[i * 8, i * 8 + 8)`. Occupancy lives in a
//! bitmap behind a single lock. Slot I/O runs under that same lock, so two
//! allocations can never hand out the same slot and a slot is never reused
//! while its content is still being written.

use alloc::sync::Arc;

use vmm_hal::mmu::PAGE_SIZE;
use vmm_hal::{BLOCK_SIZE, BlockDevice};
use vmm_utils::{Bitmap, Mutex};

use crate::error::SwapError;
use crate::layout::SECTORS_PER_PAGE;

/// Index of one page-sized slot on the swap device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    /// First sector of this slot.
    pub const fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

/// Behaviors: [W1]-[W7]
pub struct SwapTable {
    device: Arc<dyn BlockDevice>,
    slots: Mutex<Bitmap>,
}

impl SwapTable {
    /// [W1] One slot per whole page of device capacity
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let capacity = device.block_count() / SECTORS_PER_PAGE;
        Self {
            device,
            slots: Mutex::new(Bitmap::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Slots currently holding a page.
    pub fn in_use(&self) -> usize {
        self.slots.lock().count_set()
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        self.slots.lock().test(slot.index())
    }

    /// [W2] Lowest free slot, marked occupied
    pub fn allocate(&self) -> Result<SwapSlot, SwapError> {
        self.slots
            .lock()
            .claim_first_clear()
            .map(SwapSlot)
            .ok_or(SwapError::Exhausted)
    }

    /// [W3] Clear occupancy, freeing twice is reported
    pub fn free(&self, slot: SwapSlot) -> Result<(), SwapError> {
        match self.slots.lock().assign(slot.index(), false) {
            Some(true) => Ok(()),
            Some(false) => Err(SwapError::SlotNotInUse),
            None => Err(SwapError::BadSlot),
        }
    }

    /// [W4] Read one page from a slot
    pub fn read(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), SwapError> {
        let slots = self.slots.lock();
        Self::check(&slots, slot)?;
        self.read_sectors(slot, buf)
    }

    /// [W4] Write one page into a slot
    pub fn write(&self, slot: SwapSlot, buf: &[u8; PAGE_SIZE]) -> Result<(), SwapError> {
        let slots = self.slots.lock();
        Self::check(&slots, slot)?;
        self.write_sectors(slot, buf)
    }

    /// [W5] Allocate and fill a slot in one step,
    /// [W6] the slot is given back if the write fails
    pub fn swap_out(&self, buf: &[u8; PAGE_SIZE]) -> Result<SwapSlot, SwapError> {
        let mut slots = self.slots.lock();
        let Some(index) = slots.claim_first_clear() else {
            log::warn!("[SWAP] all {} slots in use", slots.len());
            return Err(SwapError::Exhausted);
        };
        let slot = SwapSlot(index);
        if let Err(err) = self.write_sectors(slot, buf) {
            slots.assign(index, false);
            log::error!("[SWAP] write to slot {index} failed: {err}");
            return Err(err);
        }
        log::debug!("[SWAP] out -> slot {index}");
        Ok(slot)
    }

    /// [W7] Read a slot back and free it; on error the slot stays allocated
    pub fn swap_in(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), SwapError> {
        let mut slots = self.slots.lock();
        Self::check(&slots, slot)?;
        self.read_sectors(slot, buf)?;
        slots.assign(slot.index(), false);
        log::debug!("[SWAP] in <- slot {}", slot.index());
        Ok(())
    }

    fn check(slots: &Bitmap, slot: SwapSlot) -> Result<(), SwapError> {
        if slot.index() >= slots.len() {
            return Err(SwapError::BadSlot);
        }
        if !slots.test(slot.index()) {
            return Err(SwapError::SlotNotInUse);
        }
        Ok(())
    }

    fn read_sectors(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), SwapError> {
        for (i, chunk) in buf.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            self.device.read_block(slot.first_sector() + i, chunk)?;
        }
        Ok(())
    }

    fn write_sectors(&self, slot: SwapSlot, buf: &[u8; PAGE_SIZE]) -> Result<(), SwapError> {
        for (i, chunk) in buf.chunks_exact(BLOCK_SIZE).enumerate() {
            self.device.write_block(slot.first_sector() + i, chunk)?;
        }
        Ok(())
    }
}
