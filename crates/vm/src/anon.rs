//! Anonymous pages: no file behind them, swap is the only backing store.

use vmm_hal::mmu::PAGE_SIZE;

use crate::error::VmError;
use crate::swap::{SwapSlot, SwapTable};

/// Behaviors: [A1]-[A4]
#[derive(Debug, Default)]
pub struct AnonPage {
    /// Set while the content lives in swap
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    /// [A1] Read back from the page's own slot, which stays allocated until
    /// [`release_slot`](Self::release_slot),
    /// [A2] a page that was never swapped out has nothing to read
    pub(crate) fn swap_in(
        &self,
        frame: &mut [u8; PAGE_SIZE],
        swap: &SwapTable,
    ) -> Result<(), VmError> {
        let Some(slot) = self.slot else {
            log::error!("[SWAP] swap-in of anonymous page with no slot");
            return Err(VmError::MissingSwapSlot);
        };
        swap.read(slot, frame)?;
        Ok(())
    }

    /// [A3] Write the frame to the lowest free slot and remember it
    pub(crate) fn swap_out(
        &mut self,
        frame: &[u8; PAGE_SIZE],
        swap: &SwapTable,
    ) -> Result<(), VmError> {
        if let Some(old) = self.slot {
            log::error!("[SWAP] page already owns slot {}", old.index());
            return Err(VmError::NotResident);
        }
        self.slot = Some(swap.swap_out(frame)?);
        Ok(())
    }

    /// [A4] Give the slot back, if any
    pub(crate) fn release_slot(&mut self, swap: &SwapTable) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if let Err(err) = swap.free(slot) {
            log::error!("[SWAP] releasing slot {}: {}", slot.index(), err);
        }
    }
}
