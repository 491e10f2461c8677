//! Error types for the pager.
//!
//! Classes follow the failure taxonomy: user errors reject one request,
//! capacity errors fail the operation that ran out, invariant errors mean the
//! bookkeeping is broken and the caller must abort.

use vmm_error::define_kernel_error;
use vmm_hal::{BlockError, FileError, MmuError};

define_kernel_error! {
    /// Swap error type with error codes (0x0Bxx).
    pub enum SwapError(0x0B) {
        /// Every slot is occupied
        Exhausted = 0x01 [Capacity] => "No free swap slot",
        /// Slot freed or read while not allocated
        SlotNotInUse = 0x02 [Invariant] => "Swap slot is not in use",
        /// Slot index past the end of the swap device
        BadSlot = 0x03 [Invariant] => "Swap slot out of range",
        /// Sector transfer failed
        Device(BlockError) = 0x04 => "Swap device error",
    }
}

define_kernel_error! {
    /// Virtual memory error type with error codes (0x0Axx).
    pub enum VmError(0x0A) {
        /// Address in the first page
        NullAddress = 0x01 [User] => "Null address",
        /// Address in kernel space
        KernelAddress = 0x02 [User] => "Kernel address",
        /// Address or offset not page aligned
        Misaligned = 0x03 [User] => "Address not page aligned",
        /// Mapping of zero bytes
        ZeroLength = 0x04 [User] => "Zero-length mapping",
        /// A page is already registered at the address
        AlreadyMapped = 0x05 [User] => "Address already mapped",
        /// No page or mapping at the address
        NotMapped = 0x06 [User] => "No mapping at address",
        /// Write to a read-only page, or a fault on a present page
        ProtectionViolation = 0x07 [User] => "Access violates page protection",
        /// Mapping a file with no content
        EmptyFile = 0x08 [User] => "Cannot map an empty file",
        /// Segment sizes do not cover whole pages
        BadSegment = 0x09 [User] => "Segment is not page sized",
        /// No free frame and no evictable victim
        OutOfFrames = 0x0A [Capacity] => "No frame available",
        /// A page expected to be resident has no frame
        NotResident = 0x0B [Invariant] => "Page is not resident",
        /// A swapped-out page has no slot recorded
        MissingSwapSlot = 0x0C [Invariant] => "Swapped page has no slot",
        /// Frame handle refers to a recycled slot
        StaleFrame = 0x0D [Invariant] => "Frame handle is stale",
        /// A deferred loader could not produce the page
        LoaderFailed = 0x0E [Io] => "Page loader failed",
        /// Swap operation failed
        Swap(SwapError) = 0x0F => "Swap operation failed",
        /// File read or write-back failed
        File(FileError) = 0x10 => "File transfer failed",
        /// Mapping installer rejected the page
        Mmu(MmuError) = 0x11 => "Mapping installer failed",
    }
}

impl From<SwapError> for VmError {
    fn from(err: SwapError) -> Self {
        Self::Swap(err)
    }
}

impl From<FileError> for VmError {
    fn from(err: FileError) -> Self {
        Self::File(err)
    }
}

impl From<MmuError> for VmError {
    fn from(err: MmuError) -> Self {
        Self::Mmu(err)
    }
}

impl From<BlockError> for SwapError {
    fn from(err: BlockError) -> Self {
        Self::Device(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_error::ErrorClass;

    #[test]
    fn test_error_codes() {
        assert_eq!(VmError::NullAddress.code(), 0x0A01);
        assert_eq!(SwapError::Exhausted.code(), 0x0B01);
        assert_eq!(VmError::Swap(SwapError::Exhausted).code(), 0x0A0F);
    }

    #[test]
    fn test_taxonomy() {
        assert_eq!(VmError::NotMapped.class(), ErrorClass::User);
        assert_eq!(VmError::OutOfFrames.class(), ErrorClass::Capacity);
        assert_eq!(
            VmError::Swap(SwapError::Exhausted).class(),
            ErrorClass::Capacity
        );
        assert!(VmError::Swap(SwapError::SlotNotInUse).is_fatal());
        assert!(VmError::MissingSwapSlot.is_fatal());
        // Installer failures keep their own class
        assert_eq!(
            VmError::Mmu(MmuError::AllocationFailed).class(),
            ErrorClass::Capacity
        );
        assert!(!VmError::Mmu(MmuError::NotMapped).is_fatal());
        assert!(VmError::Mmu(MmuError::AlreadyMapped).is_fatal());
        assert_eq!(
            VmError::File(FileError::WriteFailed).class(),
            ErrorClass::Io
        );
        assert_eq!(
            VmError::Swap(SwapError::Device(BlockError::WriteFailed)).class(),
            ErrorClass::Io
        );
    }

    #[test]
    fn test_display_nests_inner_error() {
        let err = VmError::from(SwapError::Exhausted);
        assert_eq!(
            std::format!("{err}"),
            "E0A0F: Swap operation failed (E0B01: No free swap slot)"
        );
    }
}
