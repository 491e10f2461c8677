//! Page-granular address helpers and the page-table entry flags.
//!
//! TEAM_301: The VM core never walks page tables itself. It talks to an
//! [`AddressMapper`](crate::traits::AddressMapper) one 4KB leaf at a time and
//! reads frame contents through the kernel direct map via [`page_bytes_mut`].

use bitflags::bitflags;

use vmm_error::define_kernel_error;

define_kernel_error! {
    /// MMU error type with error codes (0x01xx).
    pub enum MmuError(0x01) {
        /// Page table allocation failed
        AllocationFailed = 0x01 [Capacity] => "Page table allocation failed",
        /// Address not mapped
        NotMapped = 0x02 [User] => "Address not mapped",
        /// Invalid virtual address
        InvalidVirtualAddress = 0x03 [User] => "Invalid virtual address",
        /// Address not properly aligned
        Misaligned = 0x04 [User] => "Address not properly aligned",
        /// A different frame is already installed at this address
        AlreadyMapped = 0x05 [Invariant] => "Address already mapped",
        /// Access violated the entry's permissions
        PermissionFault = 0x06 [User] => "Permission fault",
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Page size: 4KB
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of page size)
pub const PAGE_SHIFT: usize = 12;
/// Mask of the in-page offset bits
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Kernel virtual start address (Higher-half base)
pub const KERNEL_VIRT_START: usize = 0xFFFF_8000_0000_0000;

bitflags! {
    /// Leaf entry bits tracked per mapped user page.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Entry is valid
        const VALID = 1 << 0;
        /// Writable from user mode
        const WRITABLE = 1 << 1;
        /// Accessible from user mode
        const USER = 1 << 2;
        /// Set by hardware on any access
        const ACCESSED = 1 << 5;
        /// Set by hardware on write
        const DIRTY = 1 << 6;

        /// Read-only user page
        const USER_RO = Self::VALID.bits() | Self::USER.bits();
        /// Read-write user page
        const USER_RW = Self::USER_RO.bits() | Self::WRITABLE.bits();
    }
}

impl PageFlags {
    /// Leaf flags for a freshly installed user page.
    pub const fn user(writable: bool) -> Self {
        if writable { Self::USER_RW } else { Self::USER_RO }
    }
}

/// [M1] Round down to the containing page boundary
#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// [M2] Round up to the next page boundary, `None` on overflow
#[inline]
pub const fn page_align_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

/// [M3] True when `addr` sits on a page boundary
#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & PAGE_MASK == 0
}

/// Number of pages needed to cover `len` bytes.
#[inline]
pub const fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}

/// [M4] Converts high VA to PA, identity for low addresses and on host
#[inline]
pub fn virt_to_phys(va: usize) -> usize {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        if va >= KERNEL_VIRT_START {
            va - KERNEL_VIRT_START
        } else {
            va
        }
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        va
    }
}

/// [M5] Converts PA to the kernel direct-map VA, identity on host
#[inline]
pub fn phys_to_virt(pa: usize) -> usize {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        pa + KERNEL_VIRT_START
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        pa
    }
}

/// View one frame through its kernel virtual address.
///
/// # Safety
///
/// `kva` must be the page-aligned kernel address of a live frame handed out
/// by a [`PageAllocator`](crate::traits::PageAllocator), and the caller must
/// hold whatever lock makes it the frame's only writer for `'a`.
#[inline]
pub unsafe fn page_bytes_mut<'a>(kva: usize) -> &'a mut [u8; PAGE_SIZE] {
    &mut *(kva as *mut [u8; PAGE_SIZE])
}

/// Read-only view of one frame through its kernel virtual address.
///
/// # Safety
///
/// Same as [`page_bytes_mut`], except that other readers may coexist.
#[inline]
pub unsafe fn page_bytes<'a>(kva: usize) -> &'a [u8; PAGE_SIZE] {
    &*(kva as *const [u8; PAGE_SIZE])
}

// ============================================================================
// Unit Tests
// ============================================================================
