//! Block device error type and geometry.

use vmm_error::define_kernel_error;

/// Sector size in bytes.
pub const BLOCK_SIZE: usize = 512;

define_kernel_error! {
    /// Error codes in range 0x06xx (Block subsystem).
    pub enum BlockError(0x06) {
        /// Device not initialized
        NotInitialized = 0x01 [Invariant] => "Block device not initialized",
        /// Read operation failed
        ReadFailed = 0x02 [Io] => "Block read failed",
        /// Write operation failed
        WriteFailed = 0x03 [Io] => "Block write failed",
        /// Invalid buffer size
        InvalidBufferSize = 0x04 [Invariant] => "Invalid buffer size",
        /// Sector number past the end of the device
        OutOfRange = 0x05 [Invariant] => "Block out of range",
    }
}
