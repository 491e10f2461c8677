//! File handle error type.

use vmm_error::define_kernel_error;

define_kernel_error! {
    /// Error codes in range 0x07xx (File subsystem).
    pub enum FileError(0x07) {
        /// Read operation failed
        ReadFailed = 0x01 [Io] => "File read failed",
        /// Write operation failed
        WriteFailed = 0x02 [Io] => "File write failed",
        /// Could not open a second handle
        ReopenFailed = 0x03 [Io] => "File reopen failed",
    }
}
