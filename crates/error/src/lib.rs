//! Kernel error handling infrastructure for the paging subsystem.
//!
//! Provides the `define_kernel_error!` macro for consistent error type definitions.
//! Every variant carries an [`ErrorClass`] so callers can tell a full swap
//! device apart from a corrupted frame table without matching on each variant.
//!
//! ## Usage
//!
//! ### Simple errors (no inner data)
//! ```ignore
//! define_kernel_error! {
//!     pub enum SwapError(0x0B) {
//!         Exhausted = 0x01 [Capacity] => "No free swap slot",
//!         SlotNotInUse = 0x02 [Invariant] => "Swap slot is not in use",
//!     }
//! }
//! ```
//!
//! ### Nested errors (with inner error type)
//! ```ignore
//! define_kernel_error! {
//!     pub enum VmError(0x0A) {
//!         // class inherited from the inner error
//!         Swap(SwapError) = 0x01 => "Swap operation failed",
//!         // class given explicitly
//!         Mmu(MmuError) = 0x02 [Invariant] => "Mapping installer failed",
//!     }
//! }
//! ```

#![no_std]

/// Coarse classification of a failure, deciding how far it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A bounded resource ran out (frames, swap slots). Fatal to the
    /// requesting operation, not to the subsystem.
    Capacity,
    /// Internal bookkeeping is inconsistent. The caller must abort.
    Invariant,
    /// The request itself was invalid; recoverable by the caller.
    User,
    /// A disk or file transfer failed.
    Io,
}

impl ErrorClass {
    /// Only broken invariants are unrecoverable.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Invariant)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::Invariant => "invariant",
            Self::User => "user",
            Self::Io => "io",
        }
    }
}

/// Macro to define a kernel error type with consistent handling.
///
/// Supports both simple variants and nested variants containing inner errors.
/// Simple variants must name their class; nested variants may omit it to
/// inherit the class of the wrapped error.
#[macro_export]
macro_rules! define_kernel_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal $([$class:ident])? => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Get numeric error code for debugging.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Get error name for logging.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }

            /// Get the failure class of this error.
            pub const fn class(&self) -> $crate::ErrorClass {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _inner) => {
                            $crate::define_kernel_error!(@class _inner $(($inner))? $([$class])?)
                        }
                    )*
                }
            }

            /// True when the error reports a broken invariant.
            pub const fn is_fatal(&self) -> bool {
                self.class().is_fatal()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_kernel_error!(@display_body self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };

    // Helper to generate patterns
    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    // Helper to resolve the class of a variant
    (@class $bind:ident ($inner:ty) [$class:ident]) => { $crate::ErrorClass::$class };
    (@class $bind:ident ($inner:ty)) => { $bind.class() };
    (@class $bind:ident [$class:ident]) => { $crate::ErrorClass::$class };

    // Helper to generate display bodies
    (@display_body $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display_body $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}
