#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

// Re-export spin crate types as our lock API
// Note: spin::Mutex is re-exported as Mutex for API compatibility
pub use spin::{Lazy, Once};
pub use spin::{Mutex, MutexGuard};
pub use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// Re-export hashbrown collections
pub use hashbrown::{HashMap, HashSet};

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-size set of occupancy flags.
///
/// Used for the swap slot table: one bit per slot, lowest free index wins.
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// [M1] New bitmap has `len` bits, all clear
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// [M2] Out-of-range bits read as clear
    pub fn test(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Set or clear one bit, returning its previous value.
    /// [M3] Out-of-range writes are ignored and report `None`
    pub fn assign(&mut self, index: usize, value: bool) -> Option<bool> {
        if index >= self.len {
            return None;
        }
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        let old = *word & mask != 0;
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
        Some(old)
    }

    /// [M4] Lowest clear bit, or `None` when every bit is set
    pub fn first_clear(&self) -> Option<usize> {
        for (i, &word) in self.words.iter().enumerate() {
            if word != u64::MAX {
                let index = i * WORD_BITS + word.trailing_ones() as usize;
                // The last word may have clear padding bits past `len`
                return (index < self.len).then_some(index);
            }
        }
        None
    }

    /// [M5] Find the lowest clear bit and set it in one step
    pub fn claim_first_clear(&mut self) -> Option<usize> {
        let index = self.first_clear()?;
        self.assign(index, true);
        Some(index)
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
