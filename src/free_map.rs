//! The free-sector map contract.
//!
//! Only an `allocate`/`release` contract is assumed; this core never asks
//! for more than one sector at a time.

use std::sync::Mutex;

/// A free-sector allocator.
pub trait FreeMap: Send + Sync {
    /// Reserves `n` contiguous sectors, returning the first sector number,
    /// or `None` on exhaustion.
    fn allocate(&self, n: u32) -> Option<u32>;

    /// Returns `n` contiguous sectors starting at `first` to the map.
    fn release(&self, first: u32, n: u32);
}

/// A bitmap-backed [`FreeMap`] test double. Sector 0 is reserved (never
/// handed out), so pointer field `0` is safely reserved as "unallocated"
/// everywhere a sector pointer is stored on disk.
pub struct BitmapFreeMap {
    bits: Mutex<Vec<bool>>,
}

impl BitmapFreeMap {
    pub fn new(capacity: usize) -> Self {
        let mut bits = vec![false; capacity];
        if !bits.is_empty() {
            bits[0] = true;
        }
        Self {
            bits: Mutex::new(bits),
        }
    }

    /// Number of sectors currently marked in-use, for test assertions.
    pub fn in_use_count(&self) -> usize {
        self.bits.lock().unwrap().iter().filter(|b| **b).count()
    }
}

impl FreeMap for BitmapFreeMap {
    fn allocate(&self, n: u32) -> Option<u32> {
        assert_eq!(n, 1, "this core only ever allocates one sector at a time");
        let mut bits = self.bits.lock().unwrap();
        let idx = bits.iter().position(|used| !used)?;
        bits[idx] = true;
        Some(idx as u32)
    }

    fn release(&self, first: u32, n: u32) {
        let mut bits = self.bits.lock().unwrap();
        for i in first..first + n {
            if let Some(slot) = bits.get_mut(i as usize) {
                *slot = false;
            }
        }
    }
}
