//! Fixed-capacity, fully-associative, write-back block cache with a
//! clock/second-chance eviction policy and a single coarse lock.
//!
//! The clock hand is kept as persistent subsystem state rather than reset
//! on every eviction call, so repeated misses sweep forward through the
//! slot array instead of always restarting from slot zero.

use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::device::BlockDevice;
use crate::param::SECTOR_SIZE;

/// One resident cache slot.
#[derive(Clone)]
struct CacheSlot {
    data: [u8; SECTOR_SIZE],
    sector: u32,
    /// `valid` => `sector` names a real device sector.
    valid: bool,
    /// `dirty` => `valid`; `data` differs from what is on the device.
    dirty: bool,
    /// Clock-algorithm reference bit.
    access: bool,
}

impl CacheSlot {
    const fn new() -> Self {
        Self {
            data: [0; SECTOR_SIZE],
            sector: 0,
            valid: false,
            dirty: false,
            access: false,
        }
    }
}

/// Point-in-time counters, purely observational.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

struct CacheInner {
    slots: Vec<CacheSlot>,
    /// Clock hand, persists across calls and advances monotonically modulo
    /// capacity.
    hand: usize,
    stats: CacheStats,
}

impl CacheInner {
    /// Finds a resident slot for `sector`, or `None` on a miss.
    fn find(&self, sector: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.valid && s.sector == sector)
    }

    /// Selects an eviction victim by the clock/second-chance algorithm,
    /// writing it back to `device` first if dirty, and returns its index.
    ///
    /// The first invalid slot encountered wins over any later evict
    /// candidate.
    fn evict(&mut self, device: &dyn BlockDevice) -> usize {
        let capacity = self.slots.len();
        loop {
            let idx = self.hand;
            if !self.slots[idx].valid {
                self.hand = (self.hand + 1) % capacity;
                return idx;
            }
            if self.slots[idx].access {
                self.slots[idx].access = false;
                self.hand = (self.hand + 1) % capacity;
                continue;
            }
            if self.slots[idx].dirty {
                trace!(
                    "cache: writeback slot {idx} (sector {}) before eviction",
                    self.slots[idx].sector
                );
                device.write(self.slots[idx].sector, &self.slots[idx].data);
                self.slots[idx].dirty = false;
                self.stats.writebacks += 1;
            }
            debug!("cache: evicting slot {idx} (sector {})", self.slots[idx].sector);
            self.slots[idx].valid = false;
            self.stats.evictions += 1;
            self.hand = (self.hand + 1) % capacity;
            return idx;
        }
    }

    /// Returns the index of a resident (possibly freshly filled) slot for
    /// `sector`, loading it from `device` on a miss.
    fn slot_for(&mut self, sector: u32, device: &dyn BlockDevice) -> usize {
        if let Some(idx) = self.find(sector) {
            self.stats.hits += 1;
            trace!("cache: hit on sector {sector} (slot {idx})");
            return idx;
        }
        self.stats.misses += 1;
        trace!("cache: miss on sector {sector}");
        let idx = self.evict(device);
        let slot = &mut self.slots[idx];
        slot.sector = sector;
        device.read(sector, &mut slot.data);
        slot.valid = true;
        idx
    }
}

/// A fixed-capacity write-back block cache sitting above a [`BlockDevice`].
///
/// One mutex protects the entire slot array and the clock hand; every
/// public operation takes and releases it, and no operation nests another
/// lock acquisition.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    /// Resets every slot to invalid and initializes the lock. Idempotent
    /// only before first use.
    pub fn init(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "a cache with zero slots can never hit");
        Self {
            device,
            inner: Mutex::new(CacheInner {
                slots: vec![CacheSlot::new(); capacity],
                hand: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Copies `SECTOR_SIZE` bytes of `sector` into `dst`.
    pub fn read(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE]) {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.slot_for(sector, self.device.as_ref());
        let slot = &mut inner.slots[idx];
        slot.access = true;
        dst.copy_from_slice(&slot.data);
    }

    /// Establishes a slot for `sector` (filling it from the device on a
    /// miss, even though the caller is about to overwrite it wholesale — a
    /// deliberate choice left unoptimized, not an oversight), then copies
    /// `src` into it and marks it dirty.
    pub fn write(&self, sector: u32, src: &[u8; SECTOR_SIZE]) {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.slot_for(sector, self.device.as_ref());
        let slot = &mut inner.slots[idx];
        slot.data.copy_from_slice(src);
        slot.dirty = true;
        slot.access = true;
    }

    /// Writes back every valid+dirty slot. Does not invalidate slots.
    ///
    /// Must be invoked exactly once on orderly shutdown; issuing cache
    /// operations afterward is a logic error.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        let mut flushed = 0u32;
        for slot in inner.slots.iter_mut() {
            if slot.valid && slot.dirty {
                self.device.write(slot.sector, &slot.data);
                slot.dirty = false;
                flushed += 1;
            }
        }
        inner.stats.writebacks += u64::from(flushed);
        debug!("cache: close flushed {flushed} dirty slot(s)");
        if flushed > 0 {
            warn!("cache: {flushed} slot(s) were dirty at shutdown");
        }
    }

    /// A snapshot of the cache's cumulative hit/miss/eviction/writeback
    /// counters, purely observational.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn cache(capacity: usize) -> BlockCache {
        BlockCache::init(Arc::new(MemDevice::new()), capacity)
    }

    #[test]
    fn write_then_read_round_trips() {
        let c = cache(4);
        let src = [0x42; SECTOR_SIZE];
        c.write(3, &src);
        let mut dst = [0u8; SECTOR_SIZE];
        c.read(3, &mut dst);
        assert_eq!(dst, src);
    }

    #[test]
    fn dirty_implies_valid_and_close_flushes() {
        let device = Arc::new(MemDevice::new());
        let c = BlockCache::init(device.clone(), 2);
        c.write(0, &[0xAA; SECTOR_SIZE]);
        c.write(1, &[0xBB; SECTOR_SIZE]);
        c.close();

        let mut out = [0u8; SECTOR_SIZE];
        device.read(0, &mut out);
        assert_eq!(out, [0xAA; SECTOR_SIZE]);
        device.read(1, &mut out);
        assert_eq!(out, [0xBB; SECTOR_SIZE]);
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        // Capacity 1: every second distinct sector forces an eviction.
        let device = Arc::new(MemDevice::new());
        let c = BlockCache::init(device.clone(), 1);
        c.write(0, &[1; SECTOR_SIZE]);
        c.write(1, &[2; SECTOR_SIZE]); // evicts sector 0, must write it back first

        let mut out = [0u8; SECTOR_SIZE];
        device.read(0, &mut out);
        assert_eq!(out, [1; SECTOR_SIZE], "evicted dirty slot must reach the device");

        let stats = c.stats();
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn sixty_fifth_distinct_sector_evicts_exactly_one_victim() {
        let device = Arc::new(MemDevice::new());
        let c = BlockCache::init(device.clone(), 64);
        for s in 0..64u32 {
            c.write(s, &[s as u8; SECTOR_SIZE]);
        }
        assert_eq!(c.stats().evictions, 0);

        c.write(64, &[0xFF; SECTOR_SIZE]);
        assert_eq!(c.stats().evictions, 1);

        // All previously written sectors are still individually readable
        // (one of them was evicted and must have been written back).
        for s in 0..64u32 {
            let mut out = [0u8; SECTOR_SIZE];
            device.read(s, &mut out);
            let mut via_cache = [0u8; SECTOR_SIZE];
            c.read(s, &mut via_cache);
            assert_eq!(via_cache, [s as u8; SECTOR_SIZE]);
        }
    }

    #[test]
    fn close_leaves_no_valid_slot_dirty() {
        let c = cache(4);
        c.write(0, &[1; SECTOR_SIZE]);
        c.write(1, &[2; SECTOR_SIZE]);
        c.close();
        // Re-closing is a no-op: nothing left dirty to flush.
        let before = c.stats().writebacks;
        c.close();
        assert_eq!(c.stats().writebacks, before);
    }
}
