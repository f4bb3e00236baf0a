//! Stateful open-file records over the on-disk inode structure.
//!
//! An inode describes a single unnamed file as an array of sector pointers
//! with three addressing levels (direct, singly-indirect, doubly-indirect).
//! All device I/O goes through the [`crate::cache::BlockCache`]; a
//! process-wide [`InodeRegistry`] keyed by device sector makes repeated
//! opens of the same sector alias to one in-memory object:
//!
//! ```text
//! ip = registry.open(sector)
//! ... ip.read_at / ip.write_at ...
//! ip.close()
//! ```
//!
//! Rather than relying on callers to serialize inode-level operations
//! themselves, the registry carries its own mutex, independent of the
//! cache's: the sector-to-record map is behind one `Mutex`, and each
//! in-memory inode's mutable fields (`open_count`, `deny_write_count`,
//! `removed`, `disk_copy`) live behind a mutex of their own, one per inode.

mod disk;

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use disk::DiskInode;

use crate::cache::BlockCache;
use crate::free_map::FreeMap;
use crate::param::SECTOR_SIZE;

struct InMemoryInodeState {
    open_count: u32,
    deny_write_count: u32,
    removed: bool,
    disk_copy: DiskInode,
}

struct InodeRecord {
    sector: u32,
    state: Mutex<InMemoryInodeState>,
}

struct RegistryInner {
    cache: Arc<BlockCache>,
    free_map: Arc<dyn FreeMap>,
    table: Mutex<HashMap<u32, Arc<InodeRecord>>>,
}

/// The process-wide open-inode registry.
///
/// Invariants: at most one record per device sector; a record leaves the
/// table exactly when its open count reaches zero.
#[derive(Clone)]
pub struct InodeRegistry(Arc<RegistryInner>);

impl InodeRegistry {
    /// Initializes an empty registry over `cache` and `free_map`.
    pub fn init(cache: Arc<BlockCache>, free_map: Arc<dyn FreeMap>) -> Self {
        Self(Arc::new(RegistryInner {
            cache,
            free_map,
            table: Mutex::new(HashMap::new()),
        }))
    }

    /// Allocates an on-disk inode of `length` bytes at `sector` (which the
    /// caller must have already obtained from the free map), reserving its
    /// backing sectors and stamping the structural magic. Returns `false` on
    /// any allocation failure.
    pub fn create(&self, sector: u32, length: usize, is_dir: bool) -> bool {
        let mut disk_copy = disk::new_disk_inode(length, is_dir);
        match disk::reserve(&mut disk_copy, length, self.0.cache.as_ref(), self.0.free_map.as_ref()) {
            Ok(()) => {
                disk::write_disk_inode(self.0.cache.as_ref(), sector, &disk_copy);
                debug!("inode: created sector {sector} ({length} bytes, is_dir={is_dir})");
                true
            }
            Err(err) => {
                debug!("inode: create sector {sector} failed: {err}");
                false
            }
        }
    }

    /// Opens `sector`, aliasing an existing in-memory inode if one is
    /// already resident, or loading it from disk otherwise.
    pub fn open(&self, sector: u32) -> Inode {
        let mut table = self.0.table.lock().unwrap();
        if let Some(record) = table.get(&sector) {
            record.state.lock().unwrap().open_count += 1;
            trace!("inode: aliased open of sector {sector}");
            return Inode {
                registry: self.0.clone(),
                record: record.clone(),
            };
        }

        let disk_copy = disk::read_disk_inode(self.0.cache.as_ref(), sector);
        let record = Arc::new(InodeRecord {
            sector,
            state: Mutex::new(InMemoryInodeState {
                open_count: 1,
                deny_write_count: 0,
                removed: false,
                disk_copy,
            }),
        });
        table.insert(sector, record.clone());
        trace!("inode: opened sector {sector}");
        Inode {
            registry: self.0.clone(),
            record,
        }
    }
}

/// An open in-memory inode handle.
///
/// Must be closed with [`Inode::close`] before the last handle to a given
/// sector is dropped; dropping one without closing it is a programming
/// error, caught by a panicking [`Drop`] impl rather than silently leaking
/// the open count.
pub struct Inode {
    registry: Arc<RegistryInner>,
    record: Arc<InodeRecord>,
}

impl Inode {
    /// Returns another handle to the same in-memory inode, incrementing the
    /// open count.
    pub fn reopen(&self) -> Inode {
        self.record.state.lock().unwrap().open_count += 1;
        Inode {
            registry: self.registry.clone(),
            record: self.record.clone(),
        }
    }

    /// This inode's device sector.
    pub fn inumber(&self) -> u32 {
        self.record.sector
    }

    /// The file's current length in bytes.
    pub fn length(&self) -> usize {
        self.record.state.lock().unwrap().disk_copy.length as usize
    }

    pub fn is_dir(&self) -> bool {
        self.record.state.lock().unwrap().disk_copy.is_dir != 0
    }

    /// Marks this inode to be reclaimed once its last opener closes it.
    pub fn remove(&self) {
        self.record.state.lock().unwrap().removed = true;
    }

    /// Disables writes through this opener. Each opener may deny at most
    /// once; violating that is a fatal programming error.
    pub fn deny_write(&self) {
        let mut state = self.record.state.lock().unwrap();
        state.deny_write_count += 1;
        assert!(
            state.deny_write_count <= state.open_count,
            "deny_write_count exceeded open_count"
        );
    }

    /// Re-enables writes previously denied by this opener.
    pub fn allow_write(&self) {
        let mut state = self.record.state.lock().unwrap();
        assert!(state.deny_write_count > 0, "allow_write without a matching deny_write");
        state.deny_write_count -= 1;
    }

    /// Copies up to `dst.len()` bytes starting at `offset` into `dst`,
    /// clamped to `[offset, length)`; returns the number of bytes actually
    /// read. Never modifies the file.
    pub fn read_at(&self, dst: &mut [u8], offset: usize) -> usize {
        let disk_copy = self.record.state.lock().unwrap().disk_copy;
        let length = disk_copy.length as usize;
        if offset >= length {
            return 0;
        }
        let mut size = dst.len().min(length - offset);
        let mut pos = offset;
        let mut done = 0usize;

        while size > 0 {
            let Some(sector) = disk::resolve_sector(&disk_copy, self.registry.cache.as_ref(), pos / SECTOR_SIZE)
            else {
                break;
            };
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = size.min(SECTOR_SIZE - sector_ofs);

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let dst_chunk: &mut [u8; SECTOR_SIZE] = (&mut dst[done..done + chunk]).try_into().unwrap();
                self.registry.cache.read(sector, dst_chunk);
            } else {
                let mut scratch = [0u8; SECTOR_SIZE];
                self.registry.cache.read(sector, &mut scratch);
                dst[done..done + chunk].copy_from_slice(&scratch[sector_ofs..sector_ofs + chunk]);
            }

            pos += chunk;
            done += chunk;
            size -= chunk;
        }
        done
    }

    /// Writes `src` starting at `offset`, growing the file first if
    /// `offset + src.len()` exceeds the current length. Returns 0 without
    /// writing if the inode is under a `deny_write` hold, or if growth
    /// fails.
    pub fn write_at(&self, src: &[u8], offset: usize) -> usize {
        {
            let state = self.record.state.lock().unwrap();
            if state.deny_write_count > 0 {
                return 0;
            }
        }

        let end = offset + src.len();
        {
            let mut state = self.record.state.lock().unwrap();
            let current_length = state.disk_copy.length as usize;
            if end > current_length {
                let sector = self.record.sector;
                match disk::reserve(
                    &mut state.disk_copy,
                    end,
                    self.registry.cache.as_ref(),
                    self.registry.free_map.as_ref(),
                ) {
                    Ok(()) => {
                        state.disk_copy.length = end as i32;
                        disk::write_disk_inode(self.registry.cache.as_ref(), sector, &state.disk_copy);
                        trace!("inode: grew sector {sector} to {end} bytes");
                    }
                    Err(err) => {
                        debug!("inode: grow of sector {sector} to {end} bytes failed: {err}");
                        return 0;
                    }
                }
            }
        }

        let disk_copy = self.record.state.lock().unwrap().disk_copy;
        let mut size = src.len();
        let mut pos = offset;
        let mut done = 0usize;

        while size > 0 {
            let sector = disk::resolve_sector(&disk_copy, self.registry.cache.as_ref(), pos / SECTOR_SIZE)
                .expect("write_at: sector must have been reserved by the growth step above");
            let sector_ofs = pos % SECTOR_SIZE;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = size.min(sector_left);

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let src_chunk: &[u8; SECTOR_SIZE] = (&src[done..done + chunk]).try_into().unwrap();
                self.registry.cache.write(sector, src_chunk);
            } else {
                let mut scratch = [0u8; SECTOR_SIZE];
                if sector_ofs > 0 || chunk < sector_left {
                    self.registry.cache.read(sector, &mut scratch);
                }
                scratch[sector_ofs..sector_ofs + chunk].copy_from_slice(&src[done..done + chunk]);
                self.registry.cache.write(sector, &scratch);
            }

            pos += chunk;
            done += chunk;
            size -= chunk;
        }
        done
    }

    /// Closes this handle. If it was the last opener, removes the inode
    /// from the registry; if the inode was marked [`Inode::remove`]d, also
    /// returns its own sector and every sector it references to the free
    /// map.
    pub fn close(self) {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never touched again, and its `Drop` impl (which
        // exists only to catch an *un*closed handle) never runs on it, so
        // each field below is moved out exactly once.
        let registry = unsafe { std::ptr::read(&this.registry) };
        let record = unsafe { std::ptr::read(&this.record) };

        let sector = record.sector;
        let reclaim = {
            let mut table = registry.table.lock().unwrap();
            let mut state = record.state.lock().unwrap();
            state.open_count -= 1;
            if state.open_count == 0 {
                table.remove(&sector);
                state.removed.then_some(state.disk_copy)
            } else {
                None
            }
        };

        if let Some(disk_copy) = reclaim {
            registry.free_map.release(sector, 1);
            disk::deallocate(&disk_copy, registry.cache.as_ref(), registry.free_map.as_ref());
            debug!("inode: reclaimed sector {sector} and its data sectors");
        } else {
            trace!("inode: closed a handle to sector {sector}");
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        panic!("Inode dropped without calling close() first");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::free_map::BitmapFreeMap;
    use crate::param::DIRECT_COUNT;

    fn registry(cache_capacity: usize) -> (InodeRegistry, Arc<BitmapFreeMap>) {
        let device = Arc::new(MemDevice::new());
        let cache = Arc::new(BlockCache::init(device, cache_capacity));
        let free_map = Arc::new(BitmapFreeMap::new(4096));
        let reg = InodeRegistry::init(cache, free_map.clone());
        (reg, free_map)
    }

    #[test]
    fn create_then_open_reports_length_and_is_dir() {
        let (reg, _free_map) = registry(64);
        assert!(reg.create(10, 4096, true));
        let ip = reg.open(10);
        assert_eq!(ip.length(), 4096);
        assert!(ip.is_dir());
        ip.close();
    }

    #[test]
    fn extend_across_direct_to_indirect_boundary() {
        let (reg, _free_map) = registry(300);
        assert!(reg.create(10, 0, false));
        let ip = reg.open(10);

        let at = (DIRECT_COUNT - 1) * SECTOR_SIZE;
        assert_eq!(ip.write_at(&[0xAB; SECTOR_SIZE], at), SECTOR_SIZE);
        let at2 = DIRECT_COUNT * SECTOR_SIZE;
        assert_eq!(ip.write_at(&[0xCD; SECTOR_SIZE], at2), SECTOR_SIZE);

        let mut out = [0u8; 2 * SECTOR_SIZE];
        assert_eq!(ip.read_at(&mut out, at), out.len());
        assert_eq!(&out[..SECTOR_SIZE], &[0xAB; SECTOR_SIZE][..]);
        assert_eq!(&out[SECTOR_SIZE..], &[0xCD; SECTOR_SIZE][..]);
        assert_eq!(ip.length(), (DIRECT_COUNT + 1) * SECTOR_SIZE);
        ip.close();
    }

    #[test]
    fn sparse_write_zero_fills_the_gap() {
        let (reg, _free_map) = registry(64);
        assert!(reg.create(5, 0, false));
        let ip = reg.open(5);

        assert_eq!(ip.write_at(b"abcd", 10_000), 4);

        let mut out = vec![0xFFu8; 10_004];
        assert_eq!(ip.read_at(&mut out, 0), 10_004);
        assert!(out[..10_000].iter().all(|&b| b == 0));
        assert_eq!(&out[10_000..10_004], b"abcd");
        assert_eq!(ip.length(), 10_004);
        ip.close();
    }

    #[test]
    fn removal_reclaims_all_blocks() {
        let (reg, free_map) = registry(512);
        assert!(reg.create(20, 200_000, false));
        let ip = reg.open(20);
        let before = free_map.in_use_count();
        ip.remove();
        ip.close();
        assert!(before > free_map.in_use_count());
        // Only sector 0 (permanently reserved) remains in use.
        assert_eq!(free_map.in_use_count(), 1);
    }

    #[test]
    fn deny_write_blocks_writes_until_allowed() {
        let (reg, _free_map) = registry(64);
        assert!(reg.create(1, 0, false));
        let ip = reg.open(1);

        ip.deny_write();
        assert_eq!(ip.write_at(b"hello", 0), 0);
        assert_eq!(ip.length(), 0);

        ip.allow_write();
        assert_eq!(ip.write_at(b"hello", 0), 5);
        ip.close();
    }

    #[test]
    fn aliased_open_shares_identity() {
        let (reg, _free_map) = registry(64);
        assert!(reg.create(30, 0, false));
        let a = reg.open(30);
        let b = reg.open(30);
        assert!(Arc::ptr_eq(&a.record, &b.record));

        a.write_at(b"hi", 0);
        let mut out = [0u8; 2];
        assert_eq!(b.read_at(&mut out, 0), 2);
        assert_eq!(&out, b"hi");

        a.close();
        b.close();
    }

    #[test]
    fn double_open_then_single_close_keeps_inode_live() {
        let (reg, _free_map) = registry(64);
        assert!(reg.create(40, 0, false));
        let a = reg.open(40);
        let b = a.reopen();
        assert_eq!(a.record.state.lock().unwrap().open_count, 2);
        a.close();
        // `b` is still a live handle; this must not panic.
        assert_eq!(b.length(), 0);
        b.close();
    }

    #[test]
    #[should_panic(expected = "dropped without calling close")]
    fn dropping_without_close_panics() {
        let (reg, _free_map) = registry(64);
        assert!(reg.create(50, 0, false));
        let ip = reg.open(50);
        drop(ip);
    }
}
