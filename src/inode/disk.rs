//! On-disk structures and the sector-pointer tree: resolution, growth, and
//! reclamation.
//!
//! Each inode addresses its data through three levels: a run of direct
//! pointers, one singly-indirect pointer, and one doubly-indirect pointer,
//! encoded with `zerocopy`'s `AsBytes`/`FromBytes` and pinned to exactly one
//! sector by a `static_assertions` check.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::BlockCache;
use crate::error::{BlockFsError, Result};
use crate::free_map::FreeMap;
use crate::param::{DIRECT_COUNT, INODE_MAGIC, MAX_FILE_SECTORS, PTRS_PER_SECTOR, SECTOR_SIZE};

/// The on-disk inode record. Must occupy exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct DiskInode {
    pub direct: [u32; DIRECT_COUNT],
    pub indirect: u32,
    pub doubly_indirect: u32,
    pub is_dir: u8,
    _reserved: [u8; 3],
    pub length: i32,
    pub magic: u32,
}

const_assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);

impl DiskInode {
    fn new(length: usize, is_dir: bool) -> Self {
        Self {
            length: length as i32,
            is_dir: u8::from(is_dir),
            magic: INODE_MAGIC,
            ..Default::default()
        }
    }

    /// A magic mismatch is a fatal structural error, not a recoverable
    /// `Result`.
    pub fn check_magic(&self) {
        assert_eq!(
            self.magic, INODE_MAGIC,
            "on-disk inode has a corrupt magic number (found {:#x}, expected {:#x})",
            self.magic, INODE_MAGIC
        );
    }
}

/// A sector whose payload is exactly [`PTRS_PER_SECTOR`] sector pointers.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct IndirectBlock {
    pub ptrs: [u32; PTRS_PER_SECTOR],
}

const_assert_eq!(core::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl Default for IndirectBlock {
    fn default() -> Self {
        Self {
            ptrs: [0; PTRS_PER_SECTOR],
        }
    }
}

/// A pointer field of `0` means "unallocated". This makes "is this pointer
/// live?" an explicit decision at every call site instead of an implicit
/// falsy check.
fn live(ptr: u32) -> Option<u32> {
    (ptr != 0).then_some(ptr)
}

fn sectors_for(length: usize) -> usize {
    (length + SECTOR_SIZE - 1) / SECTOR_SIZE
}

fn div_ceil(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

fn read_indirect(cache: &BlockCache, sector: u32) -> IndirectBlock {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, &mut buf);
    IndirectBlock::read_from(&buf[..]).expect("sector-sized buffer")
}

fn write_indirect(cache: &BlockCache, sector: u32, block: &IndirectBlock) {
    let mut buf = [0u8; SECTOR_SIZE];
    buf.copy_from_slice(block.as_bytes());
    cache.write(sector, &buf);
}

pub fn read_disk_inode(cache: &BlockCache, sector: u32) -> DiskInode {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, &mut buf);
    let disk = DiskInode::read_from(&buf[..]).expect("sector-sized buffer");
    disk.check_magic();
    disk
}

pub fn write_disk_inode(cache: &BlockCache, sector: u32, disk: &DiskInode) {
    let mut buf = [0u8; SECTOR_SIZE];
    buf.copy_from_slice(disk.as_bytes());
    cache.write(sector, &buf);
}

/// Resolves byte-offset `pos` to the device sector that holds it, or `None`
/// if no sector is allocated there (a hole, which growth never produces, or
/// an out-of-range index).
///
/// Uses two independent scratch buffers (`first`, `second`) when descending
/// the doubly-indirect tree, since a second cache read must not clobber a
/// first-level pointer the caller still needs.
pub fn resolve_sector(disk: &DiskInode, cache: &BlockCache, idx: usize) -> Option<u32> {
    if idx < DIRECT_COUNT {
        return live(disk.direct[idx]);
    }
    let idx = idx - DIRECT_COUNT;
    if idx < PTRS_PER_SECTOR {
        let indirect_sector = live(disk.indirect)?;
        let first = read_indirect(cache, indirect_sector);
        return live(first.ptrs[idx]);
    }
    let idx = idx - PTRS_PER_SECTOR;
    if idx < PTRS_PER_SECTOR * PTRS_PER_SECTOR {
        let di_sector = live(disk.doubly_indirect)?;
        let first = read_indirect(cache, di_sector);
        let first_idx = idx / PTRS_PER_SECTOR;
        let second_idx = idx % PTRS_PER_SECTOR;
        let second_sector = live(first.ptrs[first_idx])?;
        let second = read_indirect(cache, second_sector);
        return live(second.ptrs[second_idx]);
    }
    None
}

/// Ensures every sector needed to back `[0, length)` is allocated and its
/// on-disk pointer slot populated, zero-filling each newly-allocated data
/// sector. Used both at creation (from length 0) and at write-time growth.
///
/// Partial progress on a failed reserve is not rolled back: already
/// allocated sectors remain recorded in `disk`'s pointer tree and are
/// reclaimed whenever the inode is eventually removed.
pub fn reserve(
    disk: &mut DiskInode,
    length: usize,
    cache: &BlockCache,
    free_map: &dyn FreeMap,
) -> Result<()> {
    if length > MAX_FILE_SECTORS * SECTOR_SIZE {
        return Err(BlockFsError::FileTooLarge);
    }

    let mut remaining = sectors_for(length);

    let direct_n = remaining.min(DIRECT_COUNT);
    for slot in disk.direct.iter_mut().take(direct_n) {
        if *slot == 0 {
            let sector = free_map.allocate(1).ok_or(BlockFsError::FreeMapExhausted)?;
            cache.write(sector, &[0u8; SECTOR_SIZE]);
            *slot = sector;
        }
    }
    remaining -= direct_n;
    if remaining == 0 {
        return Ok(());
    }

    let indirect_n = remaining.min(PTRS_PER_SECTOR);
    reserve_indirect(&mut disk.indirect, indirect_n, 1, cache, free_map)?;
    remaining -= indirect_n;
    if remaining == 0 {
        return Ok(());
    }

    let doubly_n = remaining.min(PTRS_PER_SECTOR * PTRS_PER_SECTOR);
    reserve_indirect(&mut disk.doubly_indirect, doubly_n, 2, cache, free_map)?;
    remaining -= doubly_n;
    if remaining != 0 {
        return Err(BlockFsError::FileTooLarge);
    }
    Ok(())
}

fn reserve_indirect(
    p_entry: &mut u32,
    n: usize,
    level: u8,
    cache: &BlockCache,
    free_map: &dyn FreeMap,
) -> Result<()> {
    if level == 0 {
        if *p_entry == 0 {
            let sector = free_map.allocate(1).ok_or(BlockFsError::FreeMapExhausted)?;
            cache.write(sector, &[0u8; SECTOR_SIZE]);
            *p_entry = sector;
        }
        return Ok(());
    }

    if *p_entry == 0 {
        let sector = free_map.allocate(1).ok_or(BlockFsError::FreeMapExhausted)?;
        cache.write(sector, &[0u8; SECTOR_SIZE]);
        *p_entry = sector;
    }

    let mut block = read_indirect(cache, *p_entry);
    let unit = if level == 1 { 1 } else { PTRS_PER_SECTOR };
    let entries = div_ceil(n, unit);
    let mut remaining = n;
    for ptr in block.ptrs.iter_mut().take(entries) {
        let sub = remaining.min(unit);
        reserve_indirect(ptr, sub, level - 1, cache, free_map)?;
        remaining -= sub;
    }
    debug_assert_eq!(remaining, 0);
    write_indirect(cache, *p_entry, &block);
    Ok(())
}

/// Releases every sector a removed inode references — its data and
/// indirection sectors (not its own on-disk sector, which the caller frees
/// separately) — by a symmetric descent of the pointer tree.
///
/// Walks direct run, then singly-indirect, then doubly-indirect, releasing
/// each indirection sector only after all of its children are released.
pub fn deallocate(disk: &DiskInode, cache: &BlockCache, free_map: &dyn FreeMap) {
    let mut remaining = sectors_for(disk.length as usize);

    let direct_n = remaining.min(DIRECT_COUNT);
    for &sector in disk.direct.iter().take(direct_n) {
        free_map.release(sector, 1);
    }
    remaining -= direct_n;
    if remaining == 0 {
        return;
    }

    let indirect_n = remaining.min(PTRS_PER_SECTOR);
    deallocate_indirect(disk.indirect, indirect_n, 1, cache, free_map);
    remaining -= indirect_n;
    if remaining == 0 {
        return;
    }

    let doubly_n = remaining.min(PTRS_PER_SECTOR * PTRS_PER_SECTOR);
    deallocate_indirect(disk.doubly_indirect, doubly_n, 2, cache, free_map);
    remaining -= doubly_n;
    debug_assert_eq!(remaining, 0);
}

fn deallocate_indirect(entry: u32, n: usize, level: u8, cache: &BlockCache, free_map: &dyn FreeMap) {
    if level == 0 {
        free_map.release(entry, 1);
        return;
    }

    let block = read_indirect(cache, entry);
    let unit = if level == 1 { 1 } else { PTRS_PER_SECTOR };
    let entries = div_ceil(n, unit);
    let mut remaining = n;
    for &ptr in block.ptrs.iter().take(entries) {
        let sub = remaining.min(unit);
        deallocate_indirect(ptr, sub, level - 1, cache, free_map);
        remaining -= sub;
    }
    debug_assert_eq!(remaining, 0);
    free_map.release(entry, 1);
}

/// Builds a freshly-initialized, not-yet-grown disk inode for `create`.
pub(crate) fn new_disk_inode(length: usize, is_dir: bool) -> DiskInode {
    DiskInode::new(length, is_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::free_map::BitmapFreeMap;
    use std::sync::Arc;

    fn fixture(capacity: usize) -> (BlockCache, BitmapFreeMap) {
        let device = Arc::new(crate::device::MemDevice::new());
        (BlockCache::init(device, capacity), BitmapFreeMap::new(1024))
    }

    #[test]
    fn disk_inode_is_exactly_one_sector() {
        assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);
    }

    #[test]
    fn reserve_direct_only_allocates_and_zero_fills() {
        let (cache, free_map) = fixture(8);
        let mut disk = new_disk_inode(0, false);
        reserve(&mut disk, 3 * SECTOR_SIZE, &cache, &free_map).unwrap();
        for i in 0..3 {
            assert_ne!(disk.direct[i], 0);
        }
        assert_eq!(disk.direct[3], 0);

        let mut buf = [0xFFu8; SECTOR_SIZE];
        cache.read(disk.direct[0], &mut buf);
        assert_eq!(buf, [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn resolve_sector_crosses_indirect_boundary() {
        let (cache, free_map) = fixture(300);
        let mut disk = new_disk_inode(0, false);
        let length = (DIRECT_COUNT + 2) * SECTOR_SIZE;
        reserve(&mut disk, length, &cache, &free_map).unwrap();

        assert!(resolve_sector(&disk, &cache, DIRECT_COUNT - 1).is_some());
        assert!(resolve_sector(&disk, &cache, DIRECT_COUNT).is_some());
        assert!(resolve_sector(&disk, &cache, DIRECT_COUNT + 1).is_some());
        assert!(resolve_sector(&disk, &cache, DIRECT_COUNT + 2).is_none());
    }

    #[test]
    fn resolve_sector_crosses_doubly_indirect_boundary() {
        let (cache, free_map) = fixture(512);
        let mut disk = new_disk_inode(0, false);
        let boundary = DIRECT_COUNT + PTRS_PER_SECTOR;
        let length = (boundary + 1) * SECTOR_SIZE;
        reserve(&mut disk, length, &cache, &free_map).unwrap();

        assert!(resolve_sector(&disk, &cache, boundary - 1).is_some());
        assert!(resolve_sector(&disk, &cache, boundary).is_some());
    }

    #[test]
    fn reserve_past_maximum_size_fails() {
        let (cache, free_map) = fixture(4);
        let mut disk = new_disk_inode(0, false);
        let err = reserve(&mut disk, MAX_FILE_SECTORS * SECTOR_SIZE + 1, &cache, &free_map);
        assert_eq!(err, Err(BlockFsError::FileTooLarge));
    }

    #[test]
    fn deallocate_releases_every_referenced_sector() {
        let (cache, free_map) = fixture(512);
        let mut disk = new_disk_inode(0, false);
        let length = (DIRECT_COUNT + PTRS_PER_SECTOR + 5) * SECTOR_SIZE;
        reserve(&mut disk, length, &cache, &free_map).unwrap();
        disk.length = length as i32;

        let used_before = free_map.in_use_count();
        assert!(used_before > 1);
        deallocate(&disk, &cache, &free_map);
        // Only sector 0 (permanently reserved) remains in use.
        assert_eq!(free_map.in_use_count(), 1);
    }
}
