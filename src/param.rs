//! Compile-time constants shared by the cache and inode layers.

/// Size in bytes of a single device sector.
pub const SECTOR_SIZE: usize = 512;

/// Sentinel sector number meaning "no sector" (all-ones).
pub const NONE: u32 = u32::MAX;

/// Number of direct pointers held inline in a [`crate::inode::DiskInode`].
pub const DIRECT_COUNT: usize = 123;

/// Number of sector pointers that fit in one indirect sector.
pub const PTRS_PER_SECTOR: usize = 128;

/// Maximum file length addressable by the direct/indirect/doubly-indirect tree.
pub const MAX_FILE_SECTORS: usize = DIRECT_COUNT + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// Maximum file length in bytes.
pub const MAX_FILE_SIZE: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// Structural sanity-check value stamped into every on-disk inode.
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Default capacity (slot count) of the block cache.
pub const DEFAULT_CACHE_SLOTS: usize = 64;
