//! Block cache and indexed-inode core of a teaching-grade file subsystem.
//!
//! Layers bottom to top: [`device`] (the raw sector contract), [`free_map`]
//! (the free-sector allocator contract), [`cache`] (a fixed-capacity
//! write-back block cache), and [`inode`] (the sector-pointer tree and the
//! open-inode registry built on top of it).

pub mod cache;
pub mod device;
pub mod error;
pub mod free_map;
pub mod inode;
pub mod param;

pub use cache::{BlockCache, CacheStats};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use error::{BlockFsError, Result};
pub use free_map::{BitmapFreeMap, FreeMap};
pub use inode::{Inode, InodeRegistry};
