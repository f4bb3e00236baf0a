//! The raw block device contract.
//!
//! Device I/O is assumed infallible and synchronous; the cache is the sole
//! client of this trait.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use crate::param::SECTOR_SIZE;

/// A randomly addressable, sector-granular block device.
pub trait BlockDevice: Send + Sync {
    /// Copies `SECTOR_SIZE` bytes of sector `sector` into `dst`.
    fn read(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE]);

    /// Copies `SECTOR_SIZE` bytes from `src` into sector `sector`.
    fn write(&self, sector: u32, src: &[u8; SECTOR_SIZE]);

    /// Total number of addressable sectors, if known.
    fn sector_count(&self) -> u32 {
        u32::MAX
    }
}

/// An in-memory block device. Grows on demand as sectors beyond its current
/// length are touched, so tests never need to pre-size it.
pub struct MemDevice {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDevice {
    pub fn new() -> Self {
        Self {
            sectors: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; n]),
        }
    }
}

impl Default for MemDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for MemDevice {
    fn read(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock().unwrap();
        match sectors.get(sector as usize) {
            Some(s) => dst.copy_from_slice(s),
            None => dst.fill(0),
        }
    }

    fn write(&self, sector: u32, src: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock().unwrap();
        let idx = sector as usize;
        if idx >= sectors.len() {
            sectors.resize(idx + 1, [0u8; SECTOR_SIZE]);
        }
        sectors[idx] = *src;
    }

    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}

/// A block device backed by a single file on the host filesystem.
pub struct FileDevice {
    file: Mutex<File>,
}

impl FileDevice {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl BlockDevice for FileDevice {
    fn read(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE]) {
        let mut file = self.file.lock().unwrap();
        let offset = sector as u64 * SECTOR_SIZE as u64;
        if file.seek(SeekFrom::Start(offset)).is_err() {
            dst.fill(0);
            return;
        }
        if file.read_exact(dst).is_err() {
            dst.fill(0);
        }
    }

    fn write(&self, sector: u32, src: &[u8; SECTOR_SIZE]) {
        let mut file = self.file.lock().unwrap();
        let offset = sector as u64 * SECTOR_SIZE as u64;
        file.seek(SeekFrom::Start(offset))
            .expect("FileDevice::write: seek failed");
        file.write_all(src).expect("FileDevice::write: write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemDevice::new();
        let mut buf = [0xAB; SECTOR_SIZE];
        dev.write(7, &buf);
        let mut out = [0u8; SECTOR_SIZE];
        dev.read(7, &mut out);
        assert_eq!(out, buf);

        buf = [0; SECTOR_SIZE];
        dev.read(100, &mut out);
        assert_eq!(out, buf);
    }
}
