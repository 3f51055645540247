//! Block device interface.
//!
//! The filesystem core never touches a file handle directly; every sector
//! read or write goes through a [`BlockDevice`], which the block cache
//! (`cache.rs`) addresses by sector number. Two adapters ship with the
//! crate: [`StdBlockDevice`] over a real file, and [`MemBlockDevice`] for
//! tests.

use crate::{BLOCK_SIZE, DEFAULT_DISK_SIZE};

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErr {
    ReadError,
    WriteError,
}

/// Sector-granular random access device backing a FAT32 volume.
pub trait BlockDevice: Send + Sync {
    /// Total number of `BLOCK_SIZE`-byte sectors on the device.
    fn total_sectors(&self) -> u64;

    /// Read one 512-byte sector into `buf`.
    fn read_sector(&self, sector: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), DeviceErr>;

    /// Write one 512-byte sector from `buf`.
    fn write_sector(&self, sector: u64, buf: &[u8; BLOCK_SIZE]) -> Result<(), DeviceErr>;

    /// Read `count` contiguous sectors starting at `start` into `buf`.
    /// `buf.len()` must equal `count * BLOCK_SIZE`.
    fn read_sectors(&self, start: u64, count: u64, buf: &mut [u8]) -> Result<(), DeviceErr> {
        assert_eq!(buf.len(), count as usize * BLOCK_SIZE);
        for i in 0..count {
            let chunk_start = i as usize * BLOCK_SIZE;
            let chunk: &mut [u8; BLOCK_SIZE] = (&mut buf[chunk_start..chunk_start + BLOCK_SIZE])
                .try_into()
                .unwrap();
            self.read_sector(start + i, chunk)?;
        }
        Ok(())
    }

    /// Write `count` contiguous sectors starting at `start` from `buf`.
    /// `buf.len()` must equal `count * BLOCK_SIZE`.
    fn write_sectors(&self, start: u64, count: u64, buf: &[u8]) -> Result<(), DeviceErr> {
        assert_eq!(buf.len(), count as usize * BLOCK_SIZE);
        for i in 0..count {
            let chunk_start = i as usize * BLOCK_SIZE;
            let chunk: &[u8; BLOCK_SIZE] = (&buf[chunk_start..chunk_start + BLOCK_SIZE])
                .try_into()
                .unwrap();
            self.write_sector(start + i, chunk)?;
        }
        Ok(())
    }
}

/// File-backed block device. Opens an existing image, or creates and
/// zero-fills a new one to [`DEFAULT_DISK_SIZE`] bytes if `path` does not
/// exist yet.
pub struct StdBlockDevice {
    file: RwLock<File>,
    total_sectors: u64,
}

impl StdBlockDevice {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if !existed {
            file.set_len(DEFAULT_DISK_SIZE)?;
        }

        let total_sectors = file.metadata()?.len() / BLOCK_SIZE as u64;
        Ok(Self {
            file: RwLock::new(file),
            total_sectors,
        })
    }
}

impl BlockDevice for StdBlockDevice {
    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), DeviceErr> {
        let mut file = self.file.write().map_err(|_| DeviceErr::ReadError)?;
        file.seek(SeekFrom::Start(sector * BLOCK_SIZE as u64))
            .map_err(|_| DeviceErr::ReadError)?;
        file.read_exact(buf).map_err(|_| DeviceErr::ReadError)
    }

    fn write_sector(&self, sector: u64, buf: &[u8; BLOCK_SIZE]) -> Result<(), DeviceErr> {
        let mut file = self.file.write().map_err(|_| DeviceErr::WriteError)?;
        file.seek(SeekFrom::Start(sector * BLOCK_SIZE as u64))
            .map_err(|_| DeviceErr::WriteError)?;
        file.write_all(buf).map_err(|_| DeviceErr::WriteError)
    }
}

/// In-memory block device, for tests that should not touch the filesystem.
pub struct MemBlockDevice {
    data: RwLock<Vec<u8>>,
}

impl MemBlockDevice {
    pub fn new(total_sectors: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; total_sectors as usize * BLOCK_SIZE]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn total_sectors(&self) -> u64 {
        self.data.read().unwrap().len() as u64 / BLOCK_SIZE as u64
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), DeviceErr> {
        let data = self.data.read().map_err(|_| DeviceErr::ReadError)?;
        let start = sector as usize * BLOCK_SIZE;
        buf.copy_from_slice(&data[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8; BLOCK_SIZE]) -> Result<(), DeviceErr> {
        let mut data = self.data.write().map_err(|_| DeviceErr::WriteError)?;
        let start = sector as usize * BLOCK_SIZE;
        data[start..start + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips_a_sector() {
        let dev = MemBlockDevice::new(16);
        let mut buf = [0xAAu8; BLOCK_SIZE];
        dev.write_sector(3, &buf).unwrap();
        buf = [0u8; BLOCK_SIZE];
        dev.read_sector(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn std_device_creates_and_zero_fills() {
        let dir = std::env::temp_dir().join(format!("fat32core-test-{}", std::process::id()));
        let dev = StdBlockDevice::open(&dir).unwrap();
        assert_eq!(
            dev.total_sectors(),
            DEFAULT_DISK_SIZE / BLOCK_SIZE as u64
        );
        let mut buf = [0u8; BLOCK_SIZE];
        dev.read_sector(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        std::fs::remove_file(&dir).ok();
    }
}
