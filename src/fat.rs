//! FAT cache and cluster-chain allocator.
//!
//! Unlike a driver that re-reads FAT sectors on every step of a chain walk,
//! this implementation loads the whole primary FAT into memory once at
//! mount and mirrors every write to all FAT copies. That trades a larger
//! resident footprint for O(1) next-cluster lookups and a much simpler
//! allocator, which suits the single-mount, interactive workload this
//! filesystem serves.

use crate::bpb::BIOSParameterBlock;
use crate::cache::{get_block_cache, Cache};
use crate::device::BlockDevice;
use crate::{read_le_u32, BAD_CLUSTER, BLOCK_SIZE, END_CLUSTER, END_OF_CLUSTER, FREE_CLUSTER};

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatError {
    ReadError,
    WriteError,
    OutOfSpace,
    ClusterOutOfRange,
}

pub struct FatTable {
    device: Arc<dyn BlockDevice>,
    /// Sector number of each FAT copy's first sector.
    fat_sectors: Vec<u64>,
    sectors_per_fat: u64,
    /// Dense cache, one u32 per cluster index (including the two reserved
    /// entries at 0 and 1). Sized to the whole FAT region, which is usually
    /// somewhat larger than `data_cluster_count + 2` because a FAT sector
    /// holds a whole number of 4-byte entries; `data_cluster_count` is the
    /// logical bound every scan/allocation must respect instead.
    entries: Vec<u32>,
    /// Number of clusters actually backed by data sectors, i.e.
    /// `bpb.data_cluster_cnt()`. Valid cluster numbers are `[2, data_cluster_count + 2)`.
    data_cluster_count: u32,
}

impl FatTable {
    /// Load the primary FAT (sectors starting at `fat_sectors[0]`) into
    /// memory.
    pub fn load(bpb: &BIOSParameterBlock, device: Arc<dyn BlockDevice>) -> Result<Self, FatError> {
        let sectors_per_fat = bpb.fat_sectors() as u64;
        let fat_sectors: Vec<u64> = (0..bpb.fat_count() as u64)
            .map(|n| bpb.fat_sector(n as usize))
            .collect();

        let entries_per_sector = BLOCK_SIZE / 4;
        let mut entries = Vec::with_capacity(sectors_per_fat as usize * entries_per_sector);

        let mut buf = [0u8; BLOCK_SIZE];
        for i in 0..sectors_per_fat {
            device
                .read_sector(fat_sectors[0] + i, &mut buf)
                .map_err(|_| FatError::ReadError)?;
            for chunk in buf.chunks_exact(4) {
                entries.push(read_le_u32(chunk));
            }
        }

        Ok(Self {
            device,
            fat_sectors,
            sectors_per_fat,
            entries,
            data_cluster_count: bpb.data_cluster_cnt() as u32,
        })
    }

    /// Build a fresh FAT for a newly formatted volume: cluster 0 carries the
    /// media byte, cluster 1 and the root cluster are end-of-chain, and
    /// every other entry is free.
    pub fn format(bpb: &BIOSParameterBlock, device: Arc<dyn BlockDevice>) -> Result<Self, FatError> {
        let sectors_per_fat = bpb.fat_sectors() as u64;
        let fat_sectors: Vec<u64> = (0..bpb.fat_count() as u64)
            .map(|n| bpb.fat_sector(n as usize))
            .collect();
        let entries_per_sector = BLOCK_SIZE / 4;
        let total_entries = sectors_per_fat as usize * entries_per_sector;

        let mut entries = vec![FREE_CLUSTER; total_entries];
        entries[0] = 0x0FFF_FF00 | bpb.media() as u32;
        entries[1] = END_OF_CLUSTER;
        entries[bpb.root_cluster() as usize] = END_OF_CLUSTER;

        let table = Self {
            device,
            fat_sectors,
            sectors_per_fat,
            entries,
            data_cluster_count: bpb.data_cluster_cnt() as u32,
        };
        table.persist()?;
        Ok(table)
    }

    /// Logical cluster count, i.e. `data_cluster_count + 2`: the exclusive
    /// upper bound of valid cluster numbers. This can be smaller than
    /// `entries.len()`, which is merely the FAT region's sector-rounded
    /// capacity.
    pub fn cluster_count(&self) -> u32 {
        self.data_cluster_count + 2
    }

    fn in_range(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.cluster_count() && (cluster as usize) < self.entries.len()
    }

    /// Value stored at `cluster`, masked to the meaningful 28 bits.
    pub fn next_cluster(&self, cluster: u32) -> u32 {
        if !self.in_range(cluster) {
            return END_OF_CLUSTER;
        }
        self.entries[cluster as usize] & 0x0FFF_FFFF
    }

    pub fn is_end_of_chain(value: u32) -> bool {
        value >= END_CLUSTER
    }

    pub fn is_bad(value: u32) -> bool {
        value == BAD_CLUSTER
    }

    /// Overwrite `cluster`'s entry and persist the full FAT to every copy.
    pub fn set_cluster_value(&mut self, cluster: u32, value: u32) -> Result<(), FatError> {
        if !self.in_range(cluster) {
            return Err(FatError::ClusterOutOfRange);
        }
        self.entries[cluster as usize] = value & 0x0FFF_FFFF;
        self.persist()
    }

    /// Linear scan from cluster 2 upward for the first free entry. On
    /// success, marks it end-of-chain and persists.
    pub fn allocate_cluster(&mut self) -> Result<u32, FatError> {
        let limit = (self.cluster_count() as usize).min(self.entries.len());
        for i in 2..limit {
            if self.entries[i] == FREE_CLUSTER {
                self.entries[i] = END_OF_CLUSTER;
                self.persist()?;
                return Ok(i as u32);
            }
        }
        Err(FatError::OutOfSpace)
    }

    /// Free `cluster` by zeroing its entry. Used to roll back a partially
    /// completed allocation.
    pub fn free_cluster(&mut self, cluster: u32) -> Result<(), FatError> {
        self.set_cluster_value(cluster, FREE_CLUSTER)
    }

    /// Allocate a new cluster and link `tail` -> new -> end-of-chain.
    /// Returns the new cluster number.
    pub fn extend_chain(&mut self, tail: u32) -> Result<u32, FatError> {
        let new_cluster = self.allocate_cluster()?;
        if let Err(e) = self.set_cluster_value(tail, new_cluster) {
            self.free_cluster(new_cluster).ok();
            return Err(e);
        }
        Ok(new_cluster)
    }

    /// Collect the full chain starting at `start`, stopping at end-of-chain
    /// or after visiting every cluster once (defends against a corrupt
    /// cyclic FAT).
    pub fn chain(&self, start: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut current = start;
        let limit = self.data_cluster_count as usize;
        while current >= 2 && !Self::is_end_of_chain(current) && out.len() <= limit {
            out.push(current);
            current = self.next_cluster(current);
        }
        out
    }

    /// Write the in-memory FAT back to every FAT copy on disk.
    fn persist(&self) -> Result<(), FatError> {
        let entries_per_sector = BLOCK_SIZE / 4;
        for &fat_start in &self.fat_sectors {
            for sector_index in 0..self.sectors_per_fat {
                let sector = fat_start + sector_index;
                let base = sector_index as usize * entries_per_sector;
                let end = (base + entries_per_sector).min(self.entries.len());
                let slice = &self.entries[base..end];

                if let Some(cache) = get_block_cache(sector, Arc::clone(&self.device)) {
                    cache.write().modify(0, |buf: &mut [u8; BLOCK_SIZE]| {
                        for (i, value) in slice.iter().enumerate() {
                            buf[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
                        }
                    });
                    cache.write().sync();
                } else {
                    let mut buf = [0u8; BLOCK_SIZE];
                    for (i, value) in slice.iter().enumerate() {
                        buf[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
                    }
                    self.device
                        .write_sector(sector, &buf)
                        .map_err(|_| FatError::WriteError)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpb::{fat_size_for, BIOSParameterBlock};
    use crate::device::MemBlockDevice;

    fn formatted_bpb_and_device() -> (BIOSParameterBlock, Arc<dyn BlockDevice>) {
        let total_sectors = 4096u64;
        let fat_sectors = fat_size_for(total_sectors, 32, 2, 4);
        let bpb = BIOSParameterBlock::format(total_sectors, fat_sectors, 2, 1);
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(total_sectors));
        device.write_sector(0, &bpb.to_bytes()).unwrap();

        let mut fat_buf = vec![0u8; fat_sectors as usize * BLOCK_SIZE];
        fat_buf[0..4].copy_from_slice(&(0x0FFF_FF00u32 | bpb.media() as u32).to_le_bytes());
        fat_buf[4..8].copy_from_slice(&END_OF_CLUSTER.to_le_bytes());
        fat_buf[8..12].copy_from_slice(&END_OF_CLUSTER.to_le_bytes());
        for copy in 0..bpb.fat_count() as u64 {
            device
                .write_sectors(bpb.fat_sector(copy as usize), fat_sectors, &fat_buf)
                .unwrap();
        }
        (bpb, device)
    }

    #[test]
    fn allocate_finds_first_free_and_marks_end_of_chain() {
        let (bpb, device) = formatted_bpb_and_device();
        let mut fat = FatTable::load(&bpb, Arc::clone(&device)).unwrap();
        let c = fat.allocate_cluster().unwrap();
        assert_eq!(c, 3);
        assert!(FatTable::is_end_of_chain(fat.next_cluster(c)));
    }

    #[test]
    fn extend_chain_links_tail_to_new_cluster() {
        let (bpb, device) = formatted_bpb_and_device();
        let mut fat = FatTable::load(&bpb, Arc::clone(&device)).unwrap();
        let tail = fat.allocate_cluster().unwrap();
        let next = fat.extend_chain(tail).unwrap();
        assert_eq!(fat.next_cluster(tail), next);
        assert!(FatTable::is_end_of_chain(fat.next_cluster(next)));
        assert_eq!(fat.chain(tail), vec![tail, next]);
    }

    #[test]
    fn out_of_space_returns_err_and_leaves_fat_unchanged() {
        let (bpb, device) = formatted_bpb_and_device();
        let mut fat = FatTable::load(&bpb, Arc::clone(&device)).unwrap();
        let total = fat.cluster_count();
        for _ in 2..total {
            fat.allocate_cluster().ok();
        }
        let before = fat.entries.clone();
        assert!(matches!(fat.allocate_cluster(), Err(FatError::OutOfSpace)));
        assert_eq!(fat.entries, before);
    }

    #[test]
    fn fat_persists_across_reload() {
        let (bpb, device) = formatted_bpb_and_device();
        let allocated = {
            let mut fat = FatTable::load(&bpb, Arc::clone(&device)).unwrap();
            fat.allocate_cluster().unwrap()
        };
        crate::cache::sync_all();
        let reloaded = FatTable::load(&bpb, Arc::clone(&device)).unwrap();
        assert!(FatTable::is_end_of_chain(reloaded.next_cluster(allocated)));
    }

    #[test]
    fn allocate_never_returns_a_cluster_beyond_data_cluster_count() {
        // The FAT region is sector-rounded, so entries.len() can exceed
        // data_cluster_count + 2; allocation must respect the latter, or a
        // near-full volume hands out a phantom cluster with no backing
        // data sector.
        let (bpb, device) = formatted_bpb_and_device();
        let mut fat = FatTable::load(&bpb, Arc::clone(&device)).unwrap();
        let logical_bound = fat.cluster_count();

        let mut allocated = Vec::new();
        loop {
            match fat.allocate_cluster() {
                Ok(c) => allocated.push(c),
                Err(FatError::OutOfSpace) => break,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }

        assert!(allocated.iter().all(|&c| c < logical_bound));
        assert!(allocated.iter().all(|&c| {
            bpb.first_sector_of_cluster(c) + bpb.sectors_per_cluster() as u64
                <= bpb.total_sector_cnt()
        }));
    }
}
