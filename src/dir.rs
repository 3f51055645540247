//! Directory walker and editor.
//!
//! A directory is just a cluster chain whose contents are 32-byte
//! [`ShortDirEntry`] records. Two access patterns need different
//! termination rules (see `entry.rs`): a name lookup or free-slot search
//! must keep scanning past a never-used (`0x00`) slot because a directory
//! that has had entries deleted and recreated can have live slots after a
//! never-used one, while a listing stops at the first never-used slot
//! because everything past it is guaranteed free.

use crate::bpb::BIOSParameterBlock;
use crate::cache::{get_block_cache, Cache};
use crate::device::{BlockDevice, DeviceErr};
use crate::entry::{to_short_name, EntryState, ShortDirEntry};
use crate::fat::{FatError, FatTable};
use crate::{BLOCK_SIZE, DIRENT_SIZE};

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirError {
    NotFound,
    NotADirectory,
    AlreadyExists,
    Device(DeviceErr),
    Fat(FatError),
}

impl From<DeviceErr> for DirError {
    fn from(e: DeviceErr) -> Self {
        DirError::Device(e)
    }
}

impl From<FatError> for DirError {
    fn from(e: FatError) -> Self {
        DirError::Fat(e)
    }
}

/// Where an entry lives on disk, for a later write-back (rename, delete,
/// mark-allocated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub cluster: u32,
    pub sector: u64,
    pub offset: usize,
}

fn entries_per_sector() -> usize {
    BLOCK_SIZE / DIRENT_SIZE
}

fn read_entry(device: &Arc<dyn BlockDevice>, sector: u64, offset: usize) -> Result<ShortDirEntry, DirError> {
    if let Some(cache) = get_block_cache(sector, Arc::clone(device)) {
        Ok(cache.read().read(offset, |buf: &[u8; DIRENT_SIZE]| ShortDirEntry::from_bytes(buf)))
    } else {
        let mut raw = [0u8; BLOCK_SIZE];
        device.read_sector(sector, &mut raw)?;
        let mut bytes = [0u8; DIRENT_SIZE];
        bytes.copy_from_slice(&raw[offset..offset + DIRENT_SIZE]);
        Ok(ShortDirEntry::from_bytes(&bytes))
    }
}

fn write_entry(device: &Arc<dyn BlockDevice>, sector: u64, offset: usize, entry: &ShortDirEntry) -> Result<(), DirError> {
    let bytes = entry.to_bytes();
    if let Some(cache) = get_block_cache(sector, Arc::clone(device)) {
        cache.write().modify(offset, |buf: &mut [u8; DIRENT_SIZE]| buf.copy_from_slice(&bytes));
        cache.write().sync();
        Ok(())
    } else {
        let mut raw = [0u8; BLOCK_SIZE];
        device.read_sector(sector, &mut raw)?;
        raw[offset..offset + DIRENT_SIZE].copy_from_slice(&bytes);
        device.write_sector(sector, &raw)?;
        Ok(())
    }
}

/// Zero every byte of `cluster`, leaving every slot in it never-used.
pub fn zero_cluster(bpb: &BIOSParameterBlock, device: &Arc<dyn BlockDevice>, cluster: u32) -> Result<(), DirError> {
    let base_sector = bpb.first_sector_of_cluster(cluster);
    let zero = [0u8; BLOCK_SIZE];
    for s in 0..bpb.sectors_per_cluster() as u64 {
        let sector = base_sector + s;
        if let Some(cache) = get_block_cache(sector, Arc::clone(device)) {
            cache.write().modify(0, |buf: &mut [u8; BLOCK_SIZE]| buf.copy_from_slice(&zero));
            cache.write().sync();
        } else {
            device.write_sector(sector, &zero)?;
        }
    }
    Ok(())
}

/// Every (sector, offset) slot across `start_cluster`'s chain, in order.
fn slots(bpb: &BIOSParameterBlock, fat: &FatTable, start_cluster: u32) -> Vec<(u32, u64, usize)> {
    let chain = fat.chain(start_cluster);
    let per_sector = entries_per_sector();
    let mut out = Vec::new();
    for cluster in chain {
        let base_sector = bpb.first_sector_of_cluster(cluster);
        for s in 0..bpb.sectors_per_cluster() as u64 {
            let sector = base_sector + s;
            for e in 0..per_sector {
                out.push((cluster, sector, e * DIRENT_SIZE));
            }
        }
    }
    out
}

/// Look up `name` (case-insensitively, matched as a short name) in the
/// directory rooted at `start_cluster`. Scans the entire chain: a
/// never-used slot does not end the search, since a directory with
/// deletions can have live entries after one.
pub fn find_entry(
    bpb: &BIOSParameterBlock,
    device: &Arc<dyn BlockDevice>,
    fat: &FatTable,
    start_cluster: u32,
    name: &str,
) -> Result<(ShortDirEntry, EntryLocation), DirError> {
    let (name_field, ext_field) = to_short_name(name);
    let mut target = [0u8; 11];
    target[0..8].copy_from_slice(&name_field);
    target[8..11].copy_from_slice(&ext_field);

    for (cluster, sector, offset) in slots(bpb, fat, start_cluster) {
        let entry = read_entry(device, sector, offset)?;
        if entry.state() == EntryState::Live && entry.short_name_bytes() == target {
            return Ok((entry, EntryLocation { cluster, sector, offset }));
        }
    }
    Err(DirError::NotFound)
}

/// All live entries in the directory rooted at `start_cluster`, in on-disk
/// order. Stops at the first never-used slot, since everything after it is
/// guaranteed free.
pub fn list_entries(
    bpb: &BIOSParameterBlock,
    device: &Arc<dyn BlockDevice>,
    fat: &FatTable,
    start_cluster: u32,
) -> Result<Vec<ShortDirEntry>, DirError> {
    let mut out = Vec::new();
    for (_, sector, offset) in slots(bpb, fat, start_cluster) {
        let entry = read_entry(device, sector, offset)?;
        match entry.state() {
            EntryState::EndOfDirectory => break,
            EntryState::Deleted => continue,
            EntryState::Live => out.push(entry),
        }
    }
    Ok(out)
}

/// Find the first free slot (never-used or deleted) in the directory
/// rooted at `start_cluster`. If the chain is exhausted without one, a new
/// cluster is allocated, linked onto the chain, and zeroed; its first slot
/// is returned.
pub fn find_free_slot(
    bpb: &BIOSParameterBlock,
    device: &Arc<dyn BlockDevice>,
    fat: &mut FatTable,
    start_cluster: u32,
) -> Result<EntryLocation, DirError> {
    let chain_slots = slots(bpb, fat, start_cluster);
    for (cluster, sector, offset) in &chain_slots {
        let entry = read_entry(device, *sector, *offset)?;
        if entry.state() != EntryState::Live {
            return Ok(EntryLocation {
                cluster: *cluster,
                sector: *sector,
                offset: *offset,
            });
        }
    }

    let tail = fat.chain(start_cluster).last().copied().unwrap_or(start_cluster);
    let new_cluster = fat.extend_chain(tail)?;
    zero_cluster(bpb, device, new_cluster)?;
    Ok(EntryLocation {
        cluster: new_cluster,
        sector: bpb.first_sector_of_cluster(new_cluster),
        offset: 0,
    })
}

/// Write `entry` at `loc`, overwriting whatever was there.
pub fn put_entry(device: &Arc<dyn BlockDevice>, loc: EntryLocation, entry: &ShortDirEntry) -> Result<(), DirError> {
    write_entry(device, loc.sector, loc.offset, entry)
}

/// Allocate a free slot in `start_cluster`'s directory and write `entry`
/// into it.
pub fn add_entry(
    bpb: &BIOSParameterBlock,
    device: &Arc<dyn BlockDevice>,
    fat: &mut FatTable,
    start_cluster: u32,
    entry: &ShortDirEntry,
) -> Result<EntryLocation, DirError> {
    let loc = find_free_slot(bpb, device, fat, start_cluster)?;
    put_entry(device, loc, entry)?;
    Ok(loc)
}

/// Mark the entry at `loc` deleted (`0xE5`), leaving the slot reusable.
pub fn remove_entry_at(device: &Arc<dyn BlockDevice>, loc: EntryLocation) -> Result<(), DirError> {
    let mut entry = read_entry(device, loc.sector, loc.offset)?;
    entry.mark_free();
    write_entry(device, loc.sector, loc.offset, &entry)
}

/// Allocate `new_cluster`'s contents as an empty directory: zero it, then
/// write `.` pointing at itself and `..` pointing at `parent_cluster`.
pub fn init_directory_cluster(
    bpb: &BIOSParameterBlock,
    device: &Arc<dyn BlockDevice>,
    new_cluster: u32,
    parent_cluster: u32,
    date: u16,
    time: u16,
) -> Result<(), DirError> {
    zero_cluster(bpb, device, new_cluster)?;
    let base_sector = bpb.first_sector_of_cluster(new_cluster);
    write_entry(device, base_sector, 0, &ShortDirEntry::dot(new_cluster, date, time))?;
    write_entry(device, base_sector, DIRENT_SIZE, &ShortDirEntry::dotdot(parent_cluster, date, time))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpb::{fat_size_for, BIOSParameterBlock};
    use crate::device::MemBlockDevice;
    use crate::{END_OF_CLUSTER, FREE_CLUSTER};

    fn fresh_volume() -> (BIOSParameterBlock, Arc<dyn BlockDevice>, FatTable) {
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
        zero_cluster(&bpb, &device, 2).unwrap();
        let fat = FatTable::load(&bpb, Arc::clone(&device)).unwrap();
        let _ = FREE_CLUSTER;
        (bpb, device, fat)
    }

    #[test]
    fn add_then_find_round_trips() {
        let (bpb, device, mut fat) = fresh_volume();
        let entry = ShortDirEntry::new("readme", 0, false, 0x1234, 0x5678);
        add_entry(&bpb, &device, &mut fat, 2, &entry).unwrap();

        let (found, _) = find_entry(&bpb, &device, &fat, 2, "readme").unwrap();
        assert_eq!(found.name_str(), "README");
        assert!(!found.is_dir());
    }

    #[test]
    fn list_stops_at_first_never_used_slot() {
        let (bpb, device, mut fat) = fresh_volume();
        add_entry(&bpb, &device, &mut fat, 2, &ShortDirEntry::new("a", 0, false, 0, 0)).unwrap();
        add_entry(&bpb, &device, &mut fat, 2, &ShortDirEntry::new("b", 0, false, 0, 0)).unwrap();
        let listed = list_entries(&bpb, &device, &fat, 2).unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn deleted_slot_is_skipped_by_listing_but_reused_by_lookup_scan() {
        let (bpb, device, mut fat) = fresh_volume();
        let loc_a = add_entry(&bpb, &device, &mut fat, 2, &ShortDirEntry::new("a", 0, false, 0, 0)).unwrap();
        add_entry(&bpb, &device, &mut fat, 2, &ShortDirEntry::new("b", 0, false, 0, 0)).unwrap();
        remove_entry_at(&device, loc_a).unwrap();

        let listed = list_entries(&bpb, &device, &fat, 2).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name_str(), "B");

        // The freed slot is found again by a free-slot search before the
        // directory grows.
        let reused = find_free_slot(&bpb, &device, &mut fat, 2).unwrap();
        assert_eq!(reused, loc_a);
    }

    #[test]
    fn find_free_slot_extends_chain_when_cluster_is_full() {
        let (bpb, device, mut fat) = fresh_volume();
        let per_cluster = bpb.bytes_per_cluster() / DIRENT_SIZE;
        for i in 0..per_cluster {
            add_entry(&bpb, &device, &mut fat, 2, &ShortDirEntry::new(&format!("f{i}"), 0, false, 0, 0)).unwrap();
        }
        let loc = find_free_slot(&bpb, &device, &mut fat, 2).unwrap();
        assert_ne!(loc.cluster, 2);
        assert_eq!(fat.chain(2).len(), 2);
    }

    #[test]
    fn init_directory_cluster_writes_dot_entries() {
        let (bpb, device, _fat) = fresh_volume();
        init_directory_cluster(&bpb, &device, 2, 2, 0x1234, 0x5678).unwrap();
        let base_sector = bpb.first_sector_of_cluster(2);
        let dot = read_entry(&device, base_sector, 0).unwrap();
        let dotdot = read_entry(&device, base_sector, DIRENT_SIZE).unwrap();
        assert_eq!(dot.name_str(), ".");
        assert_eq!(dotdot.name_str(), "..");
        assert_eq!(dot.first_cluster(), 2);
    }
}
