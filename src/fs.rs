//! Mounted filesystem facade.
//!
//! `FileSystem` is the single entry point a caller (the shell, or any other
//! frontend) drives. It holds the one piece of mutable state this crate
//! ever needs outside of the block cache: which directory is "current".
//! There is no internal locking — per `SPEC_FULL.md` §5 this crate serves
//! one mount at a time, driven from one thread, so every method takes
//! `&mut self` (or `&self` where nothing changes) rather than an
//! `Arc<RwLock<..>>` shared handle.

use crate::bpb::{fat_size_for, BIOSParameterBlock, FSInfo};
use crate::cache;
use crate::device::BlockDevice;
use crate::dir::{self, DirError};
use crate::entry::{self, ShortDirEntry};
use crate::fat::FatTable;
use crate::path;
use crate::Error;

use std::sync::Arc;

pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    bpb: BIOSParameterBlock,
    fat: FatTable,
    cwd_cluster: u32,
    cwd_path: String,
}

impl FileSystem {
    /// Write a fresh FAT32 volume across the whole of `device` and mount
    /// it. Any existing contents are discarded.
    pub fn format(device: Arc<dyn BlockDevice>, volume_id: u32) -> Result<Self, Error> {
        let total_sectors = device.total_sectors();
        let root_cluster = 2;
        let fat_sectors = fat_size_for(total_sectors, 32, 2, 4);
        let bpb = BIOSParameterBlock::format(total_sectors, fat_sectors, root_cluster, volume_id);

        device.write_sector(0, &bpb.to_bytes())?;
        device.write_sector(bpb.backup_boot_sector(), &bpb.to_bytes())?;

        let data_clusters = bpb.data_cluster_cnt();
        let free_after_root = data_clusters.saturating_sub(1) as u32;
        let fsinfo = FSInfo::format(free_after_root, root_cluster + 1);
        device.write_sector(bpb.fs_info_sector() as u64, &fsinfo.to_bytes())?;

        let fat = FatTable::format(&bpb, Arc::clone(&device))?;
        let (date, time) = entry::now_packed();
        dir::init_directory_cluster(&bpb, &device, root_cluster, root_cluster, date, time)?;
        cache::sync_all();

        log::info!(
            "formatted volume: {total_sectors} sectors, {fat_sectors} FAT sectors/copy, root cluster {root_cluster}"
        );

        Ok(Self {
            device,
            bpb,
            fat,
            cwd_cluster: root_cluster,
            cwd_path: "/".to_string(),
        })
    }

    /// Mount an already-formatted volume.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self, Error> {
        let mut sector0 = [0u8; crate::BLOCK_SIZE];
        device.read_sector(0, &mut sector0)?;
        let bpb = BIOSParameterBlock::from_bytes(&sector0);
        if !bpb.is_valid() {
            log::warn!("refusing to mount: boot sector failed FAT32 validation");
            return Err(Error::NotFormatted);
        }

        let fat = FatTable::load(&bpb, Arc::clone(&device))?;
        log::debug!("mounted volume, root cluster {}", bpb.root_cluster());

        Ok(Self {
            device,
            bpb,
            fat,
            cwd_cluster: bpb.root_cluster(),
            cwd_path: "/".to_string(),
        })
    }

    pub fn cwd(&self) -> &str {
        &self.cwd_path
    }

    /// Flush every cached sector to the backing device. Called implicitly
    /// on drop; callers that want durability before then can call it
    /// explicitly.
    pub fn sync(&self) {
        cache::sync_all();
    }

    /// List the live entries of `path` (or the current directory, if
    /// `None`), as (name, is_directory) pairs in on-disk order.
    pub fn ls(&self, path: Option<&str>) -> Result<Vec<(String, bool)>, Error> {
        let cluster = self.resolve_dir(path.unwrap_or("."))?;
        let entries = dir::list_entries(&self.bpb, &self.device, &self.fat, cluster)?;
        Ok(entries.into_iter().map(|e| (e.name_str(), e.is_dir())).collect())
    }

    /// Change the current directory. `cd /` always resets to the root,
    /// regardless of the working directory it's issued from.
    pub fn cd(&mut self, path: &str) -> Result<(), Error> {
        let absolute = path::combine(&self.cwd_path, path);
        let cluster = self.resolve_dir(path)?;
        self.cwd_cluster = cluster;
        self.cwd_path = absolute;
        log::debug!("cwd now {} (cluster {})", self.cwd_path, self.cwd_cluster);
        Ok(())
    }

    /// Create a subdirectory of the current directory. Allocates a cluster
    /// for it and writes `.`/`..` before linking it into the parent; if
    /// linking fails, the allocated cluster is freed rather than leaked.
    pub fn mkdir(&mut self, name: &str) -> Result<(), Error> {
        path::validate_filename(name)?;
        if dir::find_entry(&self.bpb, &self.device, &self.fat, self.cwd_cluster, name).is_ok() {
            return Err(Error::AlreadyExists);
        }

        let new_cluster = self.fat.allocate_cluster()?;
        let (date, time) = entry::now_packed();

        if let Err(e) = dir::init_directory_cluster(&self.bpb, &self.device, new_cluster, self.cwd_cluster, date, time) {
            self.fat.free_cluster(new_cluster).ok();
            return Err(e.into());
        }

        let sde = ShortDirEntry::new(name, new_cluster, true, date, time);
        if let Err(e) = dir::add_entry(&self.bpb, &self.device, &mut self.fat, self.cwd_cluster, &sde) {
            self.fat.free_cluster(new_cluster).ok();
            return Err(e.into());
        }

        log::debug!("created directory {name:?} at cluster {new_cluster}");
        Ok(())
    }

    /// Create an empty file in the current directory. The entry starts
    /// with first-cluster 0 and size 0; no data cluster is allocated until
    /// something is written, which this crate's scope doesn't cover.
    pub fn touch(&mut self, name: &str) -> Result<(), Error> {
        path::validate_filename(name)?;
        if dir::find_entry(&self.bpb, &self.device, &self.fat, self.cwd_cluster, name).is_ok() {
            return Err(Error::AlreadyExists);
        }

        let (date, time) = entry::now_packed();
        let sde = ShortDirEntry::new(name, 0, false, date, time);
        dir::add_entry(&self.bpb, &self.device, &mut self.fat, self.cwd_cluster, &sde)?;
        log::debug!("created file {name:?}");
        Ok(())
    }

    /// Resolve `path` (relative to the current directory unless it starts
    /// with `/`) to the cluster of the directory it names.
    fn resolve_dir(&self, path: &str) -> Result<u32, Error> {
        let absolute = path::combine(&self.cwd_path, path);
        if absolute == "/" {
            return Ok(self.bpb.root_cluster());
        }

        let components = path::split_absolute(&absolute)?;
        let mut cluster = self.bpb.root_cluster();
        for component in &components {
            let (entry, _) = dir::find_entry(&self.bpb, &self.device, &self.fat, cluster, component)
                .map_err(|_| Error::Dir(DirError::NotFound))?;
            if !entry.is_dir() {
                return Err(Error::Dir(DirError::NotADirectory));
            }
            cluster = entry.first_cluster();
        }
        Ok(cluster)
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn mounted() -> FileSystem {
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(8192));
        FileSystem::format(device, 0xCAFEBABE).unwrap()
    }

    #[test]
    fn freshly_formatted_volume_has_dot_and_dotdot_in_root() {
        let fs = mounted();
        assert_eq!(fs.cwd(), "/");
        let listed = fs.ls(None).unwrap();
        assert_eq!(
            listed,
            vec![(".".to_string(), true), ("..".to_string(), true)]
        );
    }

    #[test]
    fn mkdir_then_cd_then_ls_roundtrip() {
        let mut fs = mounted();
        fs.mkdir("docs").unwrap();
        let listed = fs.ls(None).unwrap();
        assert_eq!(
            listed,
            vec![
                (".".to_string(), true),
                ("..".to_string(), true),
                ("DOCS".to_string(), true),
            ]
        );

        fs.cd("docs").unwrap();
        assert_eq!(fs.cwd(), "/docs");

        let listed = fs.ls(None).unwrap();
        let names: Vec<&str> = listed.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"."));
        assert!(names.contains(&".."));
    }

    #[test]
    fn cd_slash_resets_to_root_from_anywhere() {
        let mut fs = mounted();
        fs.mkdir("a").unwrap();
        fs.cd("a").unwrap();
        fs.mkdir("b").unwrap();
        fs.cd("b").unwrap();
        assert_eq!(fs.cwd(), "/a/b");

        fs.cd("/").unwrap();
        assert_eq!(fs.cwd(), "/");
    }

    #[test]
    fn mkdir_rejects_duplicate_names() {
        let mut fs = mounted();
        fs.mkdir("dup").unwrap();
        assert_eq!(fs.mkdir("dup").unwrap_err(), Error::AlreadyExists);
    }

    #[test]
    fn touch_creates_a_zero_length_file() {
        let mut fs = mounted();
        fs.touch("readme.txt").unwrap();
        let listed = fs.ls(None).unwrap();
        assert_eq!(
            listed,
            vec![
                (".".to_string(), true),
                ("..".to_string(), true),
                ("README.TXT".to_string(), false),
            ]
        );
    }

    #[test]
    fn cd_into_a_file_fails() {
        let mut fs = mounted();
        fs.touch("readme.txt").unwrap();
        assert_eq!(
            fs.cd("readme.txt").unwrap_err(),
            Error::Dir(DirError::NotADirectory)
        );
    }

    #[test]
    fn mount_rejects_an_unformatted_device() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(8192));
        assert_eq!(FileSystem::mount(device).unwrap_err(), Error::NotFormatted);
    }
}
