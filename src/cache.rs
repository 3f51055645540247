//! Sector-granular block cache.
//!
//! Every on-disk structure (boot sector, FAT sectors, directory clusters)
//! is read and written through this cache rather than calling the block
//! device directly, so that repeated touches of the same sector within one
//! operation only pay for one device round trip.

use crate::device::BlockDevice;
use crate::{BLOCK_CACHE_LIMIT, BLOCK_SIZE};

use lazy_static::lazy_static;
use lru::LruCache;
use spin::RwLock as SpinRwLock;
use std::sync::{Arc, Mutex};

pub trait Cache {
    /// Read-only typed view into the cached sector at byte `offset`.
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V;
    /// Mutable typed view into the cached sector at byte `offset`. Marks
    /// the sector dirty.
    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V;
    /// Write the sector back if it has been modified since the last sync.
    fn sync(&mut self);
}

pub struct BlockCache {
    cache: [u8; BLOCK_SIZE],
    sector: u64,
    device: Arc<dyn BlockDevice>,
    modified: bool,
}

impl BlockCache {
    pub fn new(sector: u64, device: Arc<dyn BlockDevice>) -> Self {
        let mut cache = [0u8; BLOCK_SIZE];
        device.read_sector(sector, &mut cache).unwrap();
        Self {
            cache,
            sector,
            device,
            modified: false,
        }
    }

    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.cache[offset] as *const _ as usize
    }

    fn get_ref<T: Sized>(&self, offset: usize) -> &T {
        let type_size = std::mem::size_of::<T>();
        assert!(offset + type_size <= BLOCK_SIZE);
        unsafe { &*(self.addr_of_offset(offset) as *const T) }
    }

    fn get_mut<T: Sized>(&mut self, offset: usize) -> &mut T {
        let type_size = std::mem::size_of::<T>();
        assert!(offset + type_size <= BLOCK_SIZE);
        self.modified = true;
        unsafe { &mut *(self.addr_of_offset(offset) as *mut T) }
    }
}

impl Cache for BlockCache {
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    fn sync(&mut self) {
        if self.modified {
            self.modified = false;
            self.device.write_sector(self.sector, &self.cache).unwrap();
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.sync()
    }
}

pub struct BlockCacheManager {
    lru: LruCache<u64, Arc<SpinRwLock<BlockCache>>>,
}

impl BlockCacheManager {
    pub fn new() -> Self {
        Self {
            lru: LruCache::unbounded(),
        }
    }

    pub fn get_block_cache(
        &mut self,
        sector: u64,
        device: Arc<dyn BlockDevice>,
    ) -> Option<Arc<SpinRwLock<BlockCache>>> {
        if let Some(pair) = self.lru.get(&sector) {
            return Some(Arc::clone(pair));
        }

        if self.lru.len() == BLOCK_CACHE_LIMIT {
            let (_, cache) = self.lru.peek_lru().unwrap();
            if Arc::strong_count(cache) == 1 {
                self.lru.pop_lru();
            } else {
                return None;
            }
        }

        let cache = Arc::new(SpinRwLock::new(BlockCache::new(sector, device)));
        self.lru
            .put(sector, Arc::clone(&cache))
            .map(|_| ())
            .unwrap_or(());
        Some(cache)
    }

    pub fn clear(&mut self) {
        self.lru.clear();
    }
}

impl Default for BlockCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref BLOCK_CACHE_MANAGER: Mutex<BlockCacheManager> =
        Mutex::new(BlockCacheManager::new());
}

/// Look up (or load) the cache entry for `sector` on `device`.
///
/// Returns `None` only when the cache is at capacity and every resident
/// entry is still referenced elsewhere; callers fall back to reading the
/// sector directly from `device` in that case.
pub fn get_block_cache(sector: u64, device: Arc<dyn BlockDevice>) -> Option<Arc<SpinRwLock<BlockCache>>> {
    BLOCK_CACHE_MANAGER
        .lock()
        .unwrap()
        .get_block_cache(sector, device)
}

/// Flush and evict every cached sector. Called when a mount closes.
pub fn sync_all() {
    let mut manager = BLOCK_CACHE_MANAGER.lock().unwrap();
    // Dropping each entry triggers BlockCache::drop -> sync.
    manager.clear();
}
