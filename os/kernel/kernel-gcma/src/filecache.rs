//! # File Cache Backend
//!
//! Second-chance cache for clean file pages dropped from the page cache.
//! One pool per mounted filesystem, keyed by `(file, page index)`. Keys of
//! one file are adjacent in every bucket's order, so a whole file can be
//! dropped with a single range invalidation.

use crate::dmem::{Dmem, DmemKey, DmemStats, PoolError, PoolId, mix64};
use crate::pfn::PAGE_SIZE;
use crate::registry::RegionRegistry;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use kernel_sync::SpinLock;
use log::{debug, info};

/// Identity of a cached file page. Orders by file first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileKey {
    pub file: u64,
    pub index: u64,
}

impl DmemKey for FileKey {
    #[inline]
    fn bucket_hash(&self) -> u64 {
        mix64(self.file ^ mix64(self.index))
    }
}

pub struct FileCache {
    dmem: Dmem<FileKey>,
    /// Pools of filesystems shared between mounts, by filesystem UUID.
    shared: SpinLock<BTreeMap<[u8; 16], PoolId>>,
}

impl FileCache {
    #[must_use]
    pub fn new(registry: Arc<RegionRegistry>) -> Self {
        Self {
            dmem: Dmem::new("gcma-file", registry),
            shared: SpinLock::new(BTreeMap::new()),
        }
    }

    const fn check_page_size(page_size: usize) -> Result<(), PoolError> {
        if page_size == PAGE_SIZE {
            Ok(())
        } else {
            Err(PoolError::PageSize { size: page_size })
        }
    }

    /// Create a pool for a newly mounted filesystem.
    ///
    /// # Errors
    /// - [`PoolError::PageSize`] if the filesystem's page size differs from
    ///   the region page size.
    /// - [`PoolError::NoFreeId`] if no pool id is left.
    pub fn init_fs(&self, page_size: usize) -> Result<PoolId, PoolError> {
        Self::check_page_size(page_size)?;
        self.dmem.create_any_pool()
    }

    /// Pool for a filesystem identified by `uuid`; mounts of the same
    /// filesystem share one pool.
    ///
    /// # Errors
    /// As [`init_fs`](Self::init_fs).
    pub fn init_shared_fs(&self, uuid: [u8; 16], page_size: usize) -> Result<PoolId, PoolError> {
        Self::check_page_size(page_size)?;
        let mut shared = self.shared.lock();
        if let Some(&pool) = shared.get(&uuid) {
            if self.dmem.has_pool(pool) {
                return Ok(pool);
            }
        }
        let pool = self.dmem.create_any_pool()?;
        shared.insert(uuid, pool);
        info!("gcma-file: shared filesystem mapped to {pool}");
        Ok(pool)
    }

    /// Fill `out` with the cached page. Returns `false` on a miss or error.
    pub fn get_page(&self, pool: PoolId, file: u64, index: u64, out: &mut [u8]) -> bool {
        self.dmem
            .load(pool, &FileKey { file, index }, out)
            .inspect_err(|e| debug!("gcma-file: get {pool} {file}:{index} failed: {e}"))
            .unwrap_or(false)
    }

    /// Best-effort store of a clean page. Returns whether it is now cached.
    pub fn put_page(&self, pool: PoolId, file: u64, index: u64, page: &[u8]) -> bool {
        self.dmem
            .store(pool, &FileKey { file, index }, page)
            .inspect_err(|e| debug!("gcma-file: put {pool} {file}:{index} dropped: {e}"))
            .is_ok()
    }

    pub fn invalidate_page(&self, pool: PoolId, file: u64, index: u64) -> bool {
        self.dmem
            .invalidate(pool, &FileKey { file, index })
            .unwrap_or(false)
    }

    /// Drop every cached page of `file`. Returns the number dropped.
    pub fn invalidate_inode(&self, pool: PoolId, file: u64) -> usize {
        let first = FileKey { file, index: 0 };
        let last = FileKey { file, index: u64::MAX };
        self.dmem.invalidate_range(pool, first..=last).unwrap_or(0)
    }

    /// Unmount: drop every page of the filesystem and its pool.
    pub fn invalidate_fs(&self, pool: PoolId) -> usize {
        self.shared.lock().retain(|_, p| *p != pool);
        self.dmem.destroy_pool(pool).unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> DmemStats {
        self.dmem.stats()
    }

    #[must_use]
    pub const fn dmem(&self) -> &Dmem<FileKey> {
        &self.dmem
    }
}
