//! # Discardable Memory Cache
//!
//! A generic key → page store over the registry's regions. Pages held here
//! are *discardable*: the cache may drop any of them at any time, and a
//! claim may take them away. Callers must treat every load as a possible
//! miss.
//!
//! ```text
//! Dmem<K>
//!   ├── pools: PoolId → Pool
//!   │     └── buckets[bucket_count]: SpinLock<BTreeMap<K, Arc<Entry>>>
//!   └── shared
//!         ├── lru: SpinLock<Lru>      (one list for all pools of the backend)
//!         └── stats
//! ```
//!
//! ## Reference counting
//!
//! An entry starts with one reference owned by its bucket index. Loads,
//! evictions and claims take a temporary reference so the page stays valid
//! while they work on it. The count drops to zero only with the bucket lock
//! and the LRU lock held; at that point the entry leaves the LRU and its
//! page goes back to the region (or to a waiting claimant).
//!
//! Lock order is bucket → LRU → region. The pool table lock is never held
//! together with any of them.

mod entry;
mod key;
mod lru;
mod pool;
mod stats;

pub use key::{DmemKey, mix64};
pub use pool::PoolId;
pub use stats::DmemStats;

use crate::pfn::{PAGE_SIZE, Pfn};
use crate::region::{Reclaimable, Region};
use crate::registry::RegionRegistry;
use crate::window::WindowError;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{RangeBounds, RangeFull};
use entry::Entry;
use kernel_sync::SpinLock;
use log::{debug, info, trace, warn};
use lru::Lru;
use pool::Pool;
use stats::Counters;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no such pool: {0}")]
    NoSuchPool(PoolId),
    #[error("{0} already exists")]
    PoolExists(PoolId),
    #[error("pool ids exhausted")]
    NoFreeId,
    #[error("swap type {0} is out of range")]
    InvalidSwapType(u32),
    #[error("page size {size} is not supported")]
    PageSize { size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("content of {len} bytes is not one page")]
    BadLength { len: usize },
    #[error("no page available after eviction")]
    OutOfPages,
    #[error(transparent)]
    Window(#[from] WindowError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("buffer of {len} bytes is not one page")]
    BadLength { len: usize },
    #[error(transparent)]
    Window(#[from] WindowError),
}

/// State shared by a backend and all of its entries.
pub(crate) struct Shared<K: DmemKey> {
    pub(crate) lru: SpinLock<Lru<K>>,
    pub(crate) stats: Counters,
}

/// One cache backend, polymorphic over its key shape.
pub struct Dmem<K: DmemKey> {
    name: &'static str,
    registry: Arc<RegionRegistry>,
    pools: SpinLock<BTreeMap<PoolId, Arc<Pool<K>>>>,
    shared: Arc<Shared<K>>,
}

impl<K: DmemKey> Dmem<K> {
    #[must_use]
    pub fn new(name: &'static str, registry: Arc<RegionRegistry>) -> Self {
        Self {
            name,
            registry,
            pools: SpinLock::new(BTreeMap::new()),
            shared: Arc::new(Shared {
                lru: SpinLock::new(Lru::new()),
                stats: Counters::default(),
            }),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<RegionRegistry> {
        &self.registry
    }

    /// Create pool `id` with the registry's bucket count.
    ///
    /// # Errors
    /// [`PoolError::PoolExists`] if `id` is taken.
    pub fn create_pool(&self, id: PoolId) -> Result<(), PoolError> {
        let mut pools = self.pools.lock();
        if pools.contains_key(&id) {
            return Err(PoolError::PoolExists(id));
        }
        pools.insert(id, Arc::new(Pool::new(id, self.registry.config().bucket_count)));
        info!("{}: created {id}", self.name);
        Ok(())
    }

    /// Create a pool under the lowest unused id.
    ///
    /// # Errors
    /// [`PoolError::NoFreeId`] if every id is in use.
    pub fn create_any_pool(&self) -> Result<PoolId, PoolError> {
        let mut pools = self.pools.lock();
        let mut next = 0u32;
        for used in pools.keys() {
            if used.0 != next {
                break;
            }
            next = next.checked_add(1).ok_or(PoolError::NoFreeId)?;
        }
        let id = PoolId(next);
        pools.insert(id, Arc::new(Pool::new(id, self.registry.config().bucket_count)));
        info!("{}: created {id}", self.name);
        Ok(id)
    }

    /// Invalidate every entry of pool `id` and forget the pool.
    ///
    /// Returns the number of entries dropped.
    ///
    /// # Errors
    /// [`PoolError::NoSuchPool`] if `id` does not exist.
    pub fn destroy_pool(&self, id: PoolId) -> Result<usize, PoolError> {
        let pool = self.pools.lock().remove(&id).ok_or(PoolError::NoSuchPool(id))?;
        pool.kill();
        let dropped = self.drain(&pool, &RangeFull);
        info!("{}: destroyed {id}, {dropped} entries dropped", self.name);
        Ok(dropped)
    }

    #[must_use]
    pub fn has_pool(&self, id: PoolId) -> bool {
        self.pools.lock().contains_key(&id)
    }

    fn pool(&self, id: PoolId) -> Result<Arc<Pool<K>>, PoolError> {
        self.pools
            .lock()
            .get(&id)
            .cloned()
            .ok_or(PoolError::NoSuchPool(id))
    }

    /// Copy one page of `content` into the cache under `key`.
    ///
    /// An existing entry for the same key is replaced. When every region is
    /// full, the least recently used entries of this backend are evicted in
    /// batches of `evict_batch` for at most `store_retry_limit` rounds.
    ///
    /// # Errors
    /// - [`StoreError::BadLength`] if `content` is not exactly one page.
    /// - [`StoreError::Pool`] if the pool does not exist or is being torn
    ///   down.
    /// - [`StoreError::OutOfPages`] if no page could be found.
    /// - [`StoreError::Window`] if the page could not be mapped.
    pub fn store(&self, pool: PoolId, key: &K, content: &[u8]) -> Result<(), StoreError> {
        if content.len() != PAGE_SIZE {
            return Err(StoreError::BadLength { len: content.len() });
        }
        let pool = self.pool(pool)?;
        self.store_in(&pool, key, content).inspect_err(|e| {
            Counters::bump(&self.shared.stats.store_failures);
            debug!("{}: store of {key:?} to {} failed: {e}", self.name, pool.id());
            // A failed overwrite must not leave the previous content behind.
            if self.remove(&pool, key) {
                Counters::bump(&self.shared.stats.invalidates);
            }
        })
    }

    fn store_in(&self, pool: &Pool<K>, key: &K, content: &[u8]) -> Result<(), StoreError> {
        let (region, pfn) = self.alloc_page()?;
        if let Err(e) = region.window().acquire(pfn).map(|mut page| page.copy_from(content)) {
            Self::discard_unpublished(&region, pfn);
            return Err(e.into());
        }

        let bucket = pool.bucket(key);
        let entry = Arc::new(Entry::new(
            key.clone(),
            Arc::clone(&region),
            pfn,
            Arc::downgrade(bucket),
            Arc::clone(&self.shared),
        ));

        let mut index = bucket.index.lock();
        if !pool.is_alive() {
            drop(index);
            Self::discard_unpublished(&region, pfn);
            return Err(PoolError::NoSuchPool(pool.id()).into());
        }
        let replaced = index.insert(entry.key().clone(), Arc::clone(&entry));

        let mut lru = self.shared.lru.lock();
        if let Some(old) = &replaced {
            old.put(&mut lru);
            Counters::bump(&self.shared.stats.duplicates);
        }
        // Published and linked under one LRU hold: a claimant never sees an
        // owner it cannot detach.
        let owner: Arc<dyn Reclaimable> = entry.clone();
        if !region.publish_owner(pfn, owner) {
            warn!("{}: frame {pfn} was not pending at publication", self.name);
        }
        lru.push_head(&entry);
        drop(lru);
        drop(index);

        Counters::bump(&self.shared.stats.stores);
        trace!("{}: stored {:?} at {pfn}", self.name, entry.key());
        Ok(())
    }

    /// Give back a page that never became visible to anyone.
    fn discard_unpublished(region: &Region, pfn: Pfn) {
        if let Err(e) = region.free_page(pfn) {
            warn!("discarding frame {pfn}: {e}");
        }
    }

    fn alloc_page(&self) -> Result<(Arc<Region>, Pfn), StoreError> {
        let config = self.registry.config();
        for round in 0..=config.store_retry_limit {
            if let Some(found) = self.registry.alloc_page() {
                return Ok(found);
            }
            if round == config.store_retry_limit || self.evict_lru(config.evict_batch) == 0 {
                break;
            }
        }
        warn!("{}: no page after {} eviction rounds", self.name, config.store_retry_limit);
        Err(StoreError::OutOfPages)
    }

    /// Copy the page cached under `key` into `out`.
    ///
    /// Returns `Ok(false)` on a miss, which is an expected outcome.
    ///
    /// # Errors
    /// - [`LoadError::BadLength`] if `out` is not exactly one page.
    /// - [`LoadError::Pool`] if the pool does not exist.
    /// - [`LoadError::Window`] if the page could not be mapped.
    pub fn load(&self, pool: PoolId, key: &K, out: &mut [u8]) -> Result<bool, LoadError> {
        if out.len() != PAGE_SIZE {
            return Err(LoadError::BadLength { len: out.len() });
        }
        let pool = self.pool(pool)?;
        let bucket = pool.bucket(key);

        let entry = {
            let index = bucket.index.lock();
            let Some(entry) = index.get(key) else {
                Counters::bump(&self.shared.stats.load_misses);
                trace!("{}: miss {key:?}", self.name);
                return Ok(false);
            };
            entry.get();
            Arc::clone(entry)
        };

        // The temporary reference keeps the page ours during the copy.
        let copied = entry
            .region()
            .window()
            .acquire(entry.pfn())
            .map(|page| page.copy_to(out));

        {
            let _index = bucket.index.lock();
            let mut lru = self.shared.lru.lock();
            if copied.is_ok() {
                lru.touch(&entry);
            }
            entry.put(&mut lru);
        }

        copied?;
        Counters::bump(&self.shared.stats.loads);
        trace!("{}: loaded {key:?} from {}", self.name, entry.pfn());
        Ok(true)
    }

    /// Drop the entry cached under `key`. Returns whether there was one.
    ///
    /// # Errors
    /// [`PoolError::NoSuchPool`] if the pool does not exist.
    pub fn invalidate(&self, pool: PoolId, key: &K) -> Result<bool, PoolError> {
        let pool = self.pool(pool)?;
        if !self.remove(&pool, key) {
            return Ok(false);
        }
        Counters::bump(&self.shared.stats.invalidates);
        trace!("{}: invalidated {key:?}", self.name);
        Ok(true)
    }

    /// Erase `key` from its bucket and drop the index reference.
    fn remove(&self, pool: &Pool<K>, key: &K) -> bool {
        let bucket = pool.bucket(key);
        let mut index = bucket.index.lock();
        let Some(entry) = index.remove(key) else {
            return false;
        };
        entry.put(&mut self.shared.lru.lock());
        drop(index);
        true
    }

    /// Drop every entry of the pool whose key lies in `range`.
    ///
    /// Scans all buckets. Returns the number of entries dropped.
    ///
    /// # Errors
    /// [`PoolError::NoSuchPool`] if the pool does not exist.
    pub fn invalidate_range<R: RangeBounds<K>>(&self, pool: PoolId, range: R) -> Result<usize, PoolError> {
        let pool = self.pool(pool)?;
        Ok(self.drain(&pool, &range))
    }

    /// Drop every entry of the pool but keep the pool.
    ///
    /// # Errors
    /// [`PoolError::NoSuchPool`] if the pool does not exist.
    pub fn invalidate_pool(&self, pool: PoolId) -> Result<usize, PoolError> {
        let dropped = self.invalidate_range(pool, ..)?;
        debug!("{}: invalidated {pool}, {dropped} entries", self.name);
        Ok(dropped)
    }

    fn drain<R: RangeBounds<K>>(&self, pool: &Pool<K>, range: &R) -> usize {
        let mut dropped = 0;
        for bucket in pool.buckets() {
            let mut index = bucket.index.lock();
            let keys: Vec<K> = index.keys().filter(|k| range.contains(*k)).cloned().collect();
            if keys.is_empty() {
                continue;
            }
            let mut erased = Vec::with_capacity(keys.len());
            {
                let mut lru = self.shared.lru.lock();
                for key in &keys {
                    if let Some(entry) = index.remove(key) {
                        entry.put(&mut lru);
                        erased.push(entry);
                    }
                }
            }
            drop(index);
            dropped += erased.len();
        }
        Counters::add(&self.shared.stats.invalidates, dropped);
        dropped
    }

    /// Evict up to `n` entries from the LRU tail. Returns how many were
    /// evicted.
    ///
    /// Victims are pinned and unlinked in one LRU hold, then erased from
    /// their buckets one by one. A victim that a concurrent invalidate
    /// already erased is only unpinned.
    pub fn evict_lru(&self, n: usize) -> usize {
        let victims: Vec<Arc<Entry<K>>> = {
            let mut lru = self.shared.lru.lock();
            core::iter::from_fn(|| lru.pop_tail())
                .take(n)
                .inspect(|entry| entry.get())
                .collect()
        };
        for entry in &victims {
            entry.drop_detached();
        }
        Counters::add(&self.shared.stats.evictions, victims.len());
        if !victims.is_empty() {
            debug!("{}: evicted {} entries", self.name, victims.len());
        }
        victims.len()
    }

    /// Entries currently indexed across all pools.
    #[must_use]
    pub fn len(&self) -> usize {
        let pools: Vec<_> = self.pools.lock().values().cloned().collect();
        pools.iter().map(|p| p.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries currently on the LRU list.
    #[must_use]
    pub fn lru_len(&self) -> usize {
        self.shared.lru.lock().len()
    }

    #[must_use]
    pub fn stats(&self) -> DmemStats {
        self.shared.stats.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn lru_keys_from_tail(&self) -> Vec<K> {
        self.shared.lru.lock().keys_from_tail()
    }
}

impl<K: DmemKey> Drop for Dmem<K> {
    fn drop(&mut self) {
        // Entries refer back to `shared`; drain them so their pages return
        // to the regions and the LRU lets go of them.
        let pools = core::mem::take(self.pools.get_mut());
        for pool in pools.values() {
            pool.kill();
            self.drain(pool, &RangeFull);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcmaConfig;
    use crate::pfn::{Pfn, PfnRange};
    use crate::region::PageState;
    use crate::window::RamWindowMapper;

    fn backend(pages: usize, evict_batch: usize) -> (Dmem<u64>, Arc<Region>) {
        let config = GcmaConfig::DEFAULT.with_bucket_count(4).with_evict_batch(evict_batch);
        let registry = Arc::new(RegionRegistry::new(config).unwrap());
        let range = PfnRange::new(Pfn::new(0x40), pages).unwrap();
        let region = registry
            .init_region(range.start(), pages, Arc::new(RamWindowMapper::new(range)))
            .unwrap();
        let dmem = Dmem::new("test", registry);
        dmem.create_pool(PoolId(0)).unwrap();
        (dmem, region)
    }

    fn page(byte: u8) -> [u8; PAGE_SIZE] {
        [byte; PAGE_SIZE]
    }

    #[test]
    fn store_then_load() {
        let (dmem, region) = backend(4, 1);
        dmem.store(PoolId(0), &7, &page(0x11)).unwrap();
        let mut out = page(0);
        assert_eq!(dmem.load(PoolId(0), &7, &mut out), Ok(true));
        assert_eq!(out, page(0x11));
        assert_eq!(dmem.load(PoolId(0), &8, &mut out), Ok(false));
        assert_eq!(region.occupied_pages(), 1);

        let stats = dmem.stats();
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.load_misses, 1);
    }

    #[test]
    fn duplicate_store_replaces_the_page() {
        let (dmem, region) = backend(4, 1);
        dmem.store(PoolId(0), &1, &page(1)).unwrap();
        dmem.store(PoolId(0), &1, &page(2)).unwrap();
        let mut out = page(0);
        assert_eq!(dmem.load(PoolId(0), &1, &mut out), Ok(true));
        assert_eq!(out, page(2));
        assert_eq!(region.occupied_pages(), 1);
        assert_eq!(dmem.lru_len(), 1);
        assert_eq!(dmem.stats().duplicates, 1);
    }

    #[test]
    fn wrong_sizes_are_rejected() {
        let (dmem, _) = backend(1, 1);
        assert_eq!(
            dmem.store(PoolId(0), &1, &[0; 16]),
            Err(StoreError::BadLength { len: 16 })
        );
        let mut small = [0u8; 8];
        assert_eq!(
            dmem.load(PoolId(0), &1, &mut small),
            Err(LoadError::BadLength { len: 8 })
        );
    }

    #[test]
    fn unknown_pool_is_an_error() {
        let (dmem, _) = backend(1, 1);
        assert_eq!(
            dmem.store(PoolId(9), &1, &page(0)),
            Err(StoreError::Pool(PoolError::NoSuchPool(PoolId(9))))
        );
        assert_eq!(dmem.invalidate(PoolId(9), &1), Err(PoolError::NoSuchPool(PoolId(9))));
        assert_eq!(dmem.create_pool(PoolId(0)), Err(PoolError::PoolExists(PoolId(0))));
    }

    #[test]
    fn full_region_evicts_the_oldest() {
        let (dmem, region) = backend(2, 1);
        dmem.store(PoolId(0), &1, &page(1)).unwrap();
        dmem.store(PoolId(0), &2, &page(2)).unwrap();
        dmem.store(PoolId(0), &3, &page(3)).unwrap();

        let mut out = page(0);
        assert_eq!(dmem.load(PoolId(0), &1, &mut out), Ok(false));
        assert_eq!(dmem.lru_keys_from_tail(), [2, 3]);
        assert_eq!(dmem.stats().evictions, 1);
        assert_eq!(region.occupied_pages(), 2);
    }

    #[test]
    fn load_moves_entry_to_head() {
        let (dmem, _) = backend(4, 1);
        for k in 1..=3 {
            dmem.store(PoolId(0), &k, &page(0)).unwrap();
        }
        let mut out = page(0);
        dmem.load(PoolId(0), &1, &mut out).unwrap();
        assert_eq!(dmem.lru_keys_from_tail(), [2, 3, 1]);
    }

    #[test]
    fn invalidate_frees_the_page() {
        let (dmem, region) = backend(2, 1);
        dmem.store(PoolId(0), &5, &page(5)).unwrap();
        assert_eq!(dmem.invalidate(PoolId(0), &5), Ok(true));
        assert_eq!(dmem.invalidate(PoolId(0), &5), Ok(false));
        assert_eq!(region.occupied_pages(), 0);
        assert_eq!(dmem.lru_len(), 0);
        assert_eq!(dmem.stats().invalidates, 1);
    }

    #[test]
    fn range_invalidation_keeps_other_keys() {
        let (dmem, region) = backend(8, 1);
        for k in 0..6 {
            dmem.store(PoolId(0), &k, &page(0)).unwrap();
        }
        assert_eq!(dmem.invalidate_range(PoolId(0), 2..4), Ok(2));
        assert_eq!(dmem.len(), 4);
        assert_eq!(dmem.invalidate_pool(PoolId(0)), Ok(4));
        assert_eq!(region.occupied_pages(), 0);
        assert!(dmem.has_pool(PoolId(0)));
    }

    #[test]
    fn destroyed_pool_rejects_stores() {
        let (dmem, region) = backend(4, 1);
        dmem.store(PoolId(0), &1, &page(0)).unwrap();
        assert_eq!(dmem.destroy_pool(PoolId(0)), Ok(1));
        assert_eq!(region.occupied_pages(), 0);
        assert_eq!(
            dmem.store(PoolId(0), &1, &page(0)),
            Err(StoreError::Pool(PoolError::NoSuchPool(PoolId(0))))
        );
    }

    #[test]
    fn pool_ids_fill_gaps() {
        let (dmem, _) = backend(1, 1);
        assert_eq!(dmem.create_any_pool(), Ok(PoolId(1)));
        assert_eq!(dmem.create_any_pool(), Ok(PoolId(2)));
        dmem.destroy_pool(PoolId(1)).unwrap();
        assert_eq!(dmem.create_any_pool(), Ok(PoolId(1)));
    }

    #[test]
    fn claim_takes_cached_pages() {
        let (dmem, region) = backend(2, 1);
        dmem.store(PoolId(0), &1, &page(1)).unwrap();
        dmem.store(PoolId(0), &2, &page(2)).unwrap();

        let report = region.claim_area(Pfn::new(0x40), 2).unwrap();
        assert_eq!(report.reclaimed, 2);
        assert_eq!(region.isolated_pages(), 2);
        assert!(dmem.is_empty());
        assert_eq!(dmem.stats().reclaims, 2);

        // Nothing left to evict, so stores fail until the range is released.
        assert_eq!(dmem.store(PoolId(0), &3, &page(3)), Err(StoreError::OutOfPages));
        region.release_area(Pfn::new(0x40), 2).unwrap();
        dmem.store(PoolId(0), &3, &page(3)).unwrap();
        assert_eq!(region.state(Pfn::new(0x40)), Some(PageState::Owned));
    }

    #[test]
    fn dropping_the_backend_returns_its_pages() {
        let (dmem, region) = backend(4, 1);
        for k in 0..3 {
            dmem.store(PoolId(0), &k, &page(0)).unwrap();
        }
        drop(dmem);
        assert_eq!(region.occupied_pages(), 0);
        assert!(region.is_consistent());
    }
}
