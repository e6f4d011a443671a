use super::Shared;
use super::key::DmemKey;
use super::lru::{Lru, UNLINKED};
use super::pool::Bucket;
use super::stats::Counters;
use crate::pfn::Pfn;
use crate::region::{Reclaimable, Region};
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use log::{trace, warn};

/// One cached page.
///
/// `refcount` counts logical holders: one for the bucket index while the
/// entry is indexed, plus one per in-flight load, eviction or claim. It is
/// raised only under the bucket lock or the LRU lock, and it drops to zero
/// only in [`put`](Self::put) with both locks held, which unlinks the entry
/// and frees its page. The `Arc` around the entry only keeps the memory
/// alive; it says nothing about page ownership.
pub(crate) struct Entry<K: DmemKey> {
    key: K,
    region: Arc<Region>,
    pfn: Pfn,
    refcount: AtomicUsize,
    /// LRU sequence, [`UNLINKED`] while off the list.
    pub(crate) lru_seq: AtomicU64,
    bucket: Weak<Bucket<K>>,
    shared: Arc<Shared<K>>,
}

impl<K: DmemKey> Entry<K> {
    pub(crate) fn new(key: K, region: Arc<Region>, pfn: Pfn, bucket: Weak<Bucket<K>>, shared: Arc<Shared<K>>) -> Self {
        Self {
            key,
            region,
            pfn,
            refcount: AtomicUsize::new(1),
            lru_seq: AtomicU64::new(UNLINKED),
            bucket,
            shared,
        }
    }

    pub(crate) const fn key(&self) -> &K {
        &self.key
    }

    pub(crate) const fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub(crate) const fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Take a reference. Caller holds the bucket lock or the LRU lock.
    pub(crate) fn get(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "get on a released entry");
    }

    /// Drop a reference. Caller holds the bucket lock (if the bucket still
    /// exists) and passes the locked LRU.
    pub(crate) fn put(&self, lru: &mut Lru<K>) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "put on a released entry");
        if prev == 1 {
            lru.unlink(self);
            trace!("dmem: release {:?} at {}", self.key, self.pfn);
            if let Err(e) = self.region.free_page(self.pfn) {
                warn!("dmem: releasing {:?}: {e}", self.key);
            }
        }
    }

    /// Whether `self` is the entry stored for its key in `index`.
    fn is_indexed_in(&self, index: &alloc::collections::BTreeMap<K, Arc<Self>>) -> bool {
        index
            .get(&self.key)
            .is_some_and(|current| core::ptr::eq(Arc::as_ptr(current), self))
    }

    /// Finish an entry that was pinned and taken off the LRU: erase it from
    /// its index if it is still there, then drop the pin.
    pub(crate) fn drop_detached(&self) {
        if let Some(bucket) = self.bucket.upgrade() {
            let mut index = bucket.index.lock();
            let mut lru = self.shared.lru.lock();
            if self.is_indexed_in(&index) {
                let erased = index.remove(&self.key);
                self.put(&mut lru);
                drop(erased);
            }
            self.put(&mut lru);
        } else {
            // Pool torn down; the index reference is already gone.
            self.put(&mut self.shared.lru.lock());
        }
    }
}

impl<K: DmemKey> Reclaimable for Entry<K> {
    fn detach_for_reclaim(&self, mark: &mut dyn FnMut()) -> bool {
        let mut lru = self.shared.lru.lock();
        if !lru.unlink(self) {
            return false;
        }
        self.get();
        mark();
        true
    }

    fn finish_reclaim(&self, claimed: bool) {
        self.drop_detached();
        if claimed {
            Counters::bump(&self.shared.stats.reclaims);
        }
    }
}
