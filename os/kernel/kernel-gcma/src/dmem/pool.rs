use super::entry::Entry;
use super::key::DmemKey;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_sync::SpinLock;

/// Identifier of a pool inside one backend: a swap type or a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(pub u32);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// One hash bucket: an ordered index under its own lock.
pub(crate) struct Bucket<K: DmemKey> {
    pub(crate) index: SpinLock<BTreeMap<K, Arc<Entry<K>>>>,
}

impl<K: DmemKey> Bucket<K> {
    const fn new() -> Self {
        Self {
            index: SpinLock::new(BTreeMap::new()),
        }
    }
}

pub(crate) struct Pool<K: DmemKey> {
    id: PoolId,
    buckets: Vec<Arc<Bucket<K>>>,
    /// Cleared before the pool is drained; checked by stores under the
    /// bucket lock so nothing is inserted behind the drain.
    alive: AtomicBool,
}

impl<K: DmemKey> Pool<K> {
    /// `bucket_count` must be a power of two.
    pub(crate) fn new(id: PoolId, bucket_count: usize) -> Self {
        debug_assert!(bucket_count.is_power_of_two());
        Self {
            id,
            buckets: (0..bucket_count).map(|_| Arc::new(Bucket::new())).collect(),
            alive: AtomicBool::new(true),
        }
    }

    pub(crate) const fn id(&self) -> PoolId {
        self.id
    }

    pub(crate) fn bucket(&self, key: &K) -> &Arc<Bucket<K>> {
        let mask = self.buckets.len() - 1;
        // Only the low bits select the bucket.
        #[allow(clippy::cast_possible_truncation)]
        let idx = key.bucket_hash() as usize & mask;
        &self.buckets[idx]
    }

    pub(crate) fn buckets(&self) -> &[Arc<Bucket<K>>] {
        &self.buckets
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Entries currently indexed.
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.index.lock().len()).sum()
    }
}
