use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-backend counters.
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) stores: AtomicU64,
    pub(crate) store_failures: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) loads: AtomicU64,
    pub(crate) load_misses: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) reclaims: AtomicU64,
    pub(crate) invalidates: AtomicU64,
}

impl Counters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DmemStats {
        DmemStats {
            stores: self.stores.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_misses: self.load_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            invalidates: self.invalidates.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a backend's counters.
///
/// Every successful store and load is counted exactly once, as is every
/// entry evicted from the LRU, taken by a claim, or invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmemStats {
    pub stores: u64,
    /// Stores dropped for lack of pages or a failed window mapping.
    pub store_failures: u64,
    /// Stores that replaced an entry with the same key.
    pub duplicates: u64,
    pub loads: u64,
    pub load_misses: u64,
    pub evictions: u64,
    pub reclaims: u64,
    pub invalidates: u64,
}
