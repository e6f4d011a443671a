//! # Region Allocator
//!
//! A region is a fixed run of reserved frames that the general page
//! allocator never sees. Per frame it keeps one occupancy bit and one slot
//! with an explicit ownership tag:
//!
//! ```text
//!            alloc_page               free_page
//!   Free ──────────────────► Owned ─────────────► Free
//!    │                        │  ▲
//!    │ claim            claim │  │ release_area (claim given up)
//!    ▼                        ▼  │
//! Isolated ◄──────────── Reclaiming
//!    │       free_page
//!    │       (hand-off)
//!    └── release_area ──► Free
//! ```
//!
//! The occupancy bit is set iff the slot is not [`PageState::Free`]. Slots
//! are an arena indexed by frame offset; there is no per-frame descriptor
//! outside this table.
//!
//! Lock order: a cache entry's bucket lock, then its backend's LRU lock,
//! then the region lock. The region lock is a leaf.

use crate::config::GcmaConfig;
use crate::pfn::{Pfn, PfnRange};
use crate::window::{PhysicalWindow, WindowMapper};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::SpinLock;
use log::{trace, warn};
use thiserror::Error;

/// The cache-side owner of a frame, as seen by the claim protocol.
///
/// Implemented by cache entries. The region stores the owner in the slot so
/// a claimant walking frames can reach the entry that holds a page.
pub trait Reclaimable: Send + Sync {
    /// Pin the owner and unlink it from its LRU list.
    ///
    /// Returns `false` without side effects if the owner is not currently
    /// linked (still being published, or already detached by an eviction).
    /// On success `mark` runs while the LRU lock is still held, so nobody can
    /// free the frame between detaching and marking.
    fn detach_for_reclaim(&self, mark: &mut dyn FnMut()) -> bool;

    /// Undo the pin taken by [`detach_for_reclaim`](Self::detach_for_reclaim)
    /// and erase the owner from its index if it is still there.
    ///
    /// `claimed` tells whether the frame was tagged for the claimant; when it
    /// was not, the frame goes back to the free pool instead.
    fn finish_reclaim(&self, claimed: bool);
}

/// Ownership tag of one frame, including the owner reference.
#[derive(Default)]
pub(crate) enum Slot {
    #[default]
    Free,
    /// `None` between allocation and publication of the owning entry.
    Owned(Option<Arc<dyn Reclaimable>>),
    Reclaiming(Arc<dyn Reclaimable>),
    Isolated,
}

impl Slot {
    const fn state(&self) -> PageState {
        match self {
            Self::Free => PageState::Free,
            Self::Owned(_) => PageState::Owned,
            Self::Reclaiming(_) => PageState::Reclaiming,
            Self::Isolated => PageState::Isolated,
        }
    }
}

/// Observable ownership state of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    Free,
    Owned,
    Reclaiming,
    Isolated,
}

/// What [`Region::free_page`] did with the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Returned to the free pool.
    Freed,
    /// A claim was waiting for it; now isolated for the claimant.
    HandedOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("empty or overflowing frame range starting at {start}")]
    InvalidRange { start: Pfn },
    #[error("range {start}+{count} is not inside the region")]
    OutOfRegion { start: Pfn, count: usize },
    #[error("range overlaps a registered region")]
    Overlap,
    #[error("frame {pfn} is not owned by the cache (state {state:?})")]
    NotOwned { pfn: Pfn, state: PageState },
    #[error("region still has {occupied} occupied frames")]
    Busy { occupied: usize },
    #[error("region is not registered")]
    NotRegistered,
}

/// Bitmap plus slot arena, guarded together by the region lock.
pub(crate) struct RegionInner {
    bitmap: Vec<u64>,
    pub(crate) slots: Vec<Slot>,
    occupied: usize,
    /// Set once the region left its registry; no new allocations.
    retired: bool,
}

impl RegionInner {
    fn new(count: usize) -> Self {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, Slot::default);
        Self {
            bitmap: vec![0; count.div_ceil(64)],
            slots,
            occupied: 0,
            retired: false,
        }
    }

    #[inline]
    fn bit(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// First clear bit; linear scan from the start of the region.
    fn first_free(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(w, word)| w * 64 + word.trailing_ones() as usize)
            .filter(|&idx| idx < self.slots.len())
    }

    /// Install `slot` at `idx` and keep the bit and the counter in step.
    pub(crate) fn set(&mut self, idx: usize, slot: Slot) -> Slot {
        let was_free = !self.bit(idx);
        let now_free = matches!(slot, Slot::Free);
        let mask = 1u64 << (idx % 64);
        match (was_free, now_free) {
            (true, false) => {
                self.bitmap[idx / 64] |= mask;
                self.occupied += 1;
            }
            (false, true) => {
                self.bitmap[idx / 64] &= !mask;
                self.occupied -= 1;
            }
            _ => {}
        }
        core::mem::replace(&mut self.slots[idx], slot)
    }

    pub(crate) fn state(&self, idx: usize) -> PageState {
        self.slots[idx].state()
    }
}

#[derive(Default)]
pub(crate) struct RegionCounters {
    pub(crate) claims: AtomicU64,
    pub(crate) claim_passes: AtomicU64,
    pub(crate) claim_retries: AtomicU64,
    pub(crate) stalled_claims: AtomicU64,
    pub(crate) handoffs: AtomicU64,
}

/// Snapshot of a region's occupancy and claim diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub pages: usize,
    pub free: usize,
    pub owned: usize,
    pub reclaiming: usize,
    pub isolated: usize,
    pub claims: u64,
    pub claim_passes: u64,
    pub claim_retries: u64,
    pub stalled_claims: u64,
    pub handoffs: u64,
}

/// One reserved, physically contiguous frame range.
pub struct Region {
    range: PfnRange,
    pub(crate) inner: SpinLock<RegionInner>,
    window: PhysicalWindow,
    pub(crate) config: GcmaConfig,
    pub(crate) counters: RegionCounters,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region").field("range", &self.range).finish_non_exhaustive()
    }
}

impl Region {
    pub(crate) fn new(range: PfnRange, config: GcmaConfig, mapper: Arc<dyn WindowMapper>) -> Self {
        Self {
            range,
            inner: SpinLock::new(RegionInner::new(range.count())),
            window: PhysicalWindow::new(range, config.window_pages, mapper),
            config,
            counters: RegionCounters::default(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> PfnRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn window(&self) -> &PhysicalWindow {
        &self.window
    }

    /// Slot indices of `[start, start + count)`.
    pub(crate) fn indices(&self, start: Pfn, count: usize) -> Result<core::ops::Range<usize>, RegionError> {
        let sub = PfnRange::new(start, count).ok_or(RegionError::InvalidRange { start })?;
        self.range
            .index_range(&sub)
            .ok_or(RegionError::OutOfRegion { start, count })
    }

    /// Take the first free frame and mark it as owned, pending publication.
    ///
    /// First fit, O(pages) worst case. `None` if the region is full or
    /// retired.
    #[must_use]
    pub fn alloc_page(&self) -> Option<Pfn> {
        let mut inner = self.inner.lock();
        if inner.retired {
            return None;
        }
        let idx = inner.first_free()?;
        inner.set(idx, Slot::Owned(None));
        let pfn = self.range.start() + idx;
        trace!("alloc {pfn}");
        Some(pfn)
    }

    /// Return a cache-owned frame.
    ///
    /// An owned frame goes back to the free pool. A frame a claim is waiting
    /// for stays occupied and becomes isolated: this is the only point where
    /// ownership moves from the cache to a claimant.
    ///
    /// # Errors
    /// [`RegionError::NotOwned`] if the frame is outside the region or not
    /// held by the cache; the slot is left untouched.
    pub fn free_page(&self, pfn: Pfn) -> Result<FreeOutcome, RegionError> {
        let idx = self.range.offset_of(pfn).ok_or(RegionError::OutOfRegion { start: pfn, count: 1 })?;
        // Dropped after the lock: the owner may be the last reference.
        let previous;
        let outcome = {
            let mut inner = self.inner.lock();
            match inner.state(idx) {
                PageState::Owned => {
                    previous = inner.set(idx, Slot::Free);
                    FreeOutcome::Freed
                }
                PageState::Reclaiming => {
                    previous = inner.set(idx, Slot::Isolated);
                    FreeOutcome::HandedOff
                }
                state => {
                    warn!("free of frame {pfn} in state {state:?} ignored");
                    return Err(RegionError::NotOwned { pfn, state });
                }
            }
        };
        drop(previous);
        if outcome == FreeOutcome::HandedOff {
            self.counters.handoffs.fetch_add(1, Ordering::Relaxed);
        }
        trace!("free {pfn}: {outcome:?}");
        Ok(outcome)
    }

    /// Stop handing out frames if none is occupied.
    ///
    /// The check and the retirement happen under one region lock, so an
    /// allocation racing with it either lands first (and the region stays
    /// busy) or sees the region retired.
    ///
    /// # Errors
    /// [`RegionError::Busy`] with the occupied count; the region stays live.
    pub(crate) fn retire(&self) -> Result<(), RegionError> {
        let mut inner = self.inner.lock();
        if inner.occupied != 0 {
            return Err(RegionError::Busy { occupied: inner.occupied });
        }
        inner.retired = true;
        Ok(())
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.inner.lock().retired
    }

    /// Record the entry that owns a freshly allocated frame.
    ///
    /// Returns `false` if the frame is no longer a pending allocation.
    pub(crate) fn publish_owner(&self, pfn: Pfn, owner: Arc<dyn Reclaimable>) -> bool {
        let Some(idx) = self.range.offset_of(pfn) else {
            return false;
        };
        let mut inner = self.inner.lock();
        if matches!(inner.slots[idx], Slot::Owned(None)) {
            inner.slots[idx] = Slot::Owned(Some(owner));
            true
        } else {
            false
        }
    }

    /// Ownership state of `pfn`, `None` outside the region.
    #[must_use]
    pub fn state(&self, pfn: Pfn) -> Option<PageState> {
        let idx = self.range.offset_of(pfn)?;
        Some(self.inner.lock().state(idx))
    }

    /// Whether the occupancy bit of `pfn` is set.
    #[must_use]
    pub fn is_occupied(&self, pfn: Pfn) -> Option<bool> {
        let idx = self.range.offset_of(pfn)?;
        Some(self.inner.lock().bit(idx))
    }

    /// Number of frames whose occupancy bit is set.
    #[must_use]
    pub fn occupied_pages(&self) -> usize {
        self.inner.lock().occupied
    }

    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.range.count() - self.occupied_pages()
    }

    #[must_use]
    pub fn isolated_pages(&self) -> usize {
        self.count_state(PageState::Isolated)
    }

    fn count_state(&self, state: PageState) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| s.state() == state)
            .count()
    }

    #[must_use]
    pub fn stats(&self) -> RegionStats {
        let mut stats = RegionStats {
            pages: self.range.count(),
            claims: self.counters.claims.load(Ordering::Relaxed),
            claim_passes: self.counters.claim_passes.load(Ordering::Relaxed),
            claim_retries: self.counters.claim_retries.load(Ordering::Relaxed),
            stalled_claims: self.counters.stalled_claims.load(Ordering::Relaxed),
            handoffs: self.counters.handoffs.load(Ordering::Relaxed),
            ..RegionStats::default()
        };
        let inner = self.inner.lock();
        for slot in &inner.slots {
            match slot.state() {
                PageState::Free => stats.free += 1,
                PageState::Owned => stats.owned += 1,
                PageState::Reclaiming => stats.reclaiming += 1,
                PageState::Isolated => stats.isolated += 1,
            }
        }
        stats
    }

    /// Check that every occupancy bit agrees with its slot tag and that the
    /// occupied counter matches the bitmap.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        let bits_agree = (0..inner.slots.len()).all(|idx| inner.bit(idx) == (inner.state(idx) != PageState::Free));
        let set_bits: usize = inner.bitmap.iter().map(|w| w.count_ones() as usize).sum();
        bits_agree && set_bits == inner.occupied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::RamWindowMapper;

    /// Owner that is never on an LRU list.
    struct Inert;

    impl Reclaimable for Inert {
        fn detach_for_reclaim(&self, _mark: &mut dyn FnMut()) -> bool {
            false
        }

        fn finish_reclaim(&self, _claimed: bool) {}
    }

    fn region(start: u64, count: usize) -> Region {
        let range = PfnRange::new(Pfn::new(start), count).unwrap();
        Region::new(range, GcmaConfig::DEFAULT, Arc::new(RamWindowMapper::new(range)))
    }

    #[test]
    fn alloc_is_first_fit() {
        let r = region(0x100, 4);
        assert_eq!(r.alloc_page(), Some(Pfn::new(0x100)));
        assert_eq!(r.alloc_page(), Some(Pfn::new(0x101)));
        r.free_page(Pfn::new(0x100)).unwrap();
        assert_eq!(r.alloc_page(), Some(Pfn::new(0x100)));
    }

    #[test]
    fn alloc_fails_when_full() {
        let r = region(0, 3);
        for _ in 0..3 {
            assert!(r.alloc_page().is_some());
        }
        assert_eq!(r.alloc_page(), None);
        assert_eq!(r.occupied_pages(), 3);
        assert!(r.is_consistent());
    }

    #[test]
    fn allocation_crosses_bitmap_words() {
        let r = region(0, 130);
        for i in 0..130 {
            assert_eq!(r.alloc_page(), Some(Pfn::new(i)));
        }
        assert_eq!(r.alloc_page(), None);
        r.free_page(Pfn::new(97)).unwrap();
        assert_eq!(r.alloc_page(), Some(Pfn::new(97)));
        assert!(r.is_consistent());
    }

    #[test]
    fn free_of_unowned_frame_is_rejected() {
        let r = region(0, 2);
        assert_eq!(
            r.free_page(Pfn::new(1)),
            Err(RegionError::NotOwned {
                pfn: Pfn::new(1),
                state: PageState::Free
            })
        );
        assert_eq!(r.state(Pfn::new(1)), Some(PageState::Free));
    }

    #[test]
    fn free_while_reclaiming_hands_off() {
        let r = region(0, 2);
        let pfn = r.alloc_page().unwrap();
        // A claim marked the frame while the cache still held it.
        r.inner.lock().set(0, Slot::Reclaiming(Arc::new(Inert)));
        assert_eq!(r.free_page(pfn), Ok(FreeOutcome::HandedOff));
        assert_eq!(r.state(pfn), Some(PageState::Isolated));
        assert_eq!(r.is_occupied(pfn), Some(true));
        assert_eq!(r.stats().handoffs, 1);
        assert!(r.is_consistent());
    }

    #[test]
    fn publish_only_fills_pending_slots() {
        let r = region(0, 2);
        let pfn = r.alloc_page().unwrap();
        assert!(r.publish_owner(pfn, Arc::new(Inert)));
        assert!(!r.publish_owner(pfn, Arc::new(Inert)));
        assert!(!r.publish_owner(Pfn::new(1), Arc::new(Inert)));
    }
}
