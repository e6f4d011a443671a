//! # Claim / Release
//!
//! First-class clients take a contiguous frame range away from the cache
//! with [`Region::claim_area`] and give it back with
//! [`Region::release_area`].
//!
//! A claim never steals a bit. It marks cache-owned frames as
//! [`Reclaiming`](crate::PageState::Reclaiming), drops the cache's
//! references through the same path eviction uses, and lets the ordinary
//! free of the last reference convert the frame to
//! [`Isolated`](crate::PageState::Isolated). Frames that are in flight
//! (being published by a store, or already detached by an eviction) are
//! skipped and picked up by the next sweep.
//!
//! Sweeps repeat until the whole range is isolated or the configured pass
//! limit is hit, in which case the claim reports itself as stalled instead
//! of spinning forever.

use crate::pfn::Pfn;
use crate::region::{PageState, Reclaimable, Region, RegionError, Slot};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::ops::Range;
use core::sync::atomic::Ordering;
use log::{debug, trace, warn};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimError {
    #[error(transparent)]
    Region(#[from] RegionError),
    /// The range did not converge within the pass limit. Frames isolated so
    /// far stay isolated, and frames still waiting on an in-flight user stay
    /// reclaiming; [`Region::release_area`] gives both back.
    #[error("claim stalled at frame {pfn} after {passes} passes")]
    Stalled { pfn: Pfn, passes: usize },
}

/// What a successful claim had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimReport {
    /// Frames that were free and isolated directly.
    pub isolated_free: usize,
    /// Frames taken away from the cache.
    pub reclaimed: usize,
    /// Sweeps over the (remaining) range.
    pub passes: usize,
}

enum Sweep {
    IsolatedFree,
    /// Detached from the cache; `bool` tells whether the slot was tagged.
    Queued(Arc<dyn Reclaimable>, bool),
    Skipped,
}

impl Region {
    /// Take exclusive ownership of `[start, start + count)`.
    ///
    /// Returns once every frame of the range is isolated and no cache entry
    /// refers to it.
    ///
    /// # Errors
    /// - [`ClaimError::Region`] if the range is empty or not inside the region.
    /// - [`ClaimError::Stalled`] if concurrent cache activity kept the range
    ///   from converging within `claim_pass_limit` sweeps.
    pub fn claim_area(&self, start: Pfn, count: usize) -> Result<ClaimReport, ClaimError> {
        let indices = self.indices(start, count)?;
        self.counters.claims.fetch_add(1, Ordering::Relaxed);
        debug!("claim {start}+{count}");

        let mut report = ClaimReport::default();
        let mut from = indices.start;
        loop {
            report.passes += 1;
            self.counters.claim_passes.fetch_add(1, Ordering::Relaxed);

            let mut queued = Vec::new();
            for idx in from..indices.end {
                match self.sweep_one(idx) {
                    Sweep::IsolatedFree => report.isolated_free += 1,
                    Sweep::Queued(owner, marked) => queued.push((owner, marked)),
                    Sweep::Skipped => {}
                }
            }

            for (owner, marked) in queued {
                owner.finish_reclaim(marked);
                if marked {
                    report.reclaimed += 1;
                }
            }

            let Some(pending) = self.first_not_isolated(from..indices.end) else {
                debug!(
                    "claim {start}+{count} done: {} free, {} reclaimed, {} passes",
                    report.isolated_free, report.reclaimed, report.passes
                );
                return Ok(report);
            };

            let pfn = self.range().start() + pending;
            if report.passes >= self.config.claim_pass_limit {
                self.counters.stalled_claims.fetch_add(1, Ordering::Relaxed);
                warn!("claim {start}+{count} stalled at {pfn} after {} passes", report.passes);
                return Err(ClaimError::Stalled {
                    pfn,
                    passes: report.passes,
                });
            }

            self.counters.claim_retries.fetch_add(1, Ordering::Relaxed);
            trace!("claim {start}+{count} retrying from {pfn}");
            from = pending;
            for _ in 0..self.config.claim_backoff_spins {
                spin_loop();
            }
        }
    }

    /// Return `[start, start + count)` to the free pool.
    ///
    /// Always completes immediately. Isolated frames are freed. Frames a
    /// claim is still waiting for go back to their cache owner, so the
    /// pending free returns them to the free pool instead of isolating them
    /// for a claimant that is gone. Owned frames are not the claimant's to
    /// give back and are left alone. Returns the number of frames freed
    /// right away.
    ///
    /// # Errors
    /// [`RegionError`] if the range is empty or not inside the region.
    pub fn release_area(&self, start: Pfn, count: usize) -> Result<usize, RegionError> {
        let indices = self.indices(start, count)?;
        let mut released = 0;
        let mut cancelled = 0;
        let mut foreign = 0;
        {
            let mut inner = self.inner.lock();
            for idx in indices {
                match inner.state(idx) {
                    PageState::Isolated => {
                        inner.set(idx, Slot::Free);
                        released += 1;
                    }
                    PageState::Reclaiming => {
                        let slot = &mut inner.slots[idx];
                        if let Slot::Reclaiming(owner) = slot {
                            *slot = Slot::Owned(Some(Arc::clone(owner)));
                            cancelled += 1;
                        }
                    }
                    PageState::Free => {}
                    PageState::Owned => foreign += 1,
                }
            }
        }
        if cancelled > 0 {
            debug!("release {start}+{count}: {cancelled} pending hand-offs cancelled");
        }
        if foreign > 0 {
            warn!("release {start}+{count}: {foreign} frames were not isolated");
        }
        debug!("release {start}+{count}: {released} frames freed");
        Ok(released)
    }

    /// One step of a sweep for the frame at slot `idx`.
    fn sweep_one(&self, idx: usize) -> Sweep {
        let owner = {
            let mut inner = self.inner.lock();
            match inner.state(idx) {
                PageState::Free => {
                    inner.set(idx, Slot::Isolated);
                    return Sweep::IsolatedFree;
                }
                PageState::Owned => match &inner.slots[idx] {
                    Slot::Owned(Some(owner)) => Arc::clone(owner),
                    // Still being published by a store.
                    _ => return Sweep::Skipped,
                },
                PageState::Reclaiming | PageState::Isolated => return Sweep::Skipped,
            }
        };

        let mut marked = false;
        let detached = owner.detach_for_reclaim(&mut || marked = self.mark_reclaiming(idx, &owner));
        if !detached {
            return Sweep::Skipped;
        }
        if !marked {
            // The pin must still be dropped; the frame then frees normally
            // and the next sweep isolates it.
            warn!("frame {} changed owner during claim", self.range().start() + idx);
        }
        Sweep::Queued(owner, marked)
    }

    /// Tag the slot as reclaiming if `owner` still holds it.
    fn mark_reclaiming(&self, idx: usize, owner: &Arc<dyn Reclaimable>) -> bool {
        let mut inner = self.inner.lock();
        let same = matches!(
            &inner.slots[idx],
            Slot::Owned(Some(current)) if core::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(owner))
        );
        if same {
            inner.set(idx, Slot::Reclaiming(Arc::clone(owner)));
        }
        same
    }

    fn first_not_isolated(&self, indices: Range<usize>) -> Option<usize> {
        let inner = self.inner.lock();
        indices.into_iter().find(|&idx| inner.state(idx) != PageState::Isolated)
    }
}
