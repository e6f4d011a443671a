//! # Physical Window Mapper
//!
//! Pages of a reserved region are deliberately left out of the kernel's
//! standing mappings, so touching their content needs a temporary virtual
//! mapping. Every region owns one sliding **window**: a mapping of up to
//! `window_pages` consecutive frames, aligned down to the window size and
//! clipped to the region bounds.
//!
//! ```text
//!  region   |------------------------------------------------------|
//!  windows  |   w0    |   w1    |   w2    |   w3    |   w4    | w5 |
//!                          ^ current mapping (read-locked by users)
//! ```
//!
//! [`PhysicalWindow::acquire`] hands out a [`WindowGuard`] holding the window
//! lock for read. A hit costs one read lock. A miss takes the lock for write,
//! replaces the mapping and downgrades back to read. Dropping the guard
//! releases the lock, so a mapping can never be leaked or torn down under a
//! concurrent copy.
//!
//! Between acquire and drop the holder performs exactly one page-sized copy.
//! Holding a guard across anything slower stalls every other user of the
//! region.

mod hhdm;
mod ram;

pub use hhdm::HhdmWindowMapper;
pub use ram::RamWindowMapper;

use crate::pfn::{PAGE_SIZE, Pfn, PfnRange};
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{RwSpinLock, RwSpinReadGuard};
use log::{trace, warn};
use thiserror::Error;

/// Backend that creates and destroys virtual mappings of physical frames.
///
/// Implementations decide *how* frames become addressable: a direct-map
/// offset, a fixmap slot, page-table edits, or plain host memory in tests.
pub trait WindowMapper: Send + Sync {
    /// Map `pages` frames starting at `base` and return the address of `base`.
    ///
    /// # Errors
    /// [`WindowError::MapFailed`] if the frames cannot be mapped.
    fn map(&self, base: Pfn, pages: usize) -> Result<NonNull<u8>, WindowError>;

    /// Tear down a mapping previously returned by [`map`](Self::map).
    ///
    /// # Safety
    /// `va`, `base` and `pages` must come from one successful `map` call and
    /// no reference into the mapping may outlive this call.
    unsafe fn unmap(&self, va: NonNull<u8>, base: Pfn, pages: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("frame {pfn} is outside the region")]
    OutOfRange { pfn: Pfn },
    #[error("failed to map {pages} frames at {base}")]
    MapFailed { base: Pfn, pages: usize },
}

/// The currently installed mapping.
struct Mapping {
    base: Pfn,
    pages: usize,
    va: NonNull<u8>,
}

// Safety: the pointer is only dereferenced while the window lock is held.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn page_ptr(&self, pfn: Pfn) -> Option<NonNull<u8>> {
        let idx = pfn.distance_from(self.base)?;
        if idx >= self.pages {
            return None;
        }
        // Safety: idx < pages, so the offset stays inside the mapping.
        Some(unsafe { self.va.add(idx * PAGE_SIZE) })
    }
}

/// Counters of one window; monotonic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub hits: u64,
    pub maps: u64,
    pub unmaps: u64,
    pub map_failures: u64,
}

/// Sliding mapping over a region's frames.
pub struct PhysicalWindow {
    range: PfnRange,
    window_pages: usize,
    mapper: Arc<dyn WindowMapper>,
    current: RwSpinLock<Option<Mapping>>,
    hits: AtomicU64,
    maps: AtomicU64,
    unmaps: AtomicU64,
    map_failures: AtomicU64,
}

impl PhysicalWindow {
    pub(crate) fn new(range: PfnRange, window_pages: usize, mapper: Arc<dyn WindowMapper>) -> Self {
        Self {
            range,
            window_pages: window_pages.max(1),
            mapper,
            current: RwSpinLock::new(None),
            hits: AtomicU64::new(0),
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
            map_failures: AtomicU64::new(0),
        }
    }

    /// The frames this window may cover for `pfn`: aligned down to the
    /// window size, clipped to the region.
    fn window_for(&self, pfn: Pfn) -> (Pfn, usize) {
        let aligned = pfn.align_down(self.window_pages);
        let base = aligned.max(self.range.start());
        let end = aligned
            .checked_add(self.window_pages)
            .map_or(self.range.end(), |end| end.min(self.range.end()));
        let pages = end.distance_from(base).unwrap_or(1);
        (base, pages)
    }

    /// Make `pfn` addressable and return a guard pointing at its first byte.
    ///
    /// # Errors
    /// - [`WindowError::OutOfRange`] if `pfn` is not part of the region.
    /// - [`WindowError::MapFailed`] if a new window had to be mapped and the
    ///   mapper refused.
    pub fn acquire(&self, pfn: Pfn) -> Result<WindowGuard<'_>, WindowError> {
        if !self.range.contains(pfn) {
            return Err(WindowError::OutOfRange { pfn });
        }

        {
            let current = self.current.read();
            if let Some(page) = current.as_ref().and_then(|m| m.page_ptr(pfn)) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(WindowGuard {
                    _lock: current,
                    page,
                });
            }
        }

        let mut current = self.current.write();
        // Another writer may have moved the window here meanwhile.
        if current.as_ref().and_then(|m| m.page_ptr(pfn)).is_none() {
            if let Some(old) = current.take() {
                trace!("unmapping window {}+{}", old.base, old.pages);
                // Safety: `old` came from `map`; the write lock excludes users.
                unsafe { self.mapper.unmap(old.va, old.base, old.pages) };
                self.unmaps.fetch_add(1, Ordering::Relaxed);
            }

            let (base, pages) = self.window_for(pfn);
            let va = self.mapper.map(base, pages).inspect_err(|e| {
                self.map_failures.fetch_add(1, Ordering::Relaxed);
                warn!("window map for {pfn} failed: {e}");
            })?;
            trace!("mapped window {base}+{pages} at {va:p}");
            self.maps.fetch_add(1, Ordering::Relaxed);
            *current = Some(Mapping { base, pages, va });
        }

        let current = current.downgrade();
        let page = current
            .as_ref()
            .and_then(|m| m.page_ptr(pfn))
            .ok_or(WindowError::MapFailed {
                base: pfn,
                pages: 1,
            })?;
        Ok(WindowGuard {
            _lock: current,
            page,
        })
    }

    #[must_use]
    pub fn stats(&self) -> WindowStats {
        WindowStats {
            hits: self.hits.load(Ordering::Relaxed),
            maps: self.maps.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
            map_failures: self.map_failures.load(Ordering::Relaxed),
        }
    }

    /// Frames covered by the current mapping, if any.
    #[must_use]
    pub fn mapped_range(&self) -> Option<PfnRange> {
        self.current
            .read()
            .as_ref()
            .and_then(|m| PfnRange::new(m.base, m.pages))
    }
}

impl Drop for PhysicalWindow {
    fn drop(&mut self) {
        if let Some(old) = self.current.get_mut().take() {
            // Safety: `&mut self` rules out live guards.
            unsafe { self.mapper.unmap(old.va, old.base, old.pages) };
        }
    }
}

/// Access to one mapped page; releases the window lock on drop.
pub struct WindowGuard<'a> {
    _lock: RwSpinReadGuard<'a, Option<Mapping>>,
    page: NonNull<u8>,
}

impl WindowGuard<'_> {
    /// Copy `src` into the page; returns the number of bytes written.
    ///
    /// The caller must be the page's exclusive owner: the window lock is only
    /// held for read, so two writers to the same frame would race.
    pub fn copy_from(&mut self, src: &[u8]) -> usize {
        let len = src.len().min(PAGE_SIZE);
        // Safety: the page is mapped while the guard lives and owned by the
        // caller; `len` is within one page.
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), self.page.as_ptr(), len) };
        len
    }

    /// Copy the page into `dst`; returns the number of bytes read.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let len = dst.len().min(PAGE_SIZE);
        // Safety: as in `copy_from`; readers never overlap a writer of the
        // same frame because a frame has one owner.
        unsafe { core::ptr::copy_nonoverlapping(self.page.as_ptr(), dst.as_mut_ptr(), len) };
        len
    }

    /// Read-only view of the page.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: mapped for the guard's lifetime, one page long.
        unsafe { core::slice::from_raw_parts(self.page.as_ptr(), PAGE_SIZE) }
    }
}
