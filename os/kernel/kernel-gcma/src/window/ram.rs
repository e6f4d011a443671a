use super::{WindowError, WindowMapper};
use crate::pfn::{PAGE_SIZE, Pfn, PfnRange};
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

/// [`WindowMapper`] over heap memory that stands in for a reserved range.
///
/// Hosted builds have no physical memory to map, so this mapper owns one
/// page-aligned buffer with a page per frame of `range` and "maps" windows
/// by handing out pointers into it. It tracks live mappings so callers can
/// check that windows are released.
pub struct RamWindowMapper {
    range: PfnRange,
    memory: NonNull<u8>,
    layout: Layout,
    live: AtomicUsize,
}

// Safety: the buffer is only reached through window guards, which serialize
// through the window lock and frame ownership.
unsafe impl Send for RamWindowMapper {}
unsafe impl Sync for RamWindowMapper {}

impl RamWindowMapper {
    /// Allocate zeroed backing memory for every frame of `range`.
    ///
    /// # Panics
    /// If the range is too large to describe as a single allocation.
    #[must_use]
    pub fn new(range: PfnRange) -> Self {
        let bytes = range
            .count()
            .checked_mul(PAGE_SIZE)
            .expect("backing memory size overflows usize");
        let layout = Layout::from_size_align(bytes, PAGE_SIZE).expect("invalid backing layout");
        // Safety: non-zero size, PfnRange is never empty.
        let memory = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));
        Self {
            range,
            memory,
            layout,
            live: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn range(&self) -> PfnRange {
        self.range
    }

    /// Mappings handed out and not yet unmapped.
    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Snapshot of one frame's bytes, bypassing the window.
    ///
    /// Racy against concurrent writers of that frame; meant for inspection
    /// at quiescent points.
    #[must_use]
    pub fn frame(&self, pfn: Pfn) -> Option<Vec<u8>> {
        let idx = self.range.offset_of(pfn)?;
        // Safety: idx is inside the buffer.
        let page = unsafe { core::slice::from_raw_parts(self.memory.as_ptr().add(idx * PAGE_SIZE), PAGE_SIZE) };
        Some(page.to_vec())
    }
}

impl WindowMapper for RamWindowMapper {
    fn map(&self, base: Pfn, pages: usize) -> Result<NonNull<u8>, WindowError> {
        let window = PfnRange::new(base, pages).ok_or(WindowError::MapFailed { base, pages })?;
        let idx = self
            .range
            .index_range(&window)
            .ok_or(WindowError::MapFailed { base, pages })?
            .start;
        self.live.fetch_add(1, Ordering::AcqRel);
        // Safety: the whole window lies inside the buffer.
        Ok(unsafe { self.memory.add(idx * PAGE_SIZE) })
    }

    unsafe fn unmap(&self, _va: NonNull<u8>, _base: Pfn, _pages: usize) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for RamWindowMapper {
    fn drop(&mut self) {
        // Safety: allocated in `new` with this layout.
        unsafe { dealloc(self.memory.as_ptr(), self.layout) };
    }
}
