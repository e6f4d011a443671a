//! Page frame numbers and contiguous frame ranges.

use core::fmt;
use core::ops::{Add, Range};

/// log2 of the page size managed by every region.
pub const PAGE_SHIFT: u32 = 12;

/// Bytes per page.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Physical page frame number (physical address >> [`PAGE_SHIFT`]).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Frame that contains the physical address `pa`.
    #[inline]
    #[must_use]
    pub const fn containing(pa: u64) -> Self {
        Self(pa >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Physical address of the first byte of this frame.
    #[inline]
    #[must_use]
    pub const fn phys_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    /// Align down to a multiple of `pages` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, pages: usize) -> Self {
        debug_assert!(pages.is_power_of_two());
        Self(self.0 & !(pages as u64 - 1))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, pages: usize) -> Option<Self> {
        match self.0.checked_add(pages as u64) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Number of frames from `base` up to `self`, if `self >= base`.
    #[inline]
    #[must_use]
    pub fn distance_from(self, base: Self) -> Option<usize> {
        self.0
            .checked_sub(base.0)
            .and_then(|d| usize::try_from(d).ok())
    }
}

impl Add<usize> for Pfn {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs as u64)
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A non-empty run of physically contiguous frames `[start, start + count)`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PfnRange {
    start: Pfn,
    count: usize,
}

impl PfnRange {
    /// `None` for an empty range or one that overflows the frame space.
    #[must_use]
    pub const fn new(start: Pfn, count: usize) -> Option<Self> {
        if count == 0 || start.checked_add(count).is_none() {
            return None;
        }
        Some(Self { start, count })
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> Pfn {
        self.start
    }

    /// One past the last frame.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> Pfn {
        Pfn(self.start.0 + self.count as u64)
    }

    #[inline]
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pfn: Pfn) -> bool {
        pfn.0 >= self.start.0 && pfn.0 < self.end().0
    }

    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        other.start.0 >= self.start.0 && other.end().0 <= self.end().0
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.0 < other.end().0 && other.start.0 < self.end().0
    }

    /// Index of `pfn` relative to [`start`](Self::start), if inside.
    #[inline]
    #[must_use]
    pub fn offset_of(&self, pfn: Pfn) -> Option<usize> {
        if self.contains(pfn) {
            pfn.distance_from(self.start)
        } else {
            None
        }
    }

    /// Slot indices covered by `other` within `self`.
    #[must_use]
    pub fn index_range(&self, other: &Self) -> Option<Range<usize>> {
        if !self.contains_range(other) {
            return None;
        }
        let first = other.start.distance_from(self.start)?;
        Some(first..first + other.count)
    }
}

impl fmt::Debug for PfnRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PfnRange({}..{})", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_addr_roundtrip() {
        let pfn = Pfn::containing(0x1234_5678);
        assert_eq!(pfn.as_u64(), 0x12345);
        assert_eq!(pfn.phys_addr(), 0x1234_5000);
    }

    #[test]
    fn align_down_to_window() {
        assert_eq!(Pfn::new(0x1ff).align_down(512), Pfn::new(0));
        assert_eq!(Pfn::new(0x201).align_down(512), Pfn::new(0x200));
    }

    #[test]
    fn empty_range_is_rejected() {
        assert!(PfnRange::new(Pfn::new(10), 0).is_none());
        assert!(PfnRange::new(Pfn::new(u64::MAX), 2).is_none());
    }

    #[test]
    fn range_queries() {
        let r = PfnRange::new(Pfn::new(100), 10).unwrap();
        assert!(r.contains(Pfn::new(100)));
        assert!(r.contains(Pfn::new(109)));
        assert!(!r.contains(Pfn::new(110)));
        assert_eq!(r.offset_of(Pfn::new(105)), Some(5));
        assert_eq!(r.offset_of(Pfn::new(99)), None);

        let inner = PfnRange::new(Pfn::new(104), 4).unwrap();
        assert_eq!(r.index_range(&inner), Some(4..8));

        let straddling = PfnRange::new(Pfn::new(108), 4).unwrap();
        assert!(r.overlaps(&straddling));
        assert_eq!(r.index_range(&straddling), None);
    }
}
