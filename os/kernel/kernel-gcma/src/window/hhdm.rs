use super::{WindowError, WindowMapper};
use crate::pfn::Pfn;
use core::ptr::NonNull;

/// [`WindowMapper`] for kernels with a higher-half direct map (HHDM).
///
/// Every frame is permanently reachable at `hhdm_base + phys_addr`, so a
/// "mapping" is address arithmetic and unmapping is a no-op. Useful when the
/// reserved range is covered by the direct map after all, e.g. on boards
/// where the region is small enough not to matter.
///
/// # Safety
/// The direct map must cover every frame of the region the window serves.
#[derive(Debug, Clone, Copy)]
pub struct HhdmWindowMapper {
    hhdm_base: u64,
}

impl HhdmWindowMapper {
    #[must_use]
    pub const fn new(hhdm_base: u64) -> Self {
        Self { hhdm_base }
    }
}

impl WindowMapper for HhdmWindowMapper {
    fn map(&self, base: Pfn, pages: usize) -> Result<NonNull<u8>, WindowError> {
        let va = self
            .hhdm_base
            .checked_add(base.phys_addr())
            .and_then(|va| usize::try_from(va).ok())
            .ok_or(WindowError::MapFailed { base, pages })?;
        NonNull::new(va as *mut u8).ok_or(WindowError::MapFailed { base, pages })
    }

    unsafe fn unmap(&self, _va: NonNull<u8>, _base: Pfn, _pages: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_by_offset() {
        let m = HhdmWindowMapper::new(0xffff_8880_0000_0000);
        let va = m.map(Pfn::new(0x1234), 8).unwrap();
        assert_eq!(va.as_ptr() as u64, 0xffff_8880_0123_4000);
    }

    #[test]
    fn overflow_is_a_map_failure() {
        let m = HhdmWindowMapper::new(u64::MAX);
        assert_eq!(
            m.map(Pfn::new(1), 1),
            Err(WindowError::MapFailed {
                base: Pfn::new(1),
                pages: 1
            })
        );
    }
}
