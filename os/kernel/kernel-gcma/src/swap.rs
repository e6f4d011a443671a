//! # Swap Cache Backend
//!
//! Write-through cache for swapped-out pages. One pool per swap type
//! (swap device), keyed by the page offset inside the device.
//!
//! The swap subsystem only ever sees best-effort results: a page that could
//! not be cached goes to the device as usual, and a load that misses is read
//! from the device.

use crate::dmem::{Dmem, DmemKey, DmemStats, LoadError, PoolError, PoolId, StoreError, mix64};
use crate::registry::RegionRegistry;
use alloc::sync::Arc;
use log::{debug, info};

/// Swap types a kernel may have active at once.
pub const MAX_SWAPFILES: u32 = 32;

/// Offset of a page inside its swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapKey(pub u64);

impl DmemKey for SwapKey {
    #[inline]
    fn bucket_hash(&self) -> u64 {
        mix64(self.0)
    }
}

pub struct SwapCache {
    dmem: Dmem<SwapKey>,
}

impl SwapCache {
    #[must_use]
    pub fn new(registry: Arc<RegionRegistry>) -> Self {
        Self {
            dmem: Dmem::new("gcma-swap", registry),
        }
    }

    const fn pool_of(swap_type: u32) -> Result<PoolId, PoolError> {
        if swap_type < MAX_SWAPFILES {
            Ok(PoolId(swap_type))
        } else {
            Err(PoolError::InvalidSwapType(swap_type))
        }
    }

    /// Prepare the pool of a swap device being enabled.
    ///
    /// Re-enabling a swap type starts from an empty pool; anything left over
    /// from its previous life is dropped.
    ///
    /// # Errors
    /// [`PoolError::InvalidSwapType`] if `swap_type` is not below
    /// [`MAX_SWAPFILES`].
    pub fn init(&self, swap_type: u32) -> Result<(), PoolError> {
        let pool = Self::pool_of(swap_type)?;
        match self.dmem.create_pool(pool) {
            Err(PoolError::PoolExists(_)) => {
                let stale = self.dmem.invalidate_pool(pool)?;
                info!("gcma-swap: swap type {swap_type} re-initialized, {stale} stale pages dropped");
                Ok(())
            }
            other => other,
        }
    }

    /// # Errors
    /// See [`Dmem::store`].
    pub fn store(&self, swap_type: u32, offset: u64, page: &[u8]) -> Result<(), StoreError> {
        self.dmem.store(Self::pool_of(swap_type)?, &SwapKey(offset), page)
    }

    /// Returns `Ok(false)` on a miss.
    ///
    /// # Errors
    /// See [`Dmem::load`].
    pub fn load(&self, swap_type: u32, offset: u64, out: &mut [u8]) -> Result<bool, LoadError> {
        self.dmem.load(Self::pool_of(swap_type)?, &SwapKey(offset), out)
    }

    /// Best-effort store. Returns whether the page is now cached; on `false`
    /// the caller writes to the device and nothing stale stays behind.
    pub fn put_page(&self, swap_type: u32, offset: u64, page: &[u8]) -> bool {
        self.store(swap_type, offset, page)
            .inspect_err(|e| debug!("gcma-swap: put {swap_type}:{offset} dropped: {e}"))
            .is_ok()
    }

    /// Fill `out` from the cache. Returns `false` if the caller must read the
    /// device instead.
    pub fn get_page(&self, swap_type: u32, offset: u64, out: &mut [u8]) -> bool {
        self.load(swap_type, offset, out)
            .inspect_err(|e| debug!("gcma-swap: get {swap_type}:{offset} failed: {e}"))
            .unwrap_or(false)
    }

    /// Forget one swap slot. Returns whether it was cached.
    pub fn invalidate_page(&self, swap_type: u32, offset: u64) -> bool {
        Self::pool_of(swap_type)
            .and_then(|pool| self.dmem.invalidate(pool, &SwapKey(offset)))
            .unwrap_or(false)
    }

    /// Swapoff: drop every page of the device and its pool. Returns the
    /// number of pages dropped.
    pub fn invalidate_area(&self, swap_type: u32) -> usize {
        Self::pool_of(swap_type)
            .and_then(|pool| self.dmem.destroy_pool(pool))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> DmemStats {
        self.dmem.stats()
    }

    #[must_use]
    pub const fn dmem(&self) -> &Dmem<SwapKey> {
        &self.dmem
    }
}
