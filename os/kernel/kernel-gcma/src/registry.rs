//! # Region Registry
//!
//! The registry owns every reserved region and hands out cache pages from
//! them round-robin. It is an explicit object: bring-up code creates one,
//! registers regions with [`RegionRegistry::init_region`] and passes it to
//! the cache backends by reference.
//!
//! The region list is guarded by a [`SpinMutex`] taken with interrupts
//! disabled; allocation only holds it long enough to snapshot the list.

use crate::config::{ConfigError, GcmaConfig};
use crate::pfn::{Pfn, PfnRange};
use crate::region::{Region, RegionError};
use crate::window::WindowMapper;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::SpinMutex;
use log::{info, trace};

pub struct RegionRegistry {
    regions: SpinMutex<Vec<Arc<Region>>>,
    /// Index of the region the next allocation tries first.
    cursor: AtomicUsize,
    config: GcmaConfig,
}

impl RegionRegistry {
    /// # Errors
    /// [`ConfigError`] if `config` does not validate.
    pub fn new(config: GcmaConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            regions: SpinMutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &GcmaConfig {
        &self.config
    }

    /// Register `[base, base + pages)` as a reserved region.
    ///
    /// `mapper` provides the temporary mappings the region's window needs.
    ///
    /// # Errors
    /// - [`RegionError::InvalidRange`] if the range is empty or overflows.
    /// - [`RegionError::Overlap`] if it overlaps a registered region.
    pub fn init_region(
        &self,
        base: Pfn,
        pages: usize,
        mapper: Arc<dyn WindowMapper>,
    ) -> Result<Arc<Region>, RegionError> {
        let range = PfnRange::new(base, pages).ok_or(RegionError::InvalidRange { start: base })?;
        let mut regions = self.regions.lock_irq();
        if regions.iter().any(|r| r.range().overlaps(&range)) {
            return Err(RegionError::Overlap);
        }
        let region = Arc::new(Region::new(range, self.config, mapper));
        regions.push(Arc::clone(&region));
        info!(
            "gcma: registered region {range:?} ({} KiB), {} regions total",
            range.count() * crate::pfn::PAGE_SIZE / 1024,
            regions.len()
        );
        Ok(region)
    }

    /// Remove an idle region from the registry.
    ///
    /// The region is retired first: callers still holding it, including
    /// allocations working from an older snapshot of the list, get no more
    /// frames from it.
    ///
    /// # Errors
    /// - [`RegionError::Busy`] if any frame of the region is still occupied.
    /// - [`RegionError::NotRegistered`] if the region is not part of this
    ///   registry.
    pub fn unregister(&self, region: &Arc<Region>) -> Result<(), RegionError> {
        let mut regions = self.regions.lock_irq();
        let pos = regions
            .iter()
            .position(|r| Arc::ptr_eq(r, region))
            .ok_or(RegionError::NotRegistered)?;
        region.retire()?;
        regions.remove(pos);
        info!("gcma: unregistered region {:?}", region.range());
        Ok(())
    }

    /// The region that contains `pfn`.
    #[must_use]
    pub fn region_of(&self, pfn: Pfn) -> Option<Arc<Region>> {
        self.regions
            .lock_irq()
            .iter()
            .find(|r| r.range().contains(pfn))
            .cloned()
    }

    /// Snapshot of the registered regions, in registration order.
    #[must_use]
    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.regions.lock_irq().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.lock_irq().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a cache page from the first region with room, starting at
    /// the region after the one that served the previous allocation.
    #[must_use]
    pub fn alloc_page(&self) -> Option<(Arc<Region>, Pfn)> {
        let regions = self.regions();
        if regions.is_empty() {
            return None;
        }
        let first = self.cursor.fetch_add(1, Ordering::Relaxed) % regions.len();
        let found = (0..regions.len())
            .map(|i| &regions[(first + i) % regions.len()])
            .find_map(|region| region.alloc_page().map(|pfn| (Arc::clone(region), pfn)));
        if found.is_none() {
            trace!("gcma: all {} regions full", regions.len());
        }
        found
    }
}
