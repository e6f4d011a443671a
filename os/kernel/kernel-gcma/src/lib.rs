//! # Guaranteed Contiguous Memory Allocator
//!
//! Reserved physical memory serves two kinds of consumers at once:
//!
//! * **First-class clients** (DMA engines, media codecs) that need a
//!   physically contiguous buffer of a guaranteed size, on demand and with
//!   bounded latency.
//! * **Second-class clients** (a swap write-through cache and a clean
//!   file-page cache) that may use any capacity the first-class clients are
//!   not using, under the condition that every page they hold can be taken
//!   away at any time.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │  SwapCache / FileCache   │   │   first-class client     │
//! │  get / put / invalidate  │   │   claim / release        │
//! └────────────┬─────────────┘   └────────────┬─────────────┘
//!              │                              │
//! ┌────────────▼─────────────┐                │
//! │        Dmem<K>           │◄── detach ─────┤
//! │  pools, buckets, LRU,    │                │
//! │  reference counting      │                │
//! └──────┬────────────┬──────┘                │
//!        │ alloc/free │ copy                  │
//! ┌──────▼──────┐ ┌───▼──────────────┐ ┌──────▼──────────────┐
//! │  Registry   │ │ PhysicalWindow   │ │  Region             │
//! │ round-robin ├─► temporary map of ◄─┤  bitmap + slot tags │
//! │ over regions│ │ unmapped frames  │ │  Free/Owned/...     │
//! └─────────────┘ └──────────────────┘ └─────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! * [`region`]: per-frame occupancy bit and ownership tag. The only place
//!   where a frame moves from the cache to a claimant.
//! * [`window`]: the sliding mapping used to copy page content in and out,
//!   behind the [`WindowMapper`] trait.
//! * [`registry`]: the set of regions and round-robin page allocation.
//! * [`dmem`]: the generic discardable cache.
//! * [`claim`]: [`Region::claim_area`] and [`Region::release_area`].
//! * [`swap`] and [`filecache`]: the two cache backends.
//!
//! ## Guarantees
//!
//! * A claim returns only when every frame of its range is isolated and no
//!   cache entry refers to it, or it reports a stall after a bounded number
//!   of sweeps.
//! * A load in progress pins its entry; neither invalidation nor a claim
//!   frees the page before the copy is done.
//! * With no operation in flight, occupied frames equal live cache entries
//!   plus isolated frames.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use kernel_gcma::{GcmaConfig, PAGE_SIZE, Pfn, PfnRange, RamWindowMapper, RegionRegistry, SwapCache};
//!
//! let registry = Arc::new(RegionRegistry::new(GcmaConfig::default()).unwrap());
//! let range = PfnRange::new(Pfn::new(0x8000), 16).unwrap();
//! let region = registry
//!     .init_region(range.start(), range.count(), Arc::new(RamWindowMapper::new(range)))
//!     .unwrap();
//!
//! let swap = SwapCache::new(Arc::clone(&registry));
//! swap.init(0).unwrap();
//! assert!(swap.put_page(0, 42, &[7; PAGE_SIZE]));
//!
//! // The DMA engine wants the whole region back.
//! let report = region.claim_area(range.start(), range.count()).unwrap();
//! assert_eq!(report.reclaimed, 1);
//!
//! let mut page = [0; PAGE_SIZE];
//! assert!(!swap.get_page(0, 42, &mut page));
//! region.release_area(range.start(), range.count()).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod claim;
pub mod config;
pub mod dmem;
pub mod filecache;
pub mod pfn;
pub mod region;
pub mod registry;
pub mod swap;
pub mod window;

pub use claim::{ClaimError, ClaimReport};
pub use config::{ConfigError, GcmaConfig};
pub use dmem::{Dmem, DmemKey, DmemStats, LoadError, PoolError, PoolId, StoreError};
pub use filecache::{FileCache, FileKey};
pub use pfn::{PAGE_SIZE, Pfn, PfnRange};
pub use region::{FreeOutcome, PageState, Reclaimable, Region, RegionError, RegionStats};
pub use registry::RegionRegistry;
pub use swap::{MAX_SWAPFILES, SwapCache, SwapKey};
pub use window::{HhdmWindowMapper, PhysicalWindow, RamWindowMapper, WindowError, WindowGuard, WindowMapper, WindowStats};
