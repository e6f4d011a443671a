//! # Tunables
//!
//! Compile-time defaults plus a small value object so tests and boards can
//! pick different trade-offs without a rebuild of the defaults.

use thiserror::Error;

/// Hash buckets per pool. Must be a power of two.
pub const DEFAULT_BUCKET_COUNT: usize = 256;

/// Entries evicted per round when a store finds every region full.
pub const NR_EVICT_BATCH: usize = 32;

/// Evict-and-retry rounds a single store may spend before giving up.
pub const DEFAULT_STORE_RETRY_LIMIT: usize = 16;

/// Pages covered by one window mapping (2 MiB with 4 KiB pages).
pub const DEFAULT_WINDOW_PAGES: usize = 512;

/// Sweeps a single claim may run before it is reported as stalled.
pub const DEFAULT_CLAIM_PASS_LIMIT: usize = 100_000;

/// `spin_loop` hints between two claim sweeps.
pub const DEFAULT_CLAIM_BACKOFF_SPINS: u32 = 64;

const _: () = {
    assert!(DEFAULT_BUCKET_COUNT.is_power_of_two());
    assert!(DEFAULT_WINDOW_PAGES.is_power_of_two());
    assert!(NR_EVICT_BATCH > 0);
    assert!(DEFAULT_CLAIM_PASS_LIMIT > 0);
};

/// Runtime configuration shared by the registry, its regions and the
/// cache backends built on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcmaConfig {
    pub bucket_count: usize,
    pub evict_batch: usize,
    pub store_retry_limit: usize,
    pub window_pages: usize,
    pub claim_pass_limit: usize,
    pub claim_backoff_spins: u32,
}

impl Default for GcmaConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl GcmaConfig {
    pub const DEFAULT: Self = Self {
        bucket_count: DEFAULT_BUCKET_COUNT,
        evict_batch: NR_EVICT_BATCH,
        store_retry_limit: DEFAULT_STORE_RETRY_LIMIT,
        window_pages: DEFAULT_WINDOW_PAGES,
        claim_pass_limit: DEFAULT_CLAIM_PASS_LIMIT,
        claim_backoff_spins: DEFAULT_CLAIM_BACKOFF_SPINS,
    };

    #[must_use]
    pub const fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    #[must_use]
    pub const fn with_evict_batch(mut self, evict_batch: usize) -> Self {
        self.evict_batch = evict_batch;
        self
    }

    #[must_use]
    pub const fn with_store_retry_limit(mut self, limit: usize) -> Self {
        self.store_retry_limit = limit;
        self
    }

    #[must_use]
    pub const fn with_window_pages(mut self, window_pages: usize) -> Self {
        self.window_pages = window_pages;
        self
    }

    #[must_use]
    pub const fn with_claim_pass_limit(mut self, limit: usize) -> Self {
        self.claim_pass_limit = limit;
        self
    }

    #[must_use]
    pub const fn with_claim_backoff_spins(mut self, spins: u32) -> Self {
        self.claim_backoff_spins = spins;
        self
    }

    /// Check the values for consistency.
    ///
    /// # Errors
    /// Returns the first field that is out of range.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_count == 0 || !self.bucket_count.is_power_of_two() {
            return Err(ConfigError::BucketCount(self.bucket_count));
        }
        if self.evict_batch == 0 {
            return Err(ConfigError::EvictBatch);
        }
        if self.window_pages == 0 || !self.window_pages.is_power_of_two() {
            return Err(ConfigError::WindowPages(self.window_pages));
        }
        if self.claim_pass_limit == 0 {
            return Err(ConfigError::ClaimPassLimit);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("bucket count {0} is not a non-zero power of two")]
    BucketCount(usize),
    #[error("eviction batch must not be empty")]
    EvictBatch,
    #[error("window of {0} pages is not a non-zero power of two")]
    WindowPages(usize),
    #[error("claim pass limit must be at least one")]
    ClaimPassLimit,
}
