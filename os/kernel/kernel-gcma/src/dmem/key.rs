use core::fmt;

/// Key shape of one cache backend.
///
/// Keys are ordered inside a bucket and spread over buckets by
/// [`bucket_hash`](Self::bucket_hash). Two keys that compare equal must hash
/// equally.
pub trait DmemKey: Ord + Clone + Send + Sync + fmt::Debug + 'static {
    fn bucket_hash(&self) -> u64;
}

/// Finalizer of `splitmix64`; spreads dense offsets over all bits so the
/// low bits can select a bucket.
#[inline]
#[must_use]
pub const fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl DmemKey for u64 {
    #[inline]
    fn bucket_hash(&self) -> u64 {
        mix64(*self)
    }
}
