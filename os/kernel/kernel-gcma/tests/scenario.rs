use kernel_gcma::{
    ClaimError, Dmem, GcmaConfig, PAGE_SIZE, PageState, Pfn, PfnRange, PoolId, RamWindowMapper, Region,
    RegionRegistry,
};
use std::sync::Arc;

const POOL: PoolId = PoolId(0);
const BASE: Pfn = Pfn::new(0x4_0000);

fn setup(pages: usize) -> (Dmem<u64>, Arc<Region>) {
    let config = GcmaConfig::DEFAULT.with_evict_batch(1).with_bucket_count(8);
    let registry = Arc::new(RegionRegistry::new(config).unwrap());
    let range = PfnRange::new(BASE, pages).unwrap();
    let region = registry
        .init_region(BASE, pages, Arc::new(RamWindowMapper::new(range)))
        .unwrap();
    let dmem = Dmem::new("scenario", registry);
    dmem.create_pool(POOL).unwrap();
    (dmem, region)
}

fn page_of(key: u64) -> Vec<u8> {
    (0..PAGE_SIZE).map(|i| (key as usize * 31 + i) as u8).collect()
}

fn hit(dmem: &Dmem<u64>, key: u64) -> bool {
    let mut out = vec![0; PAGE_SIZE];
    let found = dmem.load(POOL, &key, &mut out).unwrap();
    if found {
        assert_eq!(out, page_of(key), "content of key {key}");
    }
    found
}

fn assert_conserved(dmem: &Dmem<u64>, region: &Region) {
    assert!(region.is_consistent());
    assert_eq!(region.occupied_pages(), dmem.len() + region.isolated_pages());
}

#[test]
fn four_page_scenario() {
    const A: u64 = 0xA;
    const B: u64 = 0xB;
    const C: u64 = 0xC;
    const D: u64 = 0xD;
    const E: u64 = 0xE;

    let (dmem, region) = setup(4);
    for key in [A, B, C, D] {
        dmem.store(POOL, &key, &page_of(key)).unwrap();
    }
    assert_eq!(region.free_pages(), 0);

    // E needs a page; the oldest store goes.
    dmem.store(POOL, &E, &page_of(E)).unwrap();
    assert_eq!(dmem.stats().evictions, 1);
    assert!(!hit(&dmem, A));

    assert!(hit(&dmem, B));
    assert_conserved(&dmem, &region);

    let report = region.claim_area(BASE, 4).unwrap();
    assert_eq!(report.reclaimed, 4);
    assert_eq!(report.isolated_free, 0);
    for i in 0..4 {
        assert_eq!(region.state(BASE + i), Some(PageState::Isolated));
    }
    for key in [B, C, D, E] {
        assert!(!hit(&dmem, key));
    }

    let stats = dmem.stats();
    assert_eq!(stats.reclaims, 4);
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.stores, 5);
    assert_eq!(stats.loads, 1);
    assert_eq!(dmem.lru_len(), 0);
    assert_conserved(&dmem, &region);
}

#[test]
fn eviction_follows_recency() {
    let (dmem, _) = setup(3);
    for key in 1..=3 {
        dmem.store(POOL, &key, &page_of(key)).unwrap();
    }
    assert!(hit(&dmem, 1));
    assert_eq!(dmem.evict_lru(1), 1);
    assert!(!hit(&dmem, 2));
    assert!(hit(&dmem, 1));
    assert!(hit(&dmem, 3));
}

#[test]
fn partial_claim_leaves_the_rest_cached() {
    let (dmem, region) = setup(8);
    for key in 0..8 {
        dmem.store(POOL, &key, &page_of(key)).unwrap();
    }

    let report = region.claim_area(BASE + 2, 3).unwrap();
    assert_eq!(report.reclaimed, 3);
    assert_eq!(dmem.len(), 5);
    assert_conserved(&dmem, &region);

    // New stores only land outside the claimed range.
    assert_eq!(dmem.evict_lru(1), 1);
    dmem.store(POOL, &100, &page_of(100)).unwrap();
    for i in 2..5 {
        assert_eq!(region.state(BASE + i), Some(PageState::Isolated));
    }

    assert_eq!(region.release_area(BASE + 2, 3), Ok(3));
    assert_eq!(region.free_pages(), 3);
    assert_conserved(&dmem, &region);
}

#[test]
fn claim_beyond_region_fails_without_side_effects() {
    let (dmem, region) = setup(4);
    dmem.store(POOL, &1, &page_of(1)).unwrap();
    assert!(matches!(region.claim_area(BASE + 2, 4), Err(ClaimError::Region(_))));
    assert!(hit(&dmem, 1));
    assert_eq!(region.isolated_pages(), 0);
}

#[test]
fn two_regions_serve_one_backend() {
    let config = GcmaConfig::DEFAULT.with_evict_batch(1);
    let registry = Arc::new(RegionRegistry::new(config).unwrap());
    let r1 = PfnRange::new(Pfn::new(0x100), 2).unwrap();
    let r2 = PfnRange::new(Pfn::new(0x200), 2).unwrap();
    let first = registry
        .init_region(r1.start(), 2, Arc::new(RamWindowMapper::new(r1)))
        .unwrap();
    let second = registry
        .init_region(r2.start(), 2, Arc::new(RamWindowMapper::new(r2)))
        .unwrap();
    let dmem = Dmem::new("two", Arc::clone(&registry));
    dmem.create_pool(POOL).unwrap();

    for key in 0..4 {
        dmem.store(POOL, &key, &page_of(key)).unwrap();
    }
    assert_eq!(first.occupied_pages() + second.occupied_pages(), 4);

    // Claiming one region pushes the cache into the other.
    second.claim_area(r2.start(), 2).unwrap();
    assert_eq!(dmem.len(), 2);
    dmem.store(POOL, &9, &page_of(9)).unwrap();
    assert_eq!(first.occupied_pages(), 2);
    assert!(hit(&dmem, 9));
}
