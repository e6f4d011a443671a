use kernel_gcma::{
    Dmem, GcmaConfig, PAGE_SIZE, PageState, Pfn, PfnRange, PoolId, RamWindowMapper, Region, RegionRegistry,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const POOL: PoolId = PoolId(0);

fn setup(base: u64, pages: usize, config: GcmaConfig) -> (Arc<Dmem<u64>>, Arc<Region>) {
    let registry = Arc::new(RegionRegistry::new(config).unwrap());
    let range = PfnRange::new(Pfn::new(base), pages).unwrap();
    let region = registry
        .init_region(range.start(), pages, Arc::new(RamWindowMapper::new(range)))
        .unwrap();
    let dmem = Arc::new(Dmem::new("concurrency", registry));
    dmem.create_pool(POOL).unwrap();
    (dmem, region)
}

/// Every byte of a stored page is the same tag, so a torn or recycled page
/// shows up as a mixed buffer.
fn uniform(tag: u8) -> Vec<u8> {
    vec![tag; PAGE_SIZE]
}

fn assert_quiescent(dmem: &Dmem<u64>, region: &Region) {
    assert!(region.is_consistent());
    let stats = region.stats();
    assert_eq!(stats.reclaiming, 0);
    assert_eq!(stats.owned, dmem.len());
    assert_eq!(dmem.lru_len(), dmem.len());
    assert_eq!(region.occupied_pages(), dmem.len() + region.isolated_pages());
}

#[test]
fn loads_never_see_a_recycled_page() {
    let (dmem, region) = setup(0x1000, 16, GcmaConfig::DEFAULT.with_evict_batch(2));
    let keys = 8u64;
    let rounds = 2_000usize;
    let writers = 2;
    let readers = 4;
    let start = Arc::new(Barrier::new(writers + readers));
    let done = Arc::new(AtomicBool::new(false));

    let mut writer_handles = Vec::new();
    for w in 0..writers {
        let (dmem, start) = (Arc::clone(&dmem), Arc::clone(&start));
        writer_handles.push(thread::spawn(move || {
            start.wait();
            for round in 0..rounds {
                let key = (round as u64 + w as u64) % keys;
                let tag = u8::try_from(round % 251).unwrap() + 1;
                // Stores may fail under pressure; that is a dropped write.
                let _ = dmem.store(POOL, &key, &uniform(tag));
                if round % 3 == 0 {
                    dmem.invalidate(POOL, &key).unwrap();
                }
            }
        }));
    }
    let mut reader_handles = Vec::new();
    for _ in 0..readers {
        let (dmem, start, done) = (Arc::clone(&dmem), Arc::clone(&start), Arc::clone(&done));
        reader_handles.push(thread::spawn(move || {
            start.wait();
            let mut out = vec![0u8; PAGE_SIZE];
            let mut key = 0;
            while !done.load(Ordering::Acquire) {
                if dmem.load(POOL, &key, &mut out).unwrap() {
                    let tag = out[0];
                    assert_ne!(tag, 0, "hit on a never-written page");
                    assert!(out.iter().all(|&b| b == tag), "torn page for key {key}");
                }
                key = (key + 1) % keys;
            }
        }));
    }

    for h in writer_handles {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for h in reader_handles {
        h.join().unwrap();
    }

    assert_quiescent(&dmem, &region);
    assert_eq!(region.isolated_pages(), 0);
}

#[test]
fn claims_converge_under_store_pressure() {
    let (dmem, region) = setup(0x2000, 64, GcmaConfig::DEFAULT.with_evict_batch(4));
    let base = region.range().start();
    let writers = 3;
    let start = Arc::new(Barrier::new(writers + 1));
    let done = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for w in 0..writers {
        let (dmem, start, done) = (Arc::clone(&dmem), Arc::clone(&start), Arc::clone(&done));
        handles.push(thread::spawn(move || {
            start.wait();
            let mut out = vec![0u8; PAGE_SIZE];
            let mut n = 0u64;
            while !done.load(Ordering::Acquire) {
                let key = (n * 7 + w as u64) % 200;
                let _ = dmem.store(POOL, &key, &uniform(u8::try_from(key % 200).unwrap() + 1));
                if dmem.load(POOL, &key, &mut out).unwrap() {
                    assert!(out.iter().all(|&b| b == out[0]));
                }
                n += 1;
            }
        }));
    }

    start.wait();
    for round in 0..50 {
        let offset = (round % 4) * 16;
        let report = region.claim_area(base + offset, 32).unwrap();
        assert!(report.passes >= 1);
        for i in offset..offset + 32 {
            assert_eq!(region.state(base + i), Some(PageState::Isolated), "round {round}");
        }
        region.release_area(base + offset, 32).unwrap();
    }
    done.store(true, Ordering::Release);
    for h in handles {
        h.join().unwrap();
    }

    assert_quiescent(&dmem, &region);
    assert_eq!(region.isolated_pages(), 0);
    assert_eq!(region.stats().stalled_claims, 0);
}

#[test]
fn concurrent_claims_of_disjoint_ranges() {
    let (dmem, region) = setup(0x3000, 32, GcmaConfig::DEFAULT.with_evict_batch(1));
    for key in 0..32 {
        dmem.store(POOL, &key, &uniform(1)).unwrap();
    }
    let base = region.range().start();
    let start = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|q| {
            let (region, start) = (Arc::clone(&region), Arc::clone(&start));
            thread::spawn(move || {
                start.wait();
                region.claim_area(base + q * 8, 8).unwrap()
            })
        })
        .collect();
    let reclaimed: usize = handles.into_iter().map(|h| h.join().unwrap().reclaimed).sum();

    assert_eq!(reclaimed, 32);
    assert_eq!(region.isolated_pages(), 32);
    assert_eq!(dmem.stats().reclaims, 32);
    assert_quiescent(&dmem, &region);
}
