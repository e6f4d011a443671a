use kernel_sync::RwSpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn readers_share_writers_exclude() {
    let l = RwSpinLock::new(5u32);

    let r1 = l.read();
    let r2 = l.try_read().expect("second reader");
    assert_eq!(*r1 + *r2, 10);
    assert_eq!(l.reader_count(), 2);
    assert!(l.try_write().is_none());

    drop(r1);
    drop(r2);
    let mut w = l.try_write().expect("writer after readers left");
    assert!(l.is_write_locked());
    assert!(l.try_read().is_none());
    *w = 6;
    drop(w);

    assert_eq!(*l.read(), 6);
    assert_eq!(l.reader_count(), 0);
}

#[test]
fn downgrade_keeps_the_value_and_admits_readers() {
    let l = RwSpinLock::new(Vec::<u8>::new());
    let mut w = l.write();
    w.push(1);
    let r = w.downgrade();

    // No gap: still one reader, no writer, and a second writer cannot enter.
    assert!(!l.is_write_locked());
    assert_eq!(l.reader_count(), 1);
    assert!(l.try_write().is_none());

    let other = l.read();
    assert_eq!(other.as_slice(), &[1]);
    assert_eq!(r.as_slice(), &[1]);
    drop(other);
    drop(r);
    assert!(l.try_write().is_some());
}

#[test]
fn get_mut_bypasses_the_lock() {
    let mut l = RwSpinLock::new(1);
    *l.get_mut() += 1;
    assert_eq!(*l.read(), 2);
}

#[test]
fn writers_never_overlap_readers() {
    let threads = 6;
    let iters = 2_000;

    let lock = Arc::new(RwSpinLock::new(0usize));
    let writers_in = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let (lock, writers_in, start) = (Arc::clone(&lock), Arc::clone(&writers_in), Arc::clone(&start));
            thread::spawn(move || {
                start.wait();
                for i in 0..iters {
                    if (t + i) % 4 == 0 {
                        let mut w = lock.write();
                        assert_eq!(writers_in.fetch_add(1, Ordering::SeqCst), 0);
                        *w += 1;
                        writers_in.fetch_sub(1, Ordering::SeqCst);
                        // Downgrading must not let another writer in.
                        let r = w.downgrade();
                        assert_eq!(writers_in.load(Ordering::SeqCst), 0);
                        drop(r);
                    } else {
                        let r = lock.read();
                        assert_eq!(writers_in.load(Ordering::SeqCst), 0, "reader saw a writer");
                        let _ = *r;
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let expected = (0..threads)
        .map(|t| (0..iters).filter(|i| (t + i) % 4 == 0).count())
        .sum::<usize>();
    assert_eq!(*lock.read(), expected);
}
