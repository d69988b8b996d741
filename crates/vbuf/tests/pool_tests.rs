//! Pool, allocator, and fence behaviour: recycling, capacity accounting,
//! kill semantics, and sync brackets.

use std::os::unix::io::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use vbuf::{fence, BufAllocator, DmaBuf, Pool, PoolStrategy, ReuseScore};
use vbuf_reactor::Reactor;

// ---------------------------------------------------------------------------
// Counting test strategy

#[derive(Default)]
struct Counters {
    allocs: AtomicUsize,
    frees: AtomicUsize,
    score_calls: AtomicUsize,
}

struct Tracked {
    id: usize,
    size: usize,
}

struct TrackingStrategy {
    counters: Arc<Counters>,
}

impl PoolStrategy for TrackingStrategy {
    type Resource = Tracked;
    type Shape = usize;

    fn alloc(&self, size: &usize) -> Option<Tracked> {
        let id = self.counters.allocs.fetch_add(1, Ordering::SeqCst);
        Some(Tracked { id, size: *size })
    }

    fn reuse_score(&self, res: &Tracked, size: &usize) -> ReuseScore {
        self.counters.score_calls.fetch_add(1, Ordering::SeqCst);
        if res.size == *size {
            ReuseScore::Exact
        } else if res.size > *size {
            ReuseScore::Usable((res.size - *size) as u32)
        } else {
            ReuseScore::Reject
        }
    }

    fn destroy(&self, res: Tracked) {
        self.counters.frees.fetch_add(1, Ordering::SeqCst);
        drop(res);
    }
}

fn tracking_pool(capacity: usize) -> (Pool<TrackingStrategy>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let pool = Pool::new(
        capacity,
        TrackingStrategy {
            counters: counters.clone(),
        },
    );
    (pool, counters)
}

// ---------------------------------------------------------------------------
// Generic pool

// Release then re-acquire with a compatible shape recycles the same
// underlying resource; the allocation counter proves no backend call.
#[test]
fn test_recycle_not_fresh_allocation() {
    let (pool, counters) = tracking_pool(4);

    let first = pool.acquire(&4096).unwrap();
    let first_id = first.id;
    drop(first);

    let second = pool.acquire(&4096).unwrap();
    assert_eq!(second.id, first_id);
    assert_eq!(counters.allocs.load(Ordering::SeqCst), 1);
    assert_eq!(counters.frees.load(Ordering::SeqCst), 0);
}

// A perfect score wins over any positive score and ends the scan.
#[test]
fn test_exact_score_wins_and_stops_scan() {
    let (pool, counters) = tracking_pool(4);

    let loose = pool.acquire(&30).unwrap();
    let exact = pool.acquire(&20).unwrap();
    let unseen = pool.acquire(&20).unwrap();
    // Free order fixes the scan order: [30, 20, 20].
    drop(loose);
    drop(exact);
    drop(unseen);

    counters.score_calls.store(0, Ordering::SeqCst);
    let lease = pool.acquire(&20).unwrap();
    assert_eq!(lease.size, 20);
    // Scored the 30 (Usable) and the first 20 (Exact), never the second 20.
    assert_eq!(counters.score_calls.load(Ordering::SeqCst), 2);
}

// Capacity 2: two live leases exhaust the pool, releasing one lets a
// compatible request reuse its resource, and the live count never moves.
#[test]
fn test_capacity_two_scenario() {
    let (pool, counters) = tracking_pool(2);

    let a = pool.acquire(&100).unwrap();
    let a_id = a.id;
    let b = pool.acquire(&100).unwrap();
    assert_eq!(pool.live_count(), 2);

    // No free entry, no capacity headroom, nothing evictable.
    assert!(pool.acquire(&100).is_none());

    drop(a); // parks via interception
    assert_eq!(pool.live_count(), 2);

    let c = pool.acquire(&100).unwrap();
    assert_eq!(c.id, a_id);
    assert_eq!(pool.live_count(), 2);
    assert_eq!(counters.allocs.load(Ordering::SeqCst), 2);

    drop(b);
    drop(c);
}

#[test]
fn test_eviction_destroys_least_recently_freed() {
    let (pool, counters) = tracking_pool(2);

    let small = pool.acquire(&10).unwrap();
    let small_id = small.id;
    let medium = pool.acquire(&20).unwrap();
    drop(small); // freed first: LRU head
    drop(medium);

    // Nothing parked fits 50: the 10 goes, a fresh 50 arrives.
    let big = pool.acquire(&50).unwrap();
    assert_ne!(big.id, small_id);
    assert_eq!(counters.frees.load(Ordering::SeqCst), 1);
    assert_eq!(counters.allocs.load(Ordering::SeqCst), 3);
    assert_eq!(pool.live_count(), 2);
}

// After kill: acquire fails, outstanding leases stay usable, and every
// resource is destroyed exactly once.
#[test]
fn test_kill_semantics() {
    let (pool, counters) = tracking_pool(4);

    let held = pool.acquire(&64).unwrap();
    let parked = pool.acquire(&64).unwrap();
    drop(parked);

    pool.kill();
    // The parked resource was destroyed eagerly.
    assert_eq!(counters.frees.load(Ordering::SeqCst), 1);
    assert!(pool.acquire(&64).is_none());

    // The outstanding lease is untouched by the kill.
    assert_eq!(held.size, 64);
    let clone = held.clone();
    drop(held);
    assert_eq!(counters.frees.load(Ordering::SeqCst), 1);
    drop(clone);

    // Net zero: everything allocated has been destroyed.
    assert_eq!(
        counters.allocs.load(Ordering::SeqCst),
        counters.frees.load(Ordering::SeqCst)
    );
    assert_eq!(pool.live_count(), 0);

    // Dropping the last pool reference drops the strategy too.
    drop(pool);
    assert_eq!(Arc::strong_count(&counters), 1);
}

// Rapid kill while worker threads lease and release under load.
#[test]
fn test_kill_while_leasing_stress() {
    let (pool, counters) = tracking_pool(8);

    let mut workers = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..300 {
                if let Some(lease) = pool.acquire(&64) {
                    let clone = lease.clone();
                    assert_eq!(clone.size, 64);
                    drop(lease);
                    drop(clone);
                }
            }
        }));
    }

    thread::sleep(Duration::from_millis(2));
    pool.kill();

    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(
        counters.allocs.load(Ordering::SeqCst),
        counters.frees.load(Ordering::SeqCst)
    );
    assert_eq!(pool.live_count(), 0);
    assert_eq!(pool.free_count(), 0);
}

// ---------------------------------------------------------------------------
// Buffer pool over the memfd backend

#[test]
fn test_buf_pool_recycles_backing_buffer() {
    let allocator = BufAllocator::memfd();
    let pool = allocator.new_pool(4);

    let lease = pool.acquire(&1000).unwrap();
    let fd = std::os::unix::io::AsRawFd::as_raw_fd(&lease.fd().unwrap());
    let size = lease.size();
    drop(lease);

    // Same descriptor comes back; nothing was closed or reopened in between.
    let again = pool.acquire(&1000).unwrap();
    assert_eq!(
        std::os::unix::io::AsRawFd::as_raw_fd(&again.fd().unwrap()),
        fd
    );
    assert_eq!(again.size(), size);
    assert_eq!(pool.live_count(), 1);
}

#[test]
fn test_buf_pool_acquire_after_kill_fails() {
    let allocator = BufAllocator::memfd();
    let pool = allocator.new_pool(2);

    let held = pool.acquire(&4096).unwrap();
    pool.kill();
    assert!(pool.acquire(&4096).is_none());

    // Leased buffer remains fully usable until its own release.
    held.map().unwrap();
    held.write_start().unwrap();
    held.write_end().unwrap();
}

// ---------------------------------------------------------------------------
// Sync brackets

#[test]
fn test_read_start_fails_without_mapping() {
    // Sockets cannot be mapped, so read_start must fail before any ioctl.
    let (a, _b) = UnixStream::pair().unwrap();
    let buf = DmaBuf::import(a.as_fd(), 4096).unwrap();
    assert!(buf.read_start().is_err());
}

#[test]
fn test_fake_sync_is_noop() {
    let (a, _b) = UnixStream::pair().unwrap();
    let buf = DmaBuf::import(a.as_fd(), 4096).unwrap();
    assert!(buf.is_fake());
    buf.write_start().unwrap();
    buf.write_end().unwrap();
}

// ---------------------------------------------------------------------------
// Fence watch

#[test]
fn test_watch_release_fires_for_file_backed_buffer() {
    let reactor = Reactor::new().unwrap();
    let allocator = BufAllocator::memfd();
    let pool = allocator.new_pool(2);

    let lease = pool.acquire(&4096).unwrap();
    let (tx, rx) = mpsc::channel();

    // A memfd has no outstanding fences, so it polls writable at once.
    let watch = fence::watch_release(&reactor, lease.clone(), move |buf, _revents| {
        tx.send(buf.size()).unwrap();
    })
    .unwrap();
    assert!(watch.is_some());

    let size = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(size, lease.size());

    drop(watch);
    reactor.shutdown();
}

#[test]
fn test_watch_release_completes_for_fdless_buffer() {
    let reactor = Reactor::new().unwrap();

    let len = 4096;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(ptr, libc::MAP_FAILED);
    let buf = unsafe {
        DmaBuf::import_mmap(std::ptr::NonNull::new(ptr.cast::<u8>()).unwrap(), len)
    };
    assert!(buf.fd().is_none());

    let (tx, rx) = mpsc::channel();
    let watch = fence::watch_release(&reactor, Arc::new(buf), move |buf, _| {
        tx.send(buf.is_fake()).unwrap();
    })
    .unwrap();
    assert!(watch.is_none());

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
    reactor.shutdown();
}
