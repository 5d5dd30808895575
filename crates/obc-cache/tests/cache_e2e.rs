#![forbid(unsafe_code)]

use obc_cache::BlockCache;
use obc_store::{
    ImageHandle, ImageLayout, MemoryObjectStore, ObjectBackend, ReadDone, ThreadedBackend,
    WriteDone,
};
use obc_types::{CacheConfig, ImageId, ObjectName, SharedBuf, SnapContext, SnapId};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;

const PAGE: u64 = 4096;
const OBJECT: u64 = 16384;

fn config() -> CacheConfig {
    CacheConfig {
        cache_bytes: 65536,
        page_bytes: PAGE,
        region_pages: 4,
        target_dirty_bytes: 16384,
        max_dirty_bytes: 16384,
        max_dirty_age: Duration::from_secs(60),
    }
}

fn image(name: &str) -> Arc<ImageHandle> {
    Arc::new(ImageHandle::new(name, ImageLayout::new(OBJECT)))
}

fn build_with(backend: Arc<dyn ObjectBackend>) -> Arc<BlockCache> {
    BlockCache::new(&config(), backend, Arc::new(obc_store::UniformStriper)).expect("cache")
}

fn build() -> (Arc<BlockCache>, Arc<MemoryObjectStore>) {
    let store = Arc::new(MemoryObjectStore::new());
    let cache = build_with(Arc::clone(&store) as Arc<dyn ObjectBackend>);
    (cache, store)
}

fn read_sync(cache: &Arc<BlockCache>, id: ImageId, offset: u64, len: u64) -> (Vec<u8>, u64) {
    let buf = SharedBuf::new(len as usize);
    let (tx, rx) = channel();
    cache
        .read_buffer(
            id,
            offset,
            len,
            buf.clone(),
            SnapId::HEAD,
            Box::new(move |r| tx.send(r).unwrap()),
        )
        .expect("read issued");
    let n = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("read completion")
        .expect("read ok");
    (buf.to_vec(), n)
}

fn write_sync(cache: &Arc<BlockCache>, id: ImageId, offset: u64, data: &[u8]) {
    let (tx, rx) = channel();
    cache
        .write_buffer(id, offset, data, Box::new(move |r| tx.send(r).unwrap()))
        .expect("write issued");
    rx.recv_timeout(Duration::from_secs(5))
        .expect("write completion")
        .expect("write ok");
}

fn flush_sync(cache: &Arc<BlockCache>) {
    let (tx, rx) = channel();
    cache.user_flush(Box::new(move |r| tx.send(r).unwrap()));
    rx.recv_timeout(Duration::from_secs(5))
        .expect("flush completion")
        .expect("flush ok");
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Backend wrapper counting operations, in the spirit of a counting block
/// device test double.
struct CountingBackend {
    inner: Arc<MemoryObjectStore>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl CountingBackend {
    fn new(inner: Arc<MemoryObjectStore>) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }
}

impl ObjectBackend for CountingBackend {
    fn read_sparse(&self, oid: &ObjectName, off: u64, len: u64, snap_id: SnapId, done: ReadDone) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_sparse(oid, off, len, snap_id, done);
    }

    fn write(&self, oid: &ObjectName, off: u64, data: Vec<u8>, snapc: &SnapContext, done: WriteDone) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(oid, off, data, snapc, done);
    }
}

/// Shares one backend instance between the cache and the test's asserts.
struct Shared<T>(Arc<T>);

impl<T: ObjectBackend> ObjectBackend for Shared<T> {
    fn read_sparse(&self, oid: &ObjectName, off: u64, len: u64, snap_id: SnapId, done: ReadDone) {
        self.0.read_sparse(oid, off, len, snap_id, done);
    }

    fn write(&self, oid: &ObjectName, off: u64, data: Vec<u8>, snapc: &SnapContext, done: WriteDone) {
        self.0.write(oid, off, data, snapc, done);
    }
}

/// Backend that parks reads until released; used to hold a miss in flight.
struct GateStore {
    inner: MemoryObjectStore,
    open: Mutex<bool>,
    cond: Condvar,
    reads: AtomicUsize,
}

impl GateStore {
    fn new(inner: MemoryObjectStore) -> Self {
        Self {
            inner,
            open: Mutex::new(false),
            cond: Condvar::new(),
            reads: AtomicUsize::new(0),
        }
    }

    fn release(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }
}

impl ObjectBackend for GateStore {
    fn read_sparse(&self, oid: &ObjectName, off: u64, len: u64, snap_id: SnapId, done: ReadDone) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
        drop(open);
        self.inner.read_sparse(oid, off, len, snap_id, done);
    }

    fn write(&self, oid: &ObjectName, off: u64, data: Vec<u8>, snapc: &SnapContext, done: WriteDone) {
        self.inner.write(oid, off, data, snapc, done);
    }
}

// ── Spec scenarios ──────────────────────────────────────────────────────

#[test]
fn partial_read_zero_fills_absent_objects() {
    let (cache, _store) = build();
    let id = cache.register_image(image("a")).unwrap();

    let (data, n) = read_sync(&cache, id, 100, 8000);
    assert_eq!(n, 8000);
    assert!(data.iter().all(|&b| b == 0));

    let stats = cache.stats();
    assert_eq!(stats.pool.lru_len, 2, "pages at 0 and 4096 admitted to LRU");
    assert_eq!(stats.pool.lfu_len, 0);
    assert_eq!(stats.inflight_pages, 0);
    assert!(cache.validate());
    cache.shutdown();
}

#[test]
fn writeback_coalesces_contiguous_pages_into_one_write() {
    let store = Arc::new(MemoryObjectStore::new());
    let counting = Arc::new(CountingBackend::new(Arc::clone(&store)));
    let cache = build_with(Arc::new(Shared(Arc::clone(&counting))) as Arc<dyn ObjectBackend>);
    let handle = image("a");
    let id = cache.register_image(Arc::clone(&handle)).unwrap();

    flush_sync(&cache); // leave the initial pass-through mode
    let payload = pattern(12288, 3);
    write_sync(&cache, id, 0, &payload);
    assert_eq!(counting.writes.load(Ordering::SeqCst), 0, "write deferred");
    flush_sync(&cache);

    assert_eq!(
        counting.writes.load(Ordering::SeqCst),
        1,
        "three contiguous pages in one object become one write"
    );
    assert_eq!(
        counting.reads.load(Ordering::SeqCst),
        0,
        "fully covered pages need no read-modify-write"
    );
    let object = store.object(&handle.object_name(0)).expect("object exists");
    assert_eq!(&object[..12288], &payload[..]);
    assert_eq!(cache.stats().pool.dirty_pages, 0);
    cache.shutdown();
}

#[test]
fn ghost_hit_promotes_to_lfu_with_zero_delta_guard() {
    let (cache, _store) = build();
    let id = cache.register_image(image("a")).unwrap();

    // Fill the cache: 16 cold pages, all on the recency list.
    for i in 0..16_u64 {
        read_sync(&cache, id, i * PAGE, PAGE);
    }
    assert_eq!(cache.stats().pool.lru_len, 16);

    // 16 fresh pages evict every original into the recency ghost list.
    for i in 16..32_u64 {
        read_sync(&cache, id, i * PAGE, PAGE);
    }
    let stats = cache.stats();
    assert_eq!(stats.pool.lru_len, 16);
    assert_eq!(stats.pool.lru_ghost_len, 16);
    assert_eq!(stats.pool.free_descriptors, 0);
    let limit_before = stats.pool.arc_lru_limit;

    // History hit: the original offset is admitted to the frequency list;
    // with an empty LFU ghost list the adaptive delta is zero.
    read_sync(&cache, id, 0, PAGE);
    let stats = cache.stats();
    assert_eq!(stats.pool.lfu_len, 1);
    assert_eq!(stats.pool.arc_lru_limit, limit_before);
    assert!(cache.validate());
    cache.shutdown();
}

#[test]
fn transient_write_failure_is_retried_to_success() {
    let (cache, store) = build();
    let handle = image("a");
    let id = cache.register_image(Arc::clone(&handle)).unwrap();

    flush_sync(&cache);
    let payload = pattern(4096, 9);
    write_sync(&cache, id, 0, &payload);
    store.inject_write_failures(1);

    let (tx, rx) = channel();
    let fired = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&fired);
    cache.user_flush(Box::new(move |r| {
        count.fetch_add(1, Ordering::SeqCst);
        tx.send(r).unwrap();
    }));
    rx.recv_timeout(Duration::from_secs(5))
        .expect("flush completion after retry")
        .expect("flush ok");

    assert_eq!(fired.load(Ordering::SeqCst), 1, "barrier fires exactly once");
    assert_eq!(cache.stats().pool.dirty_pages, 0);
    let object = store.object(&handle.object_name(0)).expect("object");
    assert_eq!(&object[..4096], &payload[..]);
    cache.shutdown();
}

#[test]
fn concurrent_readers_share_one_backend_read() {
    let gate = Arc::new(GateStore::new(MemoryObjectStore::new()));
    let payload = pattern(4096, 5);
    gate.inner.put_object(
        ObjectName("a.0000000000000000".to_owned()),
        payload.clone(),
    );
    let backend =
        ThreadedBackend::spawn(Shared(Arc::clone(&gate))).expect("backend thread");
    let cache = build_with(Arc::new(backend) as Arc<dyn ObjectBackend>);
    let id = cache.register_image(image("a")).unwrap();

    let spawn_reader = |cache: &Arc<BlockCache>| {
        let cache = Arc::clone(cache);
        thread::spawn(move || {
            let buf = SharedBuf::new(4096);
            let (tx, rx) = channel();
            cache
                .read_buffer(
                    id,
                    0,
                    4096,
                    buf.clone(),
                    SnapId::HEAD,
                    Box::new(move |r| tx.send(r).unwrap()),
                )
                .expect("read issued");
            rx.recv_timeout(Duration::from_secs(10))
                .expect("completion")
                .expect("ok");
            buf.to_vec()
        })
    };

    let first = spawn_reader(&cache);
    let second = spawn_reader(&cache);
    // Let both readers reach the miss; one issues, the other queues on the
    // in-flight page.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(gate.reads.load(Ordering::SeqCst), 1);
    gate.release();

    assert_eq!(first.join().unwrap(), payload);
    assert_eq!(second.join().unwrap(), payload);
    assert_eq!(
        gate.reads.load(Ordering::SeqCst),
        1,
        "second reader observes a hit"
    );
    cache.shutdown();
}

#[test]
fn unregister_during_writeback_discards_dirty_and_flush_succeeds() {
    let (cache, store) = build();
    let handle = image("b");
    let id = cache.register_image(Arc::clone(&handle)).unwrap();

    flush_sync(&cache);
    write_sync(&cache, id, 0, &pattern(4096, 7));
    assert_eq!(cache.stats().pool.dirty_pages, 1);

    cache.unregister_image(&handle);
    flush_sync(&cache);

    let stats = cache.stats();
    assert_eq!(stats.pool.dirty_pages, 0, "dirty page discarded, not written");
    assert_eq!(store.object_count(), 0);
    assert!(cache.validate());
    cache.shutdown();
}

// ── Laws ────────────────────────────────────────────────────────────────

#[test]
fn read_your_write_hot_cold_and_after_flush() {
    let (cache, _store) = build();
    let id = cache.register_image(image("a")).unwrap();
    flush_sync(&cache);

    let payload = pattern(10000, 11);
    write_sync(&cache, id, 4100, &payload);

    // Hot: straight out of the dirty pages.
    let (data, _) = read_sync(&cache, id, 4100, 10000);
    assert_eq!(data, payload);

    // After flush: pages clean but resident.
    flush_sync(&cache);
    let (data, _) = read_sync(&cache, id, 4100, 10000);
    assert_eq!(data, payload);

    // Cold: purge residents and ghosts, read back through the backend.
    cache.purge(id).unwrap();
    let (data, n) = read_sync(&cache, id, 4100, 10000);
    assert_eq!(n, 10000);
    assert_eq!(data, payload);
    cache.shutdown();
}

#[test]
fn sparse_objects_zero_fill_their_holes() {
    let (cache, store) = build();
    let handle = image("a");
    let id = cache.register_image(Arc::clone(&handle)).unwrap();

    // Object shorter than the read: the tail is a hole.
    store.put_object(handle.object_name(0), pattern(4096, 2));
    let (data, _) = read_sync(&cache, id, 0, 12288);
    assert_eq!(&data[..4096], &pattern(4096, 2)[..]);
    assert!(data[4096..].iter().all(|&b| b == 0));
    cache.shutdown();
}

#[test]
fn flush_is_idempotent() {
    let (cache, _store) = build();
    let id = cache.register_image(image("a")).unwrap();
    flush_sync(&cache);
    write_sync(&cache, id, 0, &pattern(8192, 4));

    flush_sync(&cache);
    assert_eq!(cache.stats().pool.dirty_pages, 0);
    // The second barrier has nothing pending and fires immediately.
    flush_sync(&cache);
    assert_eq!(cache.stats().pool.dirty_pages, 0);
    cache.shutdown();
}

#[test]
fn writethrough_mode_keeps_dirty_count_zero() {
    let store = Arc::new(MemoryObjectStore::new());
    let cfg = CacheConfig {
        target_dirty_bytes: 0,
        max_dirty_bytes: 0,
        ..config()
    };
    let cache = BlockCache::new(
        &cfg,
        Arc::clone(&store) as Arc<dyn ObjectBackend>,
        Arc::new(obc_store::UniformStriper),
    )
    .expect("cache");
    let handle = image("a");
    let id = cache.register_image(Arc::clone(&handle)).unwrap();

    let payload = pattern(8192, 6);
    write_sync(&cache, id, 0, &payload);
    assert_eq!(cache.stats().pool.dirty_pages, 0);
    let object = store.object(&handle.object_name(0)).expect("written through");
    assert_eq!(&object[..8192], &payload[..]);

    // user_flush is a pure barrier here.
    flush_sync(&cache);
    assert_eq!(cache.stats().pool.dirty_pages, 0);
    cache.shutdown();
}

#[test]
fn discard_clears_resident_and_absent_ranges() {
    let (cache, _store) = build();
    let id = cache.register_image(image("a")).unwrap();
    flush_sync(&cache);

    write_sync(&cache, id, 0, &pattern(8192, 8));
    cache.discard(id, 0, 8192).unwrap();
    // Resident part reads back as zeros; the tail pages were never written
    // and zero-fill on miss.
    let (data, _) = read_sync(&cache, id, 0, 16384);
    assert!(data.iter().all(|&b| b == 0));
    cache.shutdown();
}

#[test]
fn partial_cold_write_preserves_backend_bytes_around_it() {
    let (cache, store) = build();
    let handle = image("a");
    let id = cache.register_image(Arc::clone(&handle)).unwrap();

    // Backend already holds data; a small cold write must not clobber the
    // rest of the page when it is later flushed.
    store.put_object(handle.object_name(0), pattern(8192, 13));
    flush_sync(&cache);
    write_sync(&cache, id, 1000, &[0xEE; 100]);
    flush_sync(&cache);

    let object = store.object(&handle.object_name(0)).expect("object");
    let mut expected = pattern(8192, 13);
    expected[1000..1100].fill(0xEE);
    assert_eq!(&object[..8192], &expected[..]);
    cache.shutdown();
}

#[test]
fn writeback_backpressure_defers_write_completion() {
    let (cache, _store) = build();
    let id = cache.register_image(image("a")).unwrap();
    flush_sync(&cache);

    // target = max = 4 pages; the fifth dirty page pushes past target and
    // the completion is deferred until the flusher drains.
    for i in 0..4_u64 {
        write_sync(&cache, id, i * PAGE, &pattern(4096, i as u8));
    }
    assert_eq!(cache.stats().pool.dirty_pages, 4);
    write_sync(&cache, id, 4 * PAGE, &pattern(4096, 42));
    // The completion is only released once the flusher ran; the drain to
    // target may land a cycle later.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while cache.stats().pool.dirty_pages > 4 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(cache.stats().pool.dirty_pages <= 4, "flusher drained to target");
    cache.shutdown();
}

#[test]
fn mixed_workload_holds_invariants() {
    let (cache, _store) = build();
    let a = cache.register_image(image("a")).unwrap();
    let b = cache.register_image(image("b")).unwrap();
    flush_sync(&cache);

    for step in 0_u64..40 {
        let id = if step % 2 == 0 { a } else { b };
        let offset = (step * 7 % 29) * PAGE + (step % 3) * 100;
        if step % 5 == 0 {
            write_sync(&cache, id, offset, &pattern(5000, step as u8));
        } else {
            read_sync(&cache, id, offset, 5000);
        }
        let stats = cache.stats();
        assert!(cache.validate(), "invariants at step {step}");
    }
    flush_sync(&cache);
    let stats = cache.stats();
    assert_eq!(stats.pool.dirty_pages, 0);
    assert_eq!(stats.inflight_pages, 0);
    cache.shutdown();
}
