#![forbid(unsafe_code)]
//! Object backend, striping, and image handles for obcache.
//!
//! The cache core talks to the outside world through three seams defined
//! here: [`ObjectBackend`] carries individual object reads and writes with
//! completion callbacks, [`Striper`] maps an image byte range onto object
//! extents, and [`ImageHandle`] holds per-image layout and snapshot context.
//! `MemoryObjectStore` and `ThreadedBackend` are concrete implementations
//! used by tests and embedders without a real store.

use obc_error::{CacheError, Result};
use obc_types::{ObjectExtent, ObjectName, PageId, SnapContext, SnapId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::thread::JoinHandle;
use std::thread;
use tracing::{debug, trace};

/// Completion for a sparse object read. May fire on any thread.
pub type ReadDone = Box<dyn FnOnce(Result<SparseRead>) + Send>;

/// Completion for an object write. May fire on any thread.
pub type WriteDone = Box<dyn FnOnce(Result<()>) + Send>;

/// Result of a sparse read: the extents that exist in the object, in
/// ascending object offset, and their data concatenated in the same order.
/// Uncovered gaps are holes the caller zero-fills.
#[derive(Debug, Clone, Default)]
pub struct SparseRead {
    pub extents: Vec<(u64, u64)>,
    pub data: Vec<u8>,
}

/// Asynchronous object store client.
///
/// Calls never block; `done` fires exactly once, possibly before the call
/// returns and possibly on another thread. Buffers handed to `write` are
/// owned by the backend until completion.
pub trait ObjectBackend: Send + Sync {
    fn read_sparse(&self, oid: &ObjectName, off: u64, len: u64, snap_id: SnapId, done: ReadDone);

    fn write(&self, oid: &ObjectName, off: u64, data: Vec<u8>, snapc: &SnapContext, done: WriteDone);
}

/// Image data layout: fixed-size objects, no interleaved striping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub object_bytes: u64,
}

impl ImageLayout {
    #[must_use]
    pub fn new(object_bytes: u64) -> Self {
        Self { object_bytes }
    }
}

/// Per-image state the cache consults at submit time.
///
/// The snapshot context is read-locked briefly before each backend write;
/// embedders update it from their own metadata watchers.
#[derive(Debug)]
pub struct ImageHandle {
    name: String,
    layout: ImageLayout,
    snap: RwLock<SnapContext>,
}

impl ImageHandle {
    #[must_use]
    pub fn new(name: impl Into<String>, layout: ImageLayout) -> Self {
        Self {
            name: name.into(),
            layout,
            snap: RwLock::new(SnapContext::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Object name for the `object_no`-th object of this image.
    #[must_use]
    pub fn object_name(&self, object_no: u64) -> ObjectName {
        ObjectName(format!("{}.{:016x}", self.name, object_no))
    }

    #[must_use]
    pub fn snap_context(&self) -> SnapContext {
        self.snap.read().clone()
    }

    pub fn set_snap_context(&self, snapc: SnapContext) {
        *self.snap.write() = snapc;
    }
}

/// Maps a contiguous image byte range to object extents.
pub trait Striper: Send + Sync {
    /// Split `[start, start + len)` of `image` into per-object extents.
    ///
    /// `pages` holds `(image_offset, page)` pairs in ascending offset, one
    /// per page, covering the range without gaps; each returned extent
    /// carries its pages rebased to object-relative offsets.
    fn file_to_extents(
        &self,
        image: &ImageHandle,
        start: u64,
        len: u64,
        pages: &[(u64, PageId)],
        page_bytes: u64,
    ) -> Vec<ObjectExtent>;
}

/// Striper for [`ImageLayout`]: one extent per object touched.
#[derive(Debug, Default)]
pub struct UniformStriper;

impl Striper for UniformStriper {
    fn file_to_extents(
        &self,
        image: &ImageHandle,
        start: u64,
        len: u64,
        pages: &[(u64, PageId)],
        page_bytes: u64,
    ) -> Vec<ObjectExtent> {
        let object_bytes = image.layout().object_bytes;
        debug_assert!(object_bytes.is_multiple_of(page_bytes));
        debug_assert!(start.is_multiple_of(page_bytes) && len.is_multiple_of(page_bytes));

        let mut extents = Vec::new();
        let mut pos = start;
        let end = start + len;
        let mut page_it = pages.iter();
        while pos < end {
            let object_no = pos / object_bytes;
            let object_off = pos % object_bytes;
            let piece = (object_bytes - object_off).min(end - pos);
            let piece_pages = (piece / page_bytes) as usize;
            let pages: Vec<(u64, PageId)> = page_it
                .by_ref()
                .take(piece_pages)
                .enumerate()
                .map(|(i, (img_off, page))| {
                    debug_assert_eq!(*img_off, pos + i as u64 * page_bytes);
                    (object_off + i as u64 * page_bytes, *page)
                })
                .collect();
            trace!(
                target: "obc::store",
                event = "extent_mapped",
                image = image.name(),
                object_no,
                object_off,
                length = piece
            );
            extents.push(ObjectExtent {
                oid: image.object_name(object_no),
                object_no,
                offset: object_off,
                length: piece,
                pages,
            });
            pos += piece;
        }
        extents
    }
}

/// In-memory object store.
///
/// Objects are dense byte vectors grown on write; reads past the written
/// length come back as holes. Write failures can be injected to exercise
/// the cache's retry path. Completions fire inline on the caller's thread.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ObjectName, Vec<u8>>>,
    fail_writes: AtomicUsize,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with a transient backend error.
    pub fn inject_write_failures(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn object(&self, oid: &ObjectName) -> Option<Vec<u8>> {
        self.objects.lock().get(oid).cloned()
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn put_object(&self, oid: ObjectName, data: Vec<u8>) {
        self.objects.lock().insert(oid, data);
    }
}

impl ObjectBackend for MemoryObjectStore {
    fn read_sparse(&self, oid: &ObjectName, off: u64, len: u64, _snap_id: SnapId, done: ReadDone) {
        let result = {
            let objects = self.objects.lock();
            match objects.get(oid) {
                None => Err(CacheError::ObjectNotFound(oid.0.clone())),
                Some(data) => {
                    let obj_len = data.len() as u64;
                    if off >= obj_len {
                        Ok(SparseRead::default())
                    } else {
                        let n = len.min(obj_len - off);
                        Ok(SparseRead {
                            extents: vec![(off, n)],
                            data: data[off as usize..(off + n) as usize].to_vec(),
                        })
                    }
                }
            }
        };
        done(result);
    }

    fn write(&self, oid: &ObjectName, off: u64, data: Vec<u8>, _snapc: &SnapContext, done: WriteDone) {
        if self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            debug!(target: "obc::store", event = "injected_write_failure", oid = %oid);
            done(Err(CacheError::Backend {
                code: -ETIMEDOUT,
                detail: "injected transient failure".to_owned(),
            }));
            return;
        }

        let mut objects = self.objects.lock();
        let object = objects.entry(oid.clone()).or_default();
        let end = (off as usize).saturating_add(data.len());
        if object.len() < end {
            object.resize(end, 0);
        }
        object[off as usize..end].copy_from_slice(&data);
        drop(objects);
        done(Ok(()));
    }
}

const ETIMEDOUT: i32 = 110;

enum BackendOp {
    Read {
        oid: ObjectName,
        off: u64,
        len: u64,
        snap_id: SnapId,
        done: ReadDone,
    },
    Write {
        oid: ObjectName,
        off: u64,
        data: Vec<u8>,
        snapc: SnapContext,
        done: WriteDone,
    },
    Stop,
}

/// Dispatches backend operations on a dedicated thread.
///
/// Completions fire on that thread, which is how a real cluster client
/// behaves; tests wrap `MemoryObjectStore` in this to exercise the cache's
/// cross-thread completion paths.
pub struct ThreadedBackend {
    tx: Sender<BackendOp>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedBackend {
    pub fn spawn<B: ObjectBackend + 'static>(inner: B) -> std::io::Result<Self> {
        let (tx, rx) = channel::<BackendOp>();
        let join = thread::Builder::new()
            .name("obc-backend".to_owned())
            .spawn(move || {
                while let Ok(op) = rx.recv() {
                    match op {
                        BackendOp::Read {
                            oid,
                            off,
                            len,
                            snap_id,
                            done,
                        } => inner.read_sparse(&oid, off, len, snap_id, done),
                        BackendOp::Write {
                            oid,
                            off,
                            data,
                            snapc,
                            done,
                        } => inner.write(&oid, off, data, &snapc, done),
                        BackendOp::Stop => break,
                    }
                }
            })?;
        Ok(Self {
            tx,
            join: Mutex::new(Some(join)),
        })
    }
}

impl ObjectBackend for ThreadedBackend {
    fn read_sparse(&self, oid: &ObjectName, off: u64, len: u64, snap_id: SnapId, done: ReadDone) {
        let _ = self.tx.send(BackendOp::Read {
            oid: oid.clone(),
            off,
            len,
            snap_id,
            done,
        });
    }

    fn write(&self, oid: &ObjectName, off: u64, data: Vec<u8>, snapc: &SnapContext, done: WriteDone) {
        let _ = self.tx.send(BackendOp::Write {
            oid: oid.clone(),
            off,
            data,
            snapc: snapc.clone(),
            done,
        });
    }
}

impl Drop for ThreadedBackend {
    fn drop(&mut self) {
        let _ = self.tx.send(BackendOp::Stop);
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}
