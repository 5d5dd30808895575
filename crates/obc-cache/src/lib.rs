#![forbid(unsafe_code)]
//! Block-level page cache over an object store.
//!
//! Sits between a block-device client issuing byte-range reads, writes,
//! discards, and flushes against logical images, and an asynchronous object
//! store. Small and partial I/O is absorbed into fixed-size pages, dirty
//! pages coalesce into object-aligned writebacks, and residency is decided
//! by CAR replacement with ghost history (`obc-pool`).
//!
//! Locking: a registry `RwLock` maps image handles to dense ids; one core
//! mutex with a condition variable guards the page pool, the per-image
//! indexes, and the in-flight counters; a flush mutex with its own
//! condition carries retry writes, flush barriers, and writeback waiters.
//! Locks are only ever taken in that order, never nested in reverse.
//!
//! The flusher thread runs for the cache's whole life; call
//! [`BlockCache::shutdown`] to drain it before dropping the last handle.

use obc_error::{CacheError, Result};
use obc_pool::{ArcClass, HistoryHit, PageLocation, PagePool, PoolStats};
use obc_store::{ImageHandle, ObjectBackend, SparseRead, Striper};
use obc_types::{CacheConfig, CacheShape, ImageId, ObjectExtent, PageId, SharedBuf, SnapId};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

mod completion;

pub use completion::{IoDone, RequestCompletion};

/// Per-image state under the core lock: the resident page index and the
/// ghost (history) index, both keyed by page-aligned image offset.
struct ImageEntry {
    handle: Arc<ImageHandle>,
    index: BTreeMap<u64, PageId>,
    ghost_index: BTreeMap<u64, PageId>,
}

struct CacheCore {
    pool: PagePool,
    images: Vec<Option<ImageEntry>>,
    read_wait: bool,
    write_wait: bool,
    /// Pages currently inside a backend read or write.
    inflight_pages: u32,
}

struct Registry {
    ids: HashMap<String, ImageId>,
    next: u16,
}

#[derive(Default)]
struct FlushCommit {
    pending: u64,
    done: Option<IoDone>,
}

#[derive(Default)]
struct FlushState {
    stopping: bool,
    flush_id: u64,
    commits: BTreeMap<u64, FlushCommit>,
    retry_writes: Vec<PendingWrite>,
    wait_writeback: Vec<IoDone>,
}

/// One submitted object write: enough to retry it and to unwind its pages.
struct PendingWrite {
    handle: Arc<ImageHandle>,
    extent: ObjectExtent,
    data: Vec<u8>,
    flush_id: u64,
    comp: Arc<RequestCompletion>,
}

#[derive(Clone)]
struct ReadTarget {
    buf: SharedBuf,
    start: u64,
    end: u64,
}

/// One submitted sparse object read.
struct PendingRead {
    extent: ObjectExtent,
    dst: Option<ReadTarget>,
    comp: Arc<RequestCompletion>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub pool: PoolStats,
    pub inflight_pages: u32,
}

/// The block page cache.
pub struct BlockCache {
    shape: CacheShape,
    backend: Arc<dyn ObjectBackend>,
    striper: Arc<dyn Striper>,
    registry: RwLock<Registry>,
    core: Mutex<CacheCore>,
    core_cond: Condvar,
    flush: Mutex<FlushState>,
    flush_cond: Condvar,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BlockCache {
    /// Validate `config`, build the pool, and start the flusher thread.
    pub fn new(
        config: &CacheConfig,
        backend: Arc<dyn ObjectBackend>,
        striper: Arc<dyn Striper>,
    ) -> Result<Arc<Self>> {
        let shape = config
            .validate()
            .map_err(|err| CacheError::InvalidConfig(err.to_string()))?;
        let cache = Arc::new(Self {
            shape,
            backend,
            striper,
            registry: RwLock::new(Registry {
                ids: HashMap::new(),
                next: 1,
            }),
            core: Mutex::new(CacheCore {
                pool: PagePool::new(&shape),
                images: Vec::new(),
                read_wait: false,
                write_wait: false,
                inflight_pages: 0,
            }),
            core_cond: Condvar::new(),
            flush: Mutex::new(FlushState::default()),
            flush_cond: Condvar::new(),
            flusher: Mutex::new(None),
        });

        let weak = Arc::downgrade(&cache);
        let join = thread::Builder::new()
            .name("obc-flusher".to_owned())
            .spawn(move || {
                let mut recheck = false;
                loop {
                    let Some(cache) = weak.upgrade() else { break };
                    if cache.flusher_cycle(&mut recheck) {
                        break;
                    }
                }
                trace!(target: "obc::flush", event = "flusher_exit");
            })
            .map_err(CacheError::from)?;
        *cache.flusher.lock() = Some(join);

        info!(
            target: "obc::cache",
            event = "cache_created",
            data_pages = shape.data_pages,
            page_bytes = shape.page_bytes,
            target_pages = shape.target_pages,
            max_dirty_pages = shape.max_dirty_pages
        );
        Ok(cache)
    }

    #[must_use]
    pub fn page_bytes(&self) -> u64 {
        self.shape.page_bytes
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let guard = self.core.lock();
        CacheStats {
            pool: guard.pool.stats(),
            inflight_pages: guard.inflight_pages,
        }
    }

    /// Check the replacement and dirty-tracking invariants; test hook.
    #[must_use]
    pub fn validate(&self) -> bool {
        self.core.lock().pool.validate()
    }

    /// Register an image; idempotent per handle name.
    pub fn register_image(&self, handle: Arc<ImageHandle>) -> Result<ImageId> {
        let mut registry = self.registry.write();
        if let Some(&id) = registry.ids.get(handle.name()) {
            return Ok(id);
        }
        let id = ImageId(registry.next);
        registry.next = registry
            .next
            .checked_add(1)
            .ok_or_else(|| CacheError::Exhausted("image id space".to_owned()))?;
        registry.ids.insert(handle.name().to_owned(), id);

        let mut guard = self.core.lock();
        let slot = id.0 as usize;
        if guard.images.len() <= slot {
            guard.images.resize_with(slot + 1, || None);
        }
        guard.images[slot] = Some(ImageEntry {
            handle,
            index: BTreeMap::new(),
            ghost_index: BTreeMap::new(),
        });
        drop(guard);
        info!(target: "obc::cache", event = "image_registered", image = %id);
        Ok(id)
    }

    /// Drop an image's clean pages and ghost history. The slot is nulled
    /// but never renumbered; dirty pages still on the FIFO are discarded by
    /// the flusher. Must not be called with I/O in flight for the image.
    pub fn unregister_image(&self, handle: &ImageHandle) {
        let Some(id) = self.registry.write().ids.remove(handle.name()) else {
            return;
        };
        let mut guard = self.core.lock();
        let Some(entry) = guard.images[id.0 as usize].take() else {
            return;
        };
        let mut freed = 0_u32;
        let mut dirty_left = 0_u32;
        for (_, pid) in entry.index {
            let page = guard.pool.page(pid);
            debug_assert!(!page.on_read, "unregister with in-flight reads");
            if page.is_dirty() {
                dirty_left += 1;
                continue;
            }
            if matches!(
                page.location(),
                PageLocation::CarLru | PageLocation::CarLfu
            ) {
                guard.pool.car_forget(pid);
                guard.pool.release_page(pid);
                freed += 1;
            }
        }
        for (_, gid) in entry.ghost_index {
            guard.pool.car_remove_ghost(gid);
            guard.pool.release_page(gid);
        }
        Self::wake_waiters(&mut guard, &self.core_cond);
        drop(guard);
        info!(
            target: "obc::cache",
            event = "image_unregistered",
            image = %id,
            freed_pages = freed,
            dirty_left
        );
    }

    fn image_entry(core: &mut CacheCore, image_id: ImageId) -> Result<&mut ImageEntry> {
        core.images
            .get_mut(image_id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(CacheError::ImageUnregistered(image_id.0))
    }

    fn wake_waiters(guard: &mut MutexGuard<'_, CacheCore>, cond: &Condvar) {
        if guard.read_wait || guard.write_wait {
            guard.read_wait = false;
            guard.write_wait = false;
        }
        cond.notify_all();
    }

    fn page_span(&self, offset: u64, len: u64) -> (u64, usize) {
        let page_bytes = self.shape.page_bytes;
        let align_offset = offset - offset % page_bytes;
        let num_pages = (offset + len - align_offset).div_ceil(page_bytes) as usize;
        (align_offset, num_pages)
    }

    // ── Page acquisition ────────────────────────────────────────────────

    /// Populate the page vector for `[align_offset, align_offset +
    /// num_pages · page_bytes)`, blocking on conflicting in-flight pages
    /// and on capacity, and driving CAR admission for misses.
    fn get_pages_locked(
        &self,
        guard: &mut MutexGuard<'_, CacheCore>,
        image_id: ImageId,
        num_pages: usize,
        align_offset: u64,
        only_hit: bool,
    ) -> Result<(Vec<PageId>, Vec<bool>)> {
        let page_bytes = self.shape.page_bytes;
        let end_offset = align_offset + num_pages as u64 * page_bytes;
        let mut pages: Vec<Option<PageId>> = vec![None; num_pages];
        let mut hit = vec![false; num_pages];

        loop {
            // Hit scan. A wait releases the lock, so every wake restarts
            // the scan: pages may have been filled, evicted, or purged.
            'scan: loop {
                pages.fill(None);
                hit.fill(false);
                let in_range: Vec<(u64, PageId)> = Self::image_entry(guard, image_id)?
                    .index
                    .range(align_offset..end_offset)
                    .map(|(&offset, &pid)| (offset, pid))
                    .collect();
                for (offset, pid) in in_range {
                    if guard.pool.page(pid).on_read {
                        trace!(
                            target: "obc::cache",
                            event = "page_inflight_wait",
                            image = %image_id,
                            offset
                        );
                        guard.read_wait = true;
                        self.core_cond.wait(guard);
                        continue 'scan;
                    }
                    guard.pool.car_hit(pid);
                    let idx = ((offset - align_offset) / page_bytes) as usize;
                    pages[idx] = Some(pid);
                    hit[idx] = true;
                }
                break;
            }
            if only_hit {
                let pages = pages
                    .into_iter()
                    .map(|p| p.unwrap_or(PageId(u32::MAX)))
                    .collect();
                return Ok((pages, hit));
            }

            // Capacity gate: bound total buffer usage and give the flusher
            // room to drain dirty pages.
            let claimed = (num_pages as u32)
                .saturating_add(guard.pool.dirty_pages())
                .saturating_add(guard.inflight_pages);
            if claimed < self.shape.data_pages {
                break;
            }
            debug!(
                target: "obc::cache",
                event = "capacity_wait",
                requested = num_pages,
                dirty = guard.pool.dirty_pages(),
                inflight = guard.inflight_pages
            );
            guard.read_wait = true;
            guard.write_wait = true;
            self.core_cond.wait(guard);
        }

        // Miss fill.
        for idx in 0..num_pages {
            if hit[idx] {
                continue;
            }
            let pos = align_offset + idx as u64 * page_bytes;
            match self.admit_miss_slot(guard, image_id, pos) {
                Ok(pid) => pages[idx] = Some(pid),
                Err(err) => {
                    self.unwind_misses(guard, image_id, &pages, &hit, idx, align_offset);
                    return Err(err);
                }
            }
        }

        // A hit page may have been displaced by this call's own evictions;
        // verify identity before handing the vector out.
        let stale = (0..num_pages).any(|idx| {
            hit[idx]
                && pages[idx].is_some_and(|pid| {
                    let page = guard.pool.page(pid);
                    !page.has_frame()
                        || page.image_id != image_id
                        || page.offset != align_offset + idx as u64 * page_bytes
                })
        });
        if stale {
            debug!(target: "obc::cache", event = "hit_displaced_rescan", image = %image_id);
            self.unwind_misses(guard, image_id, &pages, &hit, num_pages, align_offset);
            return self.get_pages_locked(guard, image_id, num_pages, align_offset, only_hit);
        }

        let pages = pages.into_iter().map(|p| p.expect("slot filled")).collect();
        Ok((pages, hit))
    }

    /// Obtain a frame-carrying descriptor for a miss at `pos`, evicting
    /// under CAR when the pool is at capacity, and admit it into the image
    /// index as a detached held page.
    fn admit_miss_slot(
        &self,
        guard: &mut MutexGuard<'_, CacheCore>,
        image_id: ImageId,
        pos: u64,
    ) -> Result<PageId> {
        let core = &mut **guard;
        let ghost = Self::image_entry(core, image_id)?.ghost_index.remove(&pos);
        let hist = ghost.map(|gid| match core.pool.page(gid).class() {
            ArcClass::LfuGhost => HistoryHit::LfuGhost,
            _ => HistoryHit::LruGhost,
        });
        if let Some(gid) = ghost {
            core.pool.car_remove_ghost(gid);
            trace!(target: "obc::cache", event = "ghost_hit", image = %image_id, offset = pos);
        }
        let mut spare = ghost;

        let free = match core.pool.take_free_frame() {
            Ok(free) => free,
            Err(err) => {
                if let Some(gid) = spare {
                    core.pool.release_page(gid);
                }
                return Err(err);
            }
        };
        let desc = match free {
            Some(id) => {
                if let Some(gid) = spare.take() {
                    core.pool.release_page(gid);
                }
                id
            }
            None => {
                let victim = match core.pool.car_evict() {
                    Ok(victim) => victim,
                    Err(err) => {
                        if let Some(gid) = spare {
                            core.pool.release_page(gid);
                        }
                        return Err(err);
                    }
                };
                let victim_image = core.pool.page(victim).image_id;
                let victim_offset = core.pool.page(victim).offset;
                let victim_alive = match core
                    .images
                    .get_mut(victim_image.0 as usize)
                    .and_then(Option::as_mut)
                {
                    Some(entry) => {
                        entry.index.remove(&victim_offset);
                        let prev = entry.ghost_index.insert(victim_offset, victim);
                        debug_assert!(prev.is_none(), "duplicate ghost identity");
                        true
                    }
                    None => false,
                };
                let desc = match spare.take() {
                    Some(gid) => gid,
                    None => match core.pool.take_free_desc() {
                        Some(id) => id,
                        None => match core.pool.car_take_ghost_slot() {
                            Some(gid) => {
                                let gimage = core.pool.page(gid).image_id;
                                let goffset = core.pool.page(gid).offset;
                                if let Some(entry) = core
                                    .images
                                    .get_mut(gimage.0 as usize)
                                    .and_then(Option::as_mut)
                                {
                                    entry.ghost_index.remove(&goffset);
                                }
                                gid
                            }
                            None => {
                                return Err(CacheError::Exhausted(
                                    "no descriptor for miss".to_owned(),
                                ));
                            }
                        },
                    },
                };
                core.pool.transfer_frame(victim, desc);
                if !victim_alive {
                    core.pool.car_remove_ghost(victim);
                    core.pool.release_page(victim);
                }
                desc
            }
        };

        core.pool.car_adjust_and_hold(desc, hist);
        {
            let page = core.pool.page_mut(desc);
            debug_assert!(!page.is_dirty());
            page.image_id = image_id;
            page.offset = pos;
            page.on_read = false;
        }
        let prev = Self::image_entry(core, image_id)?.index.insert(pos, desc);
        debug_assert!(prev.is_none(), "duplicate index identity");
        Ok(desc)
    }

    /// Undo admissions `[0, upto)` of a failed `get_pages` call.
    fn unwind_misses(
        &self,
        guard: &mut MutexGuard<'_, CacheCore>,
        image_id: ImageId,
        pages: &[Option<PageId>],
        hit: &[bool],
        upto: usize,
        align_offset: u64,
    ) {
        let core = &mut **guard;
        for idx in 0..upto {
            if hit[idx] {
                continue;
            }
            let Some(pid) = pages[idx] else { continue };
            let pos = align_offset + idx as u64 * self.shape.page_bytes;
            if let Some(entry) = core
                .images
                .get_mut(image_id.0 as usize)
                .and_then(Option::as_mut)
            {
                entry.index.remove(&pos);
            }
            core.pool.car_unhold(pid);
            core.pool.release_page(pid);
        }
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// Read `len` bytes at `offset` into `buf`. Hits are copied out
    /// immediately; misses become sparse object reads whose holes
    /// zero-fill. `done` fires once with the byte count or the first
    /// error. On an `Err` return nothing was issued and `done` was not
    /// invoked.
    pub fn read_buffer(
        self: &Arc<Self>,
        image_id: ImageId,
        offset: u64,
        len: u64,
        buf: SharedBuf,
        snap_id: SnapId,
        done: IoDone,
    ) -> Result<()> {
        if len == 0 {
            done(Ok(0));
            return Ok(());
        }
        let page_bytes = self.shape.page_bytes;
        let (align_offset, num_pages) = self.page_span(offset, len);
        trace!(
            target: "obc::cache",
            event = "read_buffer",
            image = %image_id,
            offset,
            len,
            pages = num_pages
        );

        let mut need_read: Vec<(u64, PageId)> = Vec::new();
        let handle = {
            let mut guard = self.core.lock();
            let handle = Self::image_entry(&mut guard, image_id)?.handle.clone();
            let (pages, hit) =
                self.get_pages_locked(&mut guard, image_id, num_pages, align_offset, false)?;
            for idx in 0..num_pages {
                let pid = pages[idx];
                let pos = align_offset + idx as u64 * page_bytes;
                if hit[idx] {
                    let start = pos.max(offset);
                    let end = (pos + page_bytes).min(offset + len);
                    buf.copy_in(
                        (start - offset) as usize,
                        &guard.pool.frame_bytes(pid)
                            [(start - pos) as usize..(end - pos) as usize],
                    );
                } else {
                    guard.pool.page_mut(pid).on_read = true;
                    need_read.push((pos, pid));
                }
            }
            guard.inflight_pages += need_read.len() as u32;
            handle
        };

        if need_read.is_empty() {
            done(Ok(len));
            return Ok(());
        }
        let comp = RequestCompletion::new(done);
        let target = ReadTarget {
            buf,
            start: offset,
            end: offset + len,
        };
        self.issue_page_reads(&handle, &need_read, Some(target), &comp, snap_id);
        comp.finish_issue();
        Ok(())
    }

    /// Group `pages` (ascending image offsets, `on_read` already set and
    /// counted in flight) into contiguous runs, map them through the
    /// striper, and issue one sparse read per object extent.
    fn issue_page_reads(
        self: &Arc<Self>,
        handle: &Arc<ImageHandle>,
        pages: &[(u64, PageId)],
        dst: Option<ReadTarget>,
        comp: &Arc<RequestCompletion>,
        snap_id: SnapId,
    ) {
        let page_bytes = self.shape.page_bytes;
        let mut run_start = 0_usize;
        for i in 1..=pages.len() {
            if i < pages.len() && pages[i].0 == pages[i - 1].0 + page_bytes {
                continue;
            }
            let run = &pages[run_start..i];
            run_start = i;
            let start = run[0].0;
            let run_len = run.len() as u64 * page_bytes;
            for extent in self
                .striper
                .file_to_extents(handle, start, run_len, run, page_bytes)
            {
                trace!(
                    target: "obc::cache",
                    event = "object_read_issue",
                    oid = %extent.oid,
                    object_offset = extent.offset,
                    length = extent.length
                );
                comp.add_request();
                let ctx = PendingRead {
                    extent,
                    dst: dst.clone(),
                    comp: Arc::clone(comp),
                };
                let cache = Arc::clone(self);
                let oid = ctx.extent.oid.clone();
                let (object_offset, length) = (ctx.extent.offset, ctx.extent.length);
                self.backend.read_sparse(
                    &oid,
                    object_offset,
                    length,
                    snap_id,
                    Box::new(move |r| cache.complete_read(ctx, r)),
                );
            }
        }
    }

    /// Backend read completion: scatter returned extents into the target
    /// pages, zero the holes, copy the requested slice out to the caller,
    /// and hand the pages to their CAR lists.
    fn complete_read(&self, ctx: PendingRead, r: std::result::Result<SparseRead, CacheError>) {
        let num_pages = ctx.extent.pages.len() as u32;
        let sparse = match r {
            Ok(sparse) => sparse,
            Err(CacheError::ObjectNotFound(_)) => SparseRead::default(),
            Err(err) => {
                warn!(
                    target: "obc::cache",
                    event = "object_read_failed",
                    oid = %ctx.extent.oid,
                    error = %err
                );
                let mut guard = self.core.lock();
                for &(_, pid) in &ctx.extent.pages {
                    // Drop the unfilled pages entirely so stale frame
                    // bytes can never surface as data.
                    let image_id = guard.pool.page(pid).image_id;
                    let offset = guard.pool.page(pid).offset;
                    guard.pool.page_mut(pid).on_read = false;
                    if let Some(entry) = guard
                        .images
                        .get_mut(image_id.0 as usize)
                        .and_then(Option::as_mut)
                    {
                        entry.index.remove(&offset);
                    }
                    guard.pool.car_unhold(pid);
                    guard.pool.release_page(pid);
                }
                guard.inflight_pages -= num_pages;
                Self::wake_waiters(&mut guard, &self.core_cond);
                drop(guard);
                ctx.comp.complete_request(Err(err));
                return;
            }
        };

        let page_bytes = self.shape.page_bytes;
        let mut guard = self.core.lock();

        // Data segments as (object_offset, length, data_offset).
        let mut segments = Vec::with_capacity(sparse.extents.len());
        let mut cursor = 0_u64;
        for &(object_offset, length) in &sparse.extents {
            segments.push((object_offset, length, cursor));
            cursor += length;
        }

        for &(page_object_offset, pid) in &ctx.extent.pages {
            let frame = guard.pool.frame_bytes_mut(pid);
            frame.fill(0);
            for &(object_offset, length, data_offset) in &segments {
                let start = object_offset.max(page_object_offset);
                let end = (object_offset + length).min(page_object_offset + page_bytes);
                if start < end {
                    let src_start = (data_offset + (start - object_offset)) as usize;
                    let src_end = (data_offset + (end - object_offset)) as usize;
                    frame[(start - page_object_offset) as usize
                        ..(end - page_object_offset) as usize]
                        .copy_from_slice(&sparse.data[src_start..src_end]);
                }
            }
        }

        let mut copied = 0_u64;
        for &(_, pid) in &ctx.extent.pages {
            let image_offset = guard.pool.page(pid).offset;
            if let Some(target) = &ctx.dst {
                let start = image_offset.max(target.start);
                let end = (image_offset + page_bytes).min(target.end);
                if start < end {
                    target.buf.copy_in(
                        (start - target.start) as usize,
                        &guard.pool.frame_bytes(pid)
                            [(start - image_offset) as usize..(end - image_offset) as usize],
                    );
                    copied += end - start;
                }
            }
            let page = guard.pool.page_mut(pid);
            debug_assert!(page.on_read);
            page.on_read = false;
            guard.pool.car_insert(pid);
        }
        guard.inflight_pages -= num_pages;
        Self::wake_waiters(&mut guard, &self.core_cond);
        drop(guard);

        let contribution = if ctx.dst.is_some() {
            copied
        } else {
            ctx.extent.length
        };
        ctx.comp.complete_request(Ok(contribution));
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Write `data` at `offset`. Bytes land in cache pages immediately; in
    /// writethrough mode the pages are also submitted to the backend before
    /// `done` fires, in writeback mode `done` may be deferred until the
    /// flusher drains below target. Edge pages of a cold write that the
    /// data does not fully cover are populated by a read first. On an
    /// `Err` return `done` was not invoked.
    pub fn write_buffer(
        self: &Arc<Self>,
        image_id: ImageId,
        offset: u64,
        data: &[u8],
        done: IoDone,
    ) -> Result<()> {
        if data.is_empty() {
            done(Ok(0));
            return Ok(());
        }
        let len = data.len() as u64;
        let page_bytes = self.shape.page_bytes;
        let end = offset + len;
        let (align_offset, num_pages) = self.page_span(offset, len);
        trace!(
            target: "obc::cache",
            event = "write_buffer",
            image = %image_id,
            offset,
            len,
            pages = num_pages
        );

        let mut guard = self.core.lock();
        let handle = Self::image_entry(&mut guard, image_id)?.handle.clone();

        // Admission plus read-modify-write for partially covered cold edge
        // pages: populate them through the normal miss-read machinery, then
        // rescan and observe them as hits.
        let pages = loop {
            let (pages, hit) =
                self.get_pages_locked(&mut guard, image_id, num_pages, align_offset, false)?;
            let mut rmw: Vec<(u64, PageId)> = Vec::new();
            let mut edges = vec![0_usize];
            if num_pages > 1 {
                edges.push(num_pages - 1);
            }
            for &idx in &edges {
                let pos = align_offset + idx as u64 * page_bytes;
                let fully_covered = offset <= pos && pos + page_bytes <= end;
                if !hit[idx] && !fully_covered {
                    rmw.push((pos, pages[idx]));
                }
            }
            if rmw.is_empty() {
                break pages;
            }
            for &(_, pid) in &rmw {
                guard.pool.page_mut(pid).on_read = true;
            }
            guard.inflight_pages += rmw.len() as u32;
            debug!(
                target: "obc::cache",
                event = "write_read_modify",
                image = %image_id,
                offset,
                pages = rmw.len()
            );
            drop(guard);

            let gate: Arc<(Mutex<Option<Result<u64>>>, Condvar)> =
                Arc::new((Mutex::new(None), Condvar::new()));
            let signal = Arc::clone(&gate);
            let comp = RequestCompletion::new(Box::new(move |r| {
                *signal.0.lock() = Some(r);
                signal.1.notify_all();
            }));
            self.issue_page_reads(&handle, &rmw, None, &comp, SnapId::HEAD);
            comp.finish_issue();
            let result = {
                let mut slot = gate.0.lock();
                while slot.is_none() {
                    gate.1.wait(&mut slot);
                }
                slot.take().expect("gate filled")
            };
            if let Err(err) = result {
                done(Err(err));
                return Ok(());
            }
            guard = self.core.lock();
        };

        let writethrough = guard.pool.writethrough();
        for idx in 0..num_pages {
            let pid = pages[idx];
            let pos = align_offset + idx as u64 * page_bytes;
            let start = pos.max(offset);
            let stop = (pos + page_bytes).min(end);
            guard.pool.frame_bytes_mut(pid)[(start - pos) as usize..(stop - pos) as usize]
                .copy_from_slice(&data[(start - offset) as usize..(stop - offset) as usize]);
            let linked = matches!(
                guard.pool.page(pid).location(),
                PageLocation::CarLru | PageLocation::CarLfu
            );
            if linked {
                guard.pool.car_detach_held(pid);
            }
            if !writethrough {
                guard.pool.mark_dirty(pid);
            }
        }

        if writethrough {
            let all_pages: Vec<(u64, PageId)> = (0..num_pages)
                .map(|idx| (align_offset + idx as u64 * page_bytes, pages[idx]))
                .collect();
            let extents = self.striper.file_to_extents(
                &handle,
                align_offset,
                num_pages as u64 * page_bytes,
                &all_pages,
                page_bytes,
            );
            let comp = RequestCompletion::new(done);
            let mut writes = Vec::with_capacity(extents.len());
            for extent in extents {
                let mut payload = Vec::with_capacity(extent.length as usize);
                for &(_, pid) in &extent.pages {
                    payload.extend_from_slice(guard.pool.frame_bytes(pid));
                }
                writes.push(PendingWrite {
                    handle: Arc::clone(&handle),
                    extent,
                    data: payload,
                    flush_id: 0,
                    comp: Arc::clone(&comp),
                });
            }
            drop(guard);
            self.enroll_and_submit(writes);
            comp.finish_issue();
        } else if guard.pool.need_writeback() {
            drop(guard);
            debug!(
                target: "obc::cache",
                event = "writeback_backpressure",
                image = %image_id,
                offset
            );
            self.flush.lock().wait_writeback.push(done);
            self.flush_cond.notify_all();
        } else {
            drop(guard);
            done(Ok(0));
        }
        Ok(())
    }

    // ── Writeback ───────────────────────────────────────────────────────

    /// Register `writes` under the current flush id and submit them.
    fn enroll_and_submit(self: &Arc<Self>, mut writes: Vec<PendingWrite>) {
        if writes.is_empty() {
            return;
        }
        {
            // Barrier publication happens here, before any submit, so a
            // completion cannot race past an unregistered flush id.
            let mut flush = self.flush.lock();
            let flush_id = flush.flush_id;
            for write in &mut writes {
                write.flush_id = flush_id;
                flush.commits.entry(flush_id).or_default().pending += 1;
                write.comp.add_request();
            }
        }
        for write in writes {
            self.submit_object_write(write);
        }
    }

    /// Send one object write to the backend; also used verbatim by the
    /// retry path (the snapshot context is reloaded per submit).
    fn submit_object_write(self: &Arc<Self>, write: PendingWrite) {
        {
            let mut guard = self.core.lock();
            guard.inflight_pages += write.extent.pages.len() as u32;
        }
        let snapc = write.handle.snap_context();
        let oid = write.extent.oid.clone();
        let object_offset = write.extent.offset;
        let payload = write.data.clone();
        trace!(
            target: "obc::flush",
            event = "object_write_issue",
            oid = %oid,
            object_offset,
            length = write.extent.length,
            flush_id = write.flush_id
        );
        let cache = Arc::clone(self);
        self.backend.write(
            &oid,
            object_offset,
            payload,
            &snapc,
            Box::new(move |r| cache.complete_write(write, r)),
        );
    }

    /// Backend write completion: queue transient failures for retry, else
    /// settle the flush barrier and return clean pages to their lists.
    fn complete_write(
        self: &Arc<Self>,
        write: PendingWrite,
        r: std::result::Result<(), CacheError>,
    ) {
        let num_pages = write.extent.pages.len() as u32;
        {
            let mut guard = self.core.lock();
            guard.inflight_pages -= num_pages;
            Self::wake_waiters(&mut guard, &self.core_cond);
        }

        if let Err(err) = &r
            && err.is_transient()
        {
            warn!(
                target: "obc::flush",
                event = "write_retry_queued",
                oid = %write.extent.oid,
                flush_id = write.flush_id,
                error = %err
            );
            self.flush.lock().retry_writes.push(write);
            self.flush_cond.notify_all();
            return;
        }

        self.settle_write(write, r);
    }

    /// Barrier bookkeeping and page reinsertion for a write that will not
    /// be retried. Also the terminal path for writes cancelled at
    /// shutdown, whose in-flight count was already dropped.
    fn settle_write(&self, write: PendingWrite, r: std::result::Result<(), CacheError>) {
        let mut barrier: Option<IoDone> = None;
        {
            let mut flush = self.flush.lock();
            let flush_id = write.flush_id;
            if let Some(commit) = flush.commits.get_mut(&flush_id) {
                commit.pending -= 1;
                if commit.pending == 0 && flush.flush_id > flush_id {
                    let commit = flush.commits.remove(&flush_id).expect("commit present");
                    barrier = commit.done;
                    debug!(
                        target: "obc::flush",
                        event = "flush_barrier_complete",
                        flush_id
                    );
                }
            }
            self.flush_cond.notify_all();
        }

        {
            let mut guard = self.core.lock();
            for &(_, pid) in &write.extent.pages {
                let page = guard.pool.page(pid);
                assert!(!page.on_read);
                // A page re-dirtied while the write was in flight stays on
                // the FIFO for another round.
                if !page.is_dirty() && page.location() == PageLocation::Detached {
                    guard.pool.car_insert(pid);
                }
            }
            Self::wake_waiters(&mut guard, &self.core_cond);
        }

        if let Some(done) = barrier {
            done(Ok(0));
        }
        write.comp.complete_request(r.map(|()| 0));
    }

    /// Detach up to `num` of the oldest dirty pages (0 means all),
    /// partition them by image, coalesce contiguous pages, and submit one
    /// backend write per object extent. Dirty pages of an unregistered
    /// image are discarded back to their clean lists.
    fn flush_pages(self: &Arc<Self>, num: u32) {
        let page_bytes = self.shape.page_bytes;
        let comp = RequestCompletion::new(Box::new(|_| {}));
        let mut writes: Vec<PendingWrite> = Vec::new();
        {
            let mut guard = self.core.lock();
            let taken = guard.pool.take_dirty(num);
            if taken.is_empty() {
                return;
            }
            debug!(target: "obc::flush", event = "flush_pages", pages = taken.len());
            let mut by_image: BTreeMap<ImageId, BTreeMap<u64, PageId>> = BTreeMap::new();
            for pid in taken {
                let page = guard.pool.page(pid);
                by_image
                    .entry(page.image_id)
                    .or_default()
                    .insert(page.offset, pid);
            }
            let mut discarded = false;
            for (image_id, group) in by_image {
                let handle = guard
                    .images
                    .get(image_id.0 as usize)
                    .and_then(Option::as_ref)
                    .map(|entry| entry.handle.clone());
                let Some(handle) = handle else {
                    warn!(
                        target: "obc::flush",
                        event = "flush_image_unregistered",
                        image = %image_id,
                        discarded_pages = group.len()
                    );
                    for (_, pid) in group {
                        guard.pool.car_insert(pid);
                    }
                    discarded = true;
                    continue;
                };
                let flat: Vec<(u64, PageId)> = group.into_iter().collect();
                let mut run_start = 0_usize;
                for i in 1..=flat.len() {
                    if i < flat.len() && flat[i].0 == flat[i - 1].0 + page_bytes {
                        continue;
                    }
                    let run = &flat[run_start..i];
                    run_start = i;
                    let start = run[0].0;
                    let run_len = run.len() as u64 * page_bytes;
                    for extent in
                        self.striper
                            .file_to_extents(&handle, start, run_len, run, page_bytes)
                    {
                        let mut payload = Vec::with_capacity(extent.length as usize);
                        for &(_, pid) in &extent.pages {
                            payload.extend_from_slice(guard.pool.frame_bytes(pid));
                        }
                        writes.push(PendingWrite {
                            handle: Arc::clone(&handle),
                            extent,
                            data: payload,
                            flush_id: 0,
                            comp: Arc::clone(&comp),
                        });
                    }
                }
            }
            if discarded {
                Self::wake_waiters(&mut guard, &self.core_cond);
            }
        }
        self.enroll_and_submit(writes);
        comp.finish_issue();
    }

    /// Flush everything dirty and notify `done` once all writes submitted
    /// under this barrier have completed. Also switches the cache out of
    /// its initial pass-through mode.
    pub fn user_flush(self: &Arc<Self>, done: IoDone) {
        debug!(target: "obc::flush", event = "user_flush");
        self.core.lock().pool.set_writeback();
        self.flush_pages(0);

        let mut flush = self.flush.lock();
        let flush_id = flush.flush_id;
        let pending = flush.commits.get(&flush_id).map_or(0, |c| c.pending);
        if pending == 0 {
            flush.commits.remove(&flush_id);
            drop(flush);
            done(Ok(0));
        } else {
            flush
                .commits
                .get_mut(&flush_id)
                .expect("pending commit")
                .done = Some(done);
            flush.flush_id += 1;
            debug!(
                target: "obc::flush",
                event = "flush_barrier_armed",
                flush_id,
                pending
            );
        }
    }

    // ── Discard and purge ───────────────────────────────────────────────

    /// Zero the intersection of `[offset, offset + len)` with every
    /// resident page. Misses are a no-op.
    pub fn discard(&self, image_id: ImageId, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let page_bytes = self.shape.page_bytes;
        let end = offset + len;
        let (align_offset, num_pages) = self.page_span(offset, len);
        let mut guard = self.core.lock();
        let (pages, hit) =
            self.get_pages_locked(&mut guard, image_id, num_pages, align_offset, true)?;
        let mut zeroed = 0_u64;
        for idx in 0..num_pages {
            if !hit[idx] {
                continue;
            }
            let pos = align_offset + idx as u64 * page_bytes;
            let start = pos.max(offset);
            let stop = (pos + page_bytes).min(end);
            guard.pool.frame_bytes_mut(pages[idx])[(start - pos) as usize..(stop - pos) as usize]
                .fill(0);
            zeroed += stop - start;
        }
        drop(guard);
        trace!(
            target: "obc::cache",
            event = "discard",
            image = %image_id,
            offset,
            len,
            zeroed
        );
        Ok(())
    }

    /// Drop every resident page and ghost of the image. The caller
    /// guarantees nothing is dirty or in flight.
    pub fn purge(&self, image_id: ImageId) -> Result<()> {
        let mut guard = self.core.lock();
        let entry = Self::image_entry(&mut guard, image_id)?;
        let resident: Vec<PageId> = entry.index.values().copied().collect();
        let ghosts: Vec<PageId> = entry.ghost_index.values().copied().collect();
        entry.index.clear();
        entry.ghost_index.clear();
        for pid in resident {
            let page = guard.pool.page(pid);
            assert!(!page.is_dirty(), "purge with dirty pages");
            assert!(!page.on_read, "purge with in-flight pages");
            guard.pool.car_forget(pid);
            guard.pool.release_page(pid);
        }
        let ghost_count = ghosts.len();
        for gid in ghosts {
            guard.pool.car_remove_ghost(gid);
            guard.pool.release_page(gid);
        }
        Self::wake_waiters(&mut guard, &self.core_cond);
        drop(guard);
        info!(
            target: "obc::cache",
            event = "purge",
            image = %image_id,
            ghosts = ghost_count
        );
        Ok(())
    }

    // ── Flusher ─────────────────────────────────────────────────────────

    /// One flusher iteration; returns true when the cache is stopping.
    fn flusher_cycle(self: &Arc<Self>, recheck: &mut bool) -> bool {
        let mut flush = self.flush.lock();
        if !*recheck && !flush.stopping {
            let _ = self
                .flush_cond
                .wait_for(&mut flush, Duration::from_secs(1));
        }
        *recheck = false;
        if flush.stopping {
            drop(flush);
            self.shutdown_drain();
            return true;
        }

        let retries: Vec<PendingWrite> = flush.retry_writes.drain(..).collect();
        drop(flush);
        for write in retries {
            debug!(
                target: "obc::flush",
                event = "write_retry",
                oid = %write.extent.oid,
                flush_id = write.flush_id
            );
            self.submit_object_write(write);
        }

        let (num_flush, age_exceeded) = {
            let guard = self.core.lock();
            let age_exceeded = guard
                .pool
                .oldest_dirty_age()
                .is_some_and(|age| age > guard.pool.max_dirty_age());
            (guard.pool.need_writeback_pages(), age_exceeded)
        };
        if age_exceeded {
            debug!(target: "obc::flush", event = "dirty_age_flush");
            self.flush_pages(0);
        } else if num_flush > 0 {
            self.flush_pages(num_flush);
        }

        let waiters: Vec<IoDone> = {
            let mut flush = self.flush.lock();
            flush.wait_writeback.drain(..).collect()
        };
        if !waiters.is_empty() {
            *recheck = true;
            for done in waiters {
                done(Ok(0));
            }
        }
        false
    }

    /// Wait out in-flight pages, then fail any writes still queued for
    /// retry with a cancellation status.
    fn shutdown_drain(self: &Arc<Self>) {
        {
            let mut guard = self.core.lock();
            while guard.inflight_pages > 0 {
                debug!(
                    target: "obc::flush",
                    event = "shutdown_inflight_wait",
                    inflight = guard.inflight_pages
                );
                guard.read_wait = true;
                guard.write_wait = true;
                self.core_cond.wait(&mut guard);
            }
        }
        loop {
            let write = self.flush.lock().retry_writes.pop();
            match write {
                Some(write) => {
                    warn!(
                        target: "obc::flush",
                        event = "retry_cancelled_at_shutdown",
                        oid = %write.extent.oid
                    );
                    self.settle_write(write, Err(CacheError::Cancelled));
                }
                None => break,
            }
        }
        info!(target: "obc::flush", event = "flusher_stopped");
    }

    /// Stop the flusher: drain retries, wait for in-flight I/O, join the
    /// thread. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut flush = self.flush.lock();
            if flush.stopping {
                return;
            }
            flush.stopping = true;
        }
        self.flush_cond.notify_all();
        if let Some(join) = self.flusher.lock().take() {
            let _ = join.join();
        }
    }
}
