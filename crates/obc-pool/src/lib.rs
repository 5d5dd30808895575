#![forbid(unsafe_code)]
//! Page arena, region allocator, CAR replacement, and dirty tracking.
//!
//! All pages live in one arena indexed by `PageId`; every list in the pool
//! (the four CAR lists, the dirty FIFO, and the two free lists) is intrusive
//! through the per-page `prev`/`next` indices. A page is in at most one list
//! at a time; `PageLocation` names which one and every transition asserts
//! against it.
//!
//! Nothing here locks: the owning cache serialises access behind its core
//! mutex. Throughput comes from coarse critical sections around O(1) or
//! O(log n) work.

use obc_error::{CacheError, Result};
use obc_types::{CacheShape, FrameId, ImageId, PageId};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

mod car;

pub use car::{ArcClass, CarState, HistoryHit};

/// Which intrusive list currently links a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    FreeDesc,
    FreeFrame,
    CarLru,
    CarLfu,
    CarLruGhost,
    CarLfuGhost,
    DirtyFifo,
    /// Held by a caller: in flight or just allocated.
    Detached,
}

/// One page descriptor in the arena.
#[derive(Debug)]
pub struct Page {
    pub image_id: ImageId,
    /// Page-aligned byte offset within the image.
    pub offset: u64,
    /// True while a backend read is filling this page.
    pub on_read: bool,
    frame: Option<FrameId>,
    class: ArcClass,
    location: PageLocation,
    referenced: bool,
    dirty: bool,
    dirtied_at: Option<Instant>,
    prev: Option<PageId>,
    next: Option<PageId>,
}

impl Page {
    fn new() -> Self {
        Self {
            image_id: ImageId(0),
            offset: 0,
            on_read: false,
            frame: None,
            class: ArcClass::Lru,
            location: PageLocation::Detached,
            referenced: false,
            dirty: false,
            dirtied_at: None,
            prev: None,
            next: None,
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn has_frame(&self) -> bool {
        self.frame.is_some()
    }

    #[must_use]
    pub fn location(&self) -> PageLocation {
        self.location
    }

    #[must_use]
    pub fn class(&self) -> ArcClass {
        self.class
    }
}

/// Head/tail of one intrusive list, with its physical length.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ListHead {
    head: Option<PageId>,
    tail: Option<PageId>,
    len: u32,
}

impl ListHead {
    pub(crate) fn len(&self) -> u32 {
        self.len
    }
}

/// The backing array of page descriptors plus the raw list operations.
#[derive(Debug)]
pub struct PageArena {
    pages: Vec<Page>,
}

impl PageArena {
    fn with_descriptors(n: u32) -> Self {
        let mut pages = Vec::with_capacity(n as usize);
        pages.resize_with(n as usize, Page::new);
        Self { pages }
    }

    #[must_use]
    pub fn page(&self, id: PageId) -> &Page {
        &self.pages[id.0 as usize]
    }

    pub fn page_mut(&mut self, id: PageId) -> &mut Page {
        &mut self.pages[id.0 as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Append `id` to the tail of `list` and stamp `location`.
    pub(crate) fn push_tail(&mut self, list: &mut ListHead, id: PageId, location: PageLocation) {
        {
            let page = self.page(id);
            assert_eq!(page.location, PageLocation::Detached, "page already linked");
            assert!(page.prev.is_none() && page.next.is_none());
        }
        let old_tail = list.tail;
        if let Some(tail) = old_tail {
            self.page_mut(tail).next = Some(id);
        }
        let page = self.page_mut(id);
        page.prev = old_tail;
        page.next = None;
        page.location = location;
        list.tail = Some(id);
        if list.head.is_none() {
            list.head = Some(id);
        }
        list.len += 1;
    }

    /// Detach the head of `list`, if any.
    pub(crate) fn pop_head(&mut self, list: &mut ListHead) -> Option<PageId> {
        let id = list.head?;
        self.unlink(list, id);
        Some(id)
    }

    /// Detach `id` from `list`; the page must currently be linked there.
    pub(crate) fn unlink(&mut self, list: &mut ListHead, id: PageId) {
        let (prev, next) = {
            let page = self.page(id);
            assert_ne!(page.location, PageLocation::Detached, "page not linked");
            (page.prev, page.next)
        };
        match prev {
            Some(p) => self.page_mut(p).next = next,
            None => list.head = next,
        }
        match next {
            Some(n) => self.page_mut(n).prev = prev,
            None => list.tail = prev,
        }
        let page = self.page_mut(id);
        page.prev = None;
        page.next = None;
        page.location = PageLocation::Detached;
        list.len -= 1;
    }

    pub(crate) fn head(&self, list: &ListHead) -> Option<PageId> {
        list.head
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameRef {
    region: u32,
    offset: usize,
}

/// Dirty-page FIFO plus the writeback policy knobs.
#[derive(Debug)]
struct DirtyState {
    wt: bool,
    fifo: ListHead,
    dirty_pages: u32,
    target_pages: u32,
    max_dirty_pages: u32,
    max_dirty_age: Duration,
}

impl DirtyState {
    fn writethrough(&self) -> bool {
        self.wt || self.max_dirty_pages == 0
    }

    fn need_writeback_pages(&self) -> u32 {
        self.dirty_pages.saturating_sub(self.target_pages)
    }
}

/// Point-in-time counters for tests and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub lru_len: u32,
    pub lfu_len: u32,
    pub lru_ghost_len: u32,
    pub lfu_ghost_len: u32,
    pub arc_lru_limit: u32,
    pub data_pages: u32,
    pub dirty_pages: u32,
    pub free_frames: u32,
    pub free_descriptors: u32,
    pub remain_data_pages: u32,
}

/// Owns the page descriptors, the buffer regions, the CAR engine, and the
/// dirty FIFO.
#[derive(Debug)]
pub struct PagePool {
    page_bytes: u64,
    region_pages: u32,
    remain_data_pages: u32,
    arena: PageArena,
    regions: Vec<Vec<u8>>,
    frames: Vec<FrameRef>,
    free_descs: ListHead,
    free_frames: ListHead,
    car: CarState,
    dirty: DirtyState,
}

impl PagePool {
    /// Build a pool for `shape`: `2 * data_pages` descriptors, no buffer
    /// regions yet. Regions grow on first demand.
    #[must_use]
    pub fn new(shape: &CacheShape) -> Self {
        let descriptors = shape.data_pages * 2;
        let mut pool = Self {
            page_bytes: shape.page_bytes,
            region_pages: shape.region_pages,
            remain_data_pages: shape.data_pages,
            arena: PageArena::with_descriptors(descriptors),
            regions: Vec::new(),
            frames: Vec::new(),
            free_descs: ListHead::default(),
            free_frames: ListHead::default(),
            car: CarState::new(shape.data_pages),
            dirty: DirtyState {
                wt: true,
                fifo: ListHead::default(),
                dirty_pages: 0,
                target_pages: shape.target_pages,
                max_dirty_pages: shape.max_dirty_pages,
                max_dirty_age: shape.max_dirty_age,
            },
        };
        for i in 0..descriptors {
            pool.arena
                .push_tail(&mut pool.free_descs, PageId(i), PageLocation::FreeDesc);
        }
        debug!(
            target: "obc::pool",
            event = "pool_created",
            data_pages = shape.data_pages,
            descriptors,
            page_bytes = shape.page_bytes
        );
        pool
    }

    #[must_use]
    pub fn page_bytes(&self) -> u64 {
        self.page_bytes
    }

    #[must_use]
    pub fn data_pages(&self) -> u32 {
        self.car.data_pages()
    }

    #[must_use]
    pub fn page(&self, id: PageId) -> &Page {
        self.arena.page(id)
    }

    pub fn page_mut(&mut self, id: PageId) -> &mut Page {
        self.arena.page_mut(id)
    }

    /// Buffer bytes of a frame-carrying page.
    #[must_use]
    pub fn frame_bytes(&self, id: PageId) -> &[u8] {
        let frame = self.arena.page(id).frame.expect("page has no frame");
        let FrameRef { region, offset } = self.frames[frame.0 as usize];
        &self.regions[region as usize][offset..offset + self.page_bytes as usize]
    }

    pub fn frame_bytes_mut(&mut self, id: PageId) -> &mut [u8] {
        let frame = self.arena.page(id).frame.expect("page has no frame");
        let FrameRef { region, offset } = self.frames[frame.0 as usize];
        &mut self.regions[region as usize][offset..offset + self.page_bytes as usize]
    }

    /// Grow one region: claim descriptors from the free list, allocate a
    /// slab, and push the new frame-carrying pages onto the frame list.
    ///
    /// Growth is capped by `region_pages` per call and by
    /// `remain_data_pages` overall.
    pub fn grow_region(&mut self) -> Result<u32> {
        let num_pages = self.remain_data_pages.min(self.region_pages);
        assert!(num_pages > 0, "region growth with no remaining budget");
        let size = num_pages as usize * self.page_bytes as usize;
        let mut region = Vec::new();
        region
            .try_reserve_exact(size)
            .map_err(|_| CacheError::Exhausted(format!("region allocation of {size} bytes")))?;
        region.resize(size, 0);
        let region_idx = u32::try_from(self.regions.len())
            .map_err(|_| CacheError::Exhausted("region table overflow".to_owned()))?;
        self.regions.push(region);

        for i in 0..num_pages {
            let id = self
                .arena
                .pop_head(&mut self.free_descs)
                .ok_or_else(|| CacheError::Exhausted("no free page descriptors".to_owned()))?;
            let frame = FrameId(self.frames.len() as u32);
            self.frames.push(FrameRef {
                region: region_idx,
                offset: i as usize * self.page_bytes as usize,
            });
            self.arena.page_mut(id).frame = Some(frame);
            self.arena
                .push_tail(&mut self.free_frames, id, PageLocation::FreeFrame);
        }
        self.remain_data_pages -= num_pages;
        debug!(
            target: "obc::pool",
            event = "region_grow",
            region = region_idx,
            pages = num_pages,
            remain_data_pages = self.remain_data_pages
        );
        Ok(num_pages)
    }

    /// Pop a frame-carrying descriptor, growing a region if the budget
    /// allows. `Ok(None)` means the cache is at capacity and the caller
    /// must evict.
    pub fn take_free_frame(&mut self) -> Result<Option<PageId>> {
        if let Some(id) = self.arena.pop_head(&mut self.free_frames) {
            return Ok(Some(id));
        }
        if self.remain_data_pages > 0 {
            self.grow_region()?;
            return Ok(self.arena.pop_head(&mut self.free_frames));
        }
        Ok(None)
    }

    /// Pop a bare descriptor from the free list.
    pub fn take_free_desc(&mut self) -> Option<PageId> {
        self.arena.pop_head(&mut self.free_descs)
    }

    /// Return a detached page to the free lists, dropping its identity.
    pub fn release_page(&mut self, id: PageId) {
        let has_frame = {
            let page = self.arena.page(id);
            assert_eq!(page.location, PageLocation::Detached);
            assert!(!page.dirty && !page.on_read);
            page.has_frame()
        };
        if has_frame {
            self.arena
                .push_tail(&mut self.free_frames, id, PageLocation::FreeFrame);
        } else {
            self.arena
                .push_tail(&mut self.free_descs, id, PageLocation::FreeDesc);
        }
    }

    /// Move the frame from `from` (becoming a ghost) onto `to`.
    pub fn transfer_frame(&mut self, from: PageId, to: PageId) {
        let frame = self
            .arena
            .page_mut(from)
            .frame
            .take()
            .expect("transfer from frameless page");
        let dst = self.arena.page_mut(to);
        assert!(dst.frame.is_none(), "transfer onto frame-carrying page");
        dst.frame = Some(frame);
    }

    // CAR wrappers: the engine borrows the arena, so the split happens here.

    /// Record a hit: set the reference bit. No list movement.
    pub fn car_hit(&mut self, id: PageId) {
        self.car.hit_page(&mut self.arena, id);
    }

    /// Adapt the LRU target for `hist`, assign the admission class, and
    /// count the page as held in flight (not yet linked).
    pub fn car_adjust_and_hold(&mut self, id: PageId, hist: Option<HistoryHit>) {
        self.car.adjust_and_hold(&mut self.arena, id, hist);
    }

    /// Link an in-flight page into the list its class counter already
    /// accounts for.
    pub fn car_insert(&mut self, id: PageId) {
        self.car.insert_page(&mut self.arena, id);
    }

    /// Detach a resident page for dirtying or an in-flight write, keeping
    /// its class counted.
    pub fn car_detach_held(&mut self, id: PageId) {
        self.car.make_dirty(&mut self.arena, id);
    }

    /// Evict one clean resident page to its ghost list and return it.
    pub fn car_evict(&mut self) -> Result<PageId> {
        self.car
            .evict_data(&mut self.arena)
            .ok_or_else(|| CacheError::Exhausted("no evictable resident pages".to_owned()))
    }

    /// Reclaim a ghost descriptor per the CAR bounds; callers try the free
    /// list first.
    pub fn car_take_ghost_slot(&mut self) -> Option<PageId> {
        self.car.take_ghost_slot(&mut self.arena)
    }

    /// Detach a specific ghost page from its ghost list.
    pub fn car_remove_ghost(&mut self, id: PageId) {
        self.car.remove_ghost(&mut self.arena, id);
    }

    /// Drop the held class count of a page that will not be inserted
    /// (undo of `car_adjust_and_hold`).
    pub fn car_unhold(&mut self, id: PageId) {
        self.car.unhold(&mut self.arena, id);
    }

    /// Detach a resident page from its CAR list and drop its class count
    /// entirely (teardown paths: purge, unregister).
    pub fn car_forget(&mut self, id: PageId) {
        self.car.forget_page(&mut self.arena, id);
    }

    // Dirty FIFO.

    /// Mark `id` dirty and move it to the FIFO tail.
    pub fn mark_dirty(&mut self, id: PageId) {
        let dirty = {
            let page = self.arena.page(id);
            assert!(!page.on_read);
            page.dirty
        };
        if dirty {
            self.arena.unlink(&mut self.dirty.fifo, id);
        } else {
            assert_eq!(self.arena.page(id).location, PageLocation::Detached);
            self.dirty.dirty_pages += 1;
        }
        let page = self.arena.page_mut(id);
        page.dirty = true;
        page.dirtied_at = Some(Instant::now());
        self.arena
            .push_tail(&mut self.dirty.fifo, id, PageLocation::DirtyFifo);
    }

    /// Detach up to `num` pages from the FIFO head (0 means all), clearing
    /// their dirty flags.
    pub fn take_dirty(&mut self, num: u32) -> Vec<PageId> {
        let take = if num == 0 {
            self.dirty.dirty_pages
        } else {
            num.min(self.dirty.dirty_pages)
        };
        let mut out = Vec::with_capacity(take as usize);
        for _ in 0..take {
            let id = self
                .arena
                .pop_head(&mut self.dirty.fifo)
                .expect("dirty count drift");
            let page = self.arena.page_mut(id);
            page.dirty = false;
            page.dirtied_at = None;
            out.push(id);
        }
        self.dirty.dirty_pages -= take;
        trace!(
            target: "obc::pool",
            event = "dirty_taken",
            requested = num,
            taken = take,
            remaining = self.dirty.dirty_pages
        );
        out
    }

    /// Detach a dirty page from the FIFO without writing it back
    /// (discard paths).
    pub fn forget_dirty(&mut self, id: PageId) {
        assert!(self.arena.page(id).dirty);
        self.arena.unlink(&mut self.dirty.fifo, id);
        let page = self.arena.page_mut(id);
        page.dirty = false;
        page.dirtied_at = None;
        self.dirty.dirty_pages -= 1;
    }

    #[must_use]
    pub fn writethrough(&self) -> bool {
        self.dirty.writethrough()
    }

    /// Leave the initial pass-through mode; a first user flush does this.
    pub fn set_writeback(&mut self) {
        self.dirty.wt = false;
    }

    #[must_use]
    pub fn dirty_pages(&self) -> u32 {
        self.dirty.dirty_pages
    }

    #[must_use]
    pub fn need_writeback(&self) -> bool {
        self.dirty.dirty_pages > self.dirty.target_pages
    }

    #[must_use]
    pub fn need_writeback_pages(&self) -> u32 {
        self.dirty.need_writeback_pages()
    }

    #[must_use]
    pub fn max_dirty_age(&self) -> Duration {
        self.dirty.max_dirty_age
    }

    /// Age of the oldest dirty page, if any.
    #[must_use]
    pub fn oldest_dirty_age(&self) -> Option<Duration> {
        self.arena
            .head(&self.dirty.fifo)
            .and_then(|id| self.arena.page(id).dirtied_at)
            .map(|at| at.elapsed())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            lru_len: self.car.class_size(ArcClass::Lru),
            lfu_len: self.car.class_size(ArcClass::Lfu),
            lru_ghost_len: self.car.class_size(ArcClass::LruGhost),
            lfu_ghost_len: self.car.class_size(ArcClass::LfuGhost),
            arc_lru_limit: self.car.lru_limit(),
            data_pages: self.car.data_pages(),
            dirty_pages: self.dirty.dirty_pages,
            free_frames: self.free_frames.len(),
            free_descriptors: self.free_descs.len(),
            remain_data_pages: self.remain_data_pages,
        }
    }

    /// Check the CAR bounds and list bookkeeping; test hook.
    #[must_use]
    pub fn validate(&self) -> bool {
        let fifo_ok = self.dirty.fifo.len() == self.dirty.dirty_pages;
        fifo_ok && self.car.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obc_types::CacheConfig;

    fn shape(data_pages: u32) -> CacheShape {
        CacheConfig {
            cache_bytes: u64::from(data_pages) * 4096,
            page_bytes: 4096,
            region_pages: 4,
            target_dirty_bytes: 2 * 4096,
            max_dirty_bytes: 4 * 4096,
            max_dirty_age: Duration::from_secs(1),
        }
        .validate()
        .expect("shape")
    }

    fn admit(pool: &mut PagePool, image: ImageId, offset: u64) -> PageId {
        let id = pool
            .take_free_frame()
            .expect("frame")
            .unwrap_or_else(|| panic!("pool full admitting offset {offset}"));
        let page = pool.page_mut(id);
        page.image_id = image;
        page.offset = offset;
        pool.car_adjust_and_hold(id, None);
        pool.car_insert(id);
        assert!(pool.validate());
        id
    }

    #[test]
    fn descriptors_start_free() {
        let pool = PagePool::new(&shape(8));
        let stats = pool.stats();
        assert_eq!(stats.free_descriptors, 16);
        assert_eq!(stats.free_frames, 0);
        assert_eq!(stats.remain_data_pages, 8);
        assert_eq!(stats.arc_lru_limit, 4);
    }

    #[test]
    fn regions_grow_lazily_and_cap_at_budget() {
        let mut pool = PagePool::new(&shape(8));
        let first = pool.take_free_frame().expect("grow").expect("page");
        assert!(pool.page(first).has_frame());
        // region_pages = 4, so one growth leaves 3 free frames.
        assert_eq!(pool.stats().free_frames, 3);
        assert_eq!(pool.stats().remain_data_pages, 4);

        for _ in 0..7 {
            assert!(pool.take_free_frame().expect("grow").is_some());
        }
        assert_eq!(pool.stats().remain_data_pages, 0);
        assert!(pool.take_free_frame().expect("no growth left").is_none());
    }

    #[test]
    fn frame_bytes_are_per_page_and_writable() {
        let mut pool = PagePool::new(&shape(8));
        let a = pool.take_free_frame().unwrap().unwrap();
        let b = pool.take_free_frame().unwrap().unwrap();
        pool.frame_bytes_mut(a).fill(0xAA);
        pool.frame_bytes_mut(b).fill(0xBB);
        assert!(pool.frame_bytes(a).iter().all(|&x| x == 0xAA));
        assert!(pool.frame_bytes(b).iter().all(|&x| x == 0xBB));
        assert_eq!(pool.frame_bytes(a).len(), 4096);
    }

    #[test]
    fn dirty_fifo_is_oldest_first_and_redirty_moves_to_tail() {
        let mut pool = PagePool::new(&shape(8));
        let a = admit(&mut pool, ImageId(1), 0);
        let b = admit(&mut pool, ImageId(1), 4096);
        let c = admit(&mut pool, ImageId(1), 8192);
        for id in [a, b, c] {
            pool.car_detach_held(id);
            pool.mark_dirty(id);
        }
        assert_eq!(pool.dirty_pages(), 3);
        // Re-dirty the oldest; it moves behind the others.
        pool.mark_dirty(a);
        assert_eq!(pool.dirty_pages(), 3);
        assert_eq!(pool.take_dirty(2), vec![b, c]);
        assert_eq!(pool.take_dirty(0), vec![a]);
        assert_eq!(pool.dirty_pages(), 0);
        assert!(!pool.page(a).is_dirty());
        assert!(pool.validate());
    }

    #[test]
    fn forget_dirty_detaches_without_writeback() {
        let mut pool = PagePool::new(&shape(8));
        let id = admit(&mut pool, ImageId(1), 0);
        pool.car_detach_held(id);
        pool.mark_dirty(id);
        pool.forget_dirty(id);
        assert_eq!(pool.dirty_pages(), 0);
        assert!(!pool.page(id).is_dirty());
        // The page can go straight back to its class list.
        pool.car_insert(id);
        assert!(pool.validate());
    }

    #[test]
    fn take_dirty_zero_means_all() {
        let mut pool = PagePool::new(&shape(8));
        let ids: Vec<_> = (0..4)
            .map(|i| {
                let id = admit(&mut pool, ImageId(1), i * 4096);
                pool.car_detach_held(id);
                pool.mark_dirty(id);
                id
            })
            .collect();
        assert_eq!(pool.take_dirty(0), ids);
    }

    #[test]
    fn dirty_page_reinserts_at_class_tail() {
        let mut pool = PagePool::new(&shape(8));
        let id = admit(&mut pool, ImageId(1), 0);
        assert_eq!(pool.page(id).location(), PageLocation::CarLru);
        pool.car_detach_held(id);
        pool.mark_dirty(id);
        assert_eq!(pool.page(id).location(), PageLocation::DirtyFifo);
        // The class counter still carries the page while it is dirty.
        assert_eq!(pool.stats().lru_len, 1);

        assert_eq!(pool.take_dirty(0), vec![id]);
        pool.car_insert(id);
        assert_eq!(pool.page(id).location(), PageLocation::CarLru);
        assert_eq!(pool.stats().lru_len, 1);
        assert!(pool.validate());
    }

    #[test]
    fn writethrough_until_switched() {
        let mut pool = PagePool::new(&shape(8));
        assert!(pool.writethrough());
        pool.set_writeback();
        assert!(!pool.writethrough());
    }

    #[test]
    fn writethrough_when_max_dirty_zero() {
        let cfg = CacheConfig {
            cache_bytes: 8 * 4096,
            page_bytes: 4096,
            region_pages: 4,
            target_dirty_bytes: 0,
            max_dirty_bytes: 0,
            max_dirty_age: Duration::from_secs(1),
        };
        let mut pool = PagePool::new(&cfg.validate().unwrap());
        pool.set_writeback();
        assert!(pool.writethrough());
    }

    #[test]
    fn need_writeback_above_target() {
        let mut pool = PagePool::new(&shape(8));
        assert!(!pool.need_writeback());
        for i in 0..3 {
            let id = admit(&mut pool, ImageId(1), i * 4096);
            pool.car_detach_held(id);
            pool.mark_dirty(id);
        }
        // target_pages = 2.
        assert!(pool.need_writeback());
        assert_eq!(pool.need_writeback_pages(), 1);
        assert!(pool.oldest_dirty_age().is_some());
    }

    #[test]
    fn release_page_returns_to_matching_free_list() {
        let mut pool = PagePool::new(&shape(8));
        let framed = pool.take_free_frame().unwrap().unwrap();
        let bare = pool.take_free_desc().unwrap();
        let before = pool.stats();
        pool.release_page(framed);
        pool.release_page(bare);
        let after = pool.stats();
        assert_eq!(after.free_frames, before.free_frames + 1);
        assert_eq!(after.free_descriptors, before.free_descriptors + 1);
    }

    #[test]
    fn transfer_frame_moves_buffer_ownership() {
        let mut pool = PagePool::new(&shape(8));
        let src = pool.take_free_frame().unwrap().unwrap();
        let dst = pool.take_free_desc().unwrap();
        pool.frame_bytes_mut(src).fill(0x5A);
        pool.transfer_frame(src, dst);
        assert!(!pool.page(src).has_frame());
        assert!(pool.frame_bytes(dst).iter().all(|&x| x == 0x5A));
    }
}
