//! Clock with Adaptive Replacement.
//!
//! Four intrusive lists (recency, frequency, and their ghost histories) over
//! the shared page arena, plus the adaptive recency target `lru_limit`.
//! Hits only set the reference bit; list movement happens at eviction and
//! insertion time.
//!
//! Class size counters deliberately diverge from physical list lengths: a
//! page admitted for an in-flight read, or detached for dirtying or an
//! in-flight write, stays counted in its class while unlinked. Insertion
//! after completion decrements the counter and re-links, so accounting sees
//! the page as belonging to its class for its whole resident life.

use crate::{ListHead, PageArena, PageLocation};
use obc_types::PageId;
use tracing::{debug, trace};

/// Replacement class of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcClass {
    Lru,
    Lfu,
    LruGhost,
    LfuGhost,
}

impl ArcClass {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            Self::Lru => 0,
            Self::Lfu => 1,
            Self::LruGhost => 2,
            Self::LfuGhost => 3,
        }
    }

    fn location(self) -> PageLocation {
        match self {
            Self::Lru => PageLocation::CarLru,
            Self::Lfu => PageLocation::CarLfu,
            Self::LruGhost => PageLocation::CarLruGhost,
            Self::LfuGhost => PageLocation::CarLfuGhost,
        }
    }
}

/// Which ghost history a miss offset was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryHit {
    LruGhost,
    LfuGhost,
}

/// The CAR replacement engine.
#[derive(Debug)]
pub struct CarState {
    lists: [ListHead; ArcClass::COUNT],
    sizes: [u32; ArcClass::COUNT],
    lru_limit: u32,
    data_pages: u32,
}

impl CarState {
    #[must_use]
    pub fn new(data_pages: u32) -> Self {
        Self {
            lists: [ListHead::default(); ArcClass::COUNT],
            sizes: [0; ArcClass::COUNT],
            lru_limit: data_pages / 2,
            data_pages,
        }
    }

    #[must_use]
    pub fn data_pages(&self) -> u32 {
        self.data_pages
    }

    #[must_use]
    pub fn lru_limit(&self) -> u32 {
        self.lru_limit
    }

    #[must_use]
    pub fn class_size(&self, class: ArcClass) -> u32 {
        self.sizes[class.index()]
    }

    fn size(&self, class: ArcClass) -> u32 {
        self.sizes[class.index()]
    }

    fn linked_len(&self, class: ArcClass) -> u32 {
        self.lists[class.index()].len()
    }

    /// Record a hit on a present page: reference bit only, no list motion.
    pub fn hit_page(&mut self, arena: &mut PageArena, id: PageId) {
        arena.page_mut(id).referenced = true;
    }

    fn append(&mut self, arena: &mut PageArena, id: PageId, class: ArcClass) {
        {
            let page = arena.page_mut(id);
            assert!(!page.dirty);
            page.class = class;
        }
        arena.push_tail(&mut self.lists[class.index()], id, class.location());
        arena.page_mut(id).referenced = false;
        self.sizes[class.index()] += 1;
    }

    fn pop_class(&mut self, arena: &mut PageArena, class: ArcClass) -> Option<PageId> {
        let id = arena.pop_head(&mut self.lists[class.index()])?;
        self.sizes[class.index()] -= 1;
        Some(id)
    }

    /// Adapt `lru_limit` for the observed ghost history and count the page
    /// into its admission class without linking it; the page stays detached
    /// while its fill is in flight.
    pub fn adjust_and_hold(&mut self, arena: &mut PageArena, id: PageId, hist: Option<HistoryHit>) {
        let ratio = |a: u32, b: u32| if b == 0 { 0 } else { a / b };
        let class = match hist {
            Some(HistoryHit::LruGhost) => {
                let delta = ratio(self.size(ArcClass::LruGhost), self.size(ArcClass::LfuGhost));
                self.lru_limit = (self.lru_limit + delta).min(self.data_pages);
                ArcClass::Lfu
            }
            Some(HistoryHit::LfuGhost) => {
                let delta = ratio(self.size(ArcClass::LruGhost), self.size(ArcClass::LfuGhost));
                self.lru_limit = self.lru_limit.saturating_sub(delta);
                ArcClass::Lfu
            }
            None => ArcClass::Lru,
        };
        let page = arena.page_mut(id);
        assert_eq!(page.location, PageLocation::Detached);
        assert!(!page.dirty);
        page.class = class;
        page.referenced = false;
        self.sizes[class.index()] += 1;
        debug!(
            target: "obc::car",
            event = "arc_adjust",
            hist = ?hist,
            lru_limit = self.lru_limit
        );
    }

    /// Link an in-flight page into the list its counter already holds it in.
    pub fn insert_page(&mut self, arena: &mut PageArena, id: PageId) {
        let class = {
            let page = arena.page(id);
            assert_eq!(page.location, PageLocation::Detached);
            assert!(!page.dirty && !page.on_read);
            page.class
        };
        // The size was bumped by adjust_and_hold or kept by make_dirty;
        // append re-counts it.
        self.sizes[class.index()] -= 1;
        self.append(arena, id, class);
    }

    /// Detach a linked resident page, keeping its class counted, so a later
    /// `insert_page` appends it to the tail of the same class.
    pub fn make_dirty(&mut self, arena: &mut PageArena, id: PageId) {
        let class = {
            let page = arena.page(id);
            assert!(matches!(
                page.location,
                PageLocation::CarLru | PageLocation::CarLfu
            ));
            page.class
        };
        arena.unlink(&mut self.lists[class.index()], id);
    }

    /// Evict one clean resident page: clock sweep with second chance, the
    /// victim moves to the tail of its ghost list and is returned. Its
    /// buffer is relinquished by the caller.
    pub fn evict_data(&mut self, arena: &mut PageArena) -> Option<PageId> {
        loop {
            let prefer_lru = self.size(ArcClass::Lru) >= self.lru_limit;
            let (src, ghost) = if prefer_lru && self.linked_len(ArcClass::Lru) > 0 {
                (ArcClass::Lru, ArcClass::LruGhost)
            } else if self.linked_len(ArcClass::Lfu) > 0 {
                (ArcClass::Lfu, ArcClass::LfuGhost)
            } else if self.linked_len(ArcClass::Lru) > 0 {
                (ArcClass::Lru, ArcClass::LruGhost)
            } else {
                return None;
            };
            let id = self.pop_class(arena, src).expect("nonempty list");
            if arena.page(id).referenced {
                self.append(arena, id, ArcClass::Lfu);
            } else {
                self.append(arena, id, ghost);
                trace!(
                    target: "obc::car",
                    event = "evict",
                    page = id.0,
                    from = ?src,
                    lru = self.size(ArcClass::Lru),
                    lfu = self.size(ArcClass::Lfu)
                );
                return Some(id);
            }
        }
    }

    /// Reclaim a ghost descriptor once the directory is saturated: the LRU
    /// ghost head when the recency side is at capacity, else the LFU ghost
    /// head when the whole directory is. Callers try this only after the
    /// free-descriptor list is empty, so history accumulates while spare
    /// descriptors exist.
    pub fn take_ghost_slot(&mut self, arena: &mut PageArena) -> Option<PageId> {
        if self.size(ArcClass::Lru) + self.size(ArcClass::LruGhost) >= self.data_pages
            && let Some(id) = self.pop_class(arena, ArcClass::LruGhost)
        {
            return Some(id);
        }
        let total = self.size(ArcClass::Lru)
            + self.size(ArcClass::Lfu)
            + self.size(ArcClass::LruGhost)
            + self.size(ArcClass::LfuGhost);
        if total >= self.data_pages * 2
            && let Some(id) = self.pop_class(arena, ArcClass::LfuGhost)
        {
            return Some(id);
        }
        None
    }

    /// Drop the class count of a detached held page that will not be
    /// inserted after all (undo of `adjust_and_hold` on error paths).
    pub fn unhold(&mut self, arena: &mut PageArena, id: PageId) {
        let class = {
            let page = arena.page(id);
            assert_eq!(page.location, PageLocation::Detached);
            assert!(!page.dirty);
            page.class
        };
        self.sizes[class.index()] -= 1;
    }

    /// Detach a specific ghost page and drop it from its class count.
    pub fn remove_ghost(&mut self, arena: &mut PageArena, id: PageId) {
        let class = {
            let page = arena.page(id);
            assert!(matches!(
                page.location,
                PageLocation::CarLruGhost | PageLocation::CarLfuGhost
            ));
            page.class
        };
        arena.unlink(&mut self.lists[class.index()], id);
        self.sizes[class.index()] -= 1;
    }

    /// Detach a linked resident page and drop it from its class count
    /// (teardown paths only).
    pub fn forget_page(&mut self, arena: &mut PageArena, id: PageId) {
        let class = {
            let page = arena.page(id);
            assert!(matches!(
                page.location,
                PageLocation::CarLru | PageLocation::CarLfu
            ));
            page.class
        };
        arena.unlink(&mut self.lists[class.index()], id);
        self.sizes[class.index()] -= 1;
    }

    /// Check the CAR bounds; test hook.
    ///
    /// Resident classes together never exceed the buffer budget; the whole
    /// directory (residents plus ghost history) never exceeds the
    /// descriptor budget.
    #[must_use]
    pub fn validate(&self) -> bool {
        let lru = self.size(ArcClass::Lru);
        let lfu = self.size(ArcClass::Lfu);
        let lru_ghost = self.size(ArcClass::LruGhost);
        let lfu_ghost = self.size(ArcClass::LfuGhost);
        let total = lru + lfu + lru_ghost + lfu_ghost;
        if lru + lfu > self.data_pages {
            return false;
        }
        if lfu + lfu_ghost > self.data_pages * 2 {
            return false;
        }
        if total > self.data_pages * 2 {
            return false;
        }
        // Ghost pages are never held detached; resident classes may be.
        self.linked_len(ArcClass::LruGhost) == lru_ghost
            && self.linked_len(ArcClass::LfuGhost) == lfu_ghost
            && self.linked_len(ArcClass::Lru) <= lru
            && self.linked_len(ArcClass::Lfu) <= lfu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PagePool;
    use obc_types::{CacheConfig, ImageId};
    use std::time::Duration;

    fn pool(data_pages: u32) -> PagePool {
        let shape = CacheConfig {
            cache_bytes: u64::from(data_pages) * 4096,
            page_bytes: 4096,
            region_pages: data_pages,
            target_dirty_bytes: 0,
            max_dirty_bytes: 0,
            max_dirty_age: Duration::from_secs(1),
        }
        .validate()
        .expect("shape");
        PagePool::new(&shape)
    }

    /// Drive one miss through the same descriptor dance the cache performs.
    fn admit_miss(pool: &mut PagePool, offset: u64, hist: Option<HistoryHit>) -> PageId {
        let id = match pool.take_free_frame().expect("grow") {
            Some(id) => id,
            None => {
                let victim = pool.car_evict().expect("evictable page");
                let desc = pool
                    .take_free_desc()
                    .or_else(|| pool.car_take_ghost_slot())
                    .expect("descriptor");
                pool.transfer_frame(victim, desc);
                desc
            }
        };
        let page = pool.page_mut(id);
        page.image_id = ImageId(1);
        page.offset = offset;
        pool.car_adjust_and_hold(id, hist);
        pool.car_insert(id);
        assert!(pool.validate(), "invariants after admitting {offset}");
        id
    }

    #[test]
    fn cold_misses_admit_to_lru() {
        let mut pool = pool(4);
        for i in 0..4 {
            admit_miss(&mut pool, i * 4096, None);
        }
        let stats = pool.stats();
        assert_eq!(stats.lru_len, 4);
        assert_eq!(stats.lfu_len, 0);
    }

    #[test]
    fn eviction_moves_unreferenced_head_to_ghost() {
        let mut pool = pool(4);
        let ids: Vec<_> = (0..4).map(|i| admit_miss(&mut pool, i * 4096, None)).collect();
        // Fifth admission evicts the oldest resident.
        admit_miss(&mut pool, 4 * 4096, None);
        let stats = pool.stats();
        assert_eq!(stats.lru_len, 4);
        assert_eq!(stats.lru_ghost_len, 1);
        assert_eq!(pool.page(ids[0]).location(), PageLocation::CarLruGhost);
        assert!(!pool.page(ids[0]).has_frame());
    }

    #[test]
    fn reference_bit_gives_second_chance_into_lfu() {
        let mut pool = pool(4);
        let ids: Vec<_> = (0..4).map(|i| admit_miss(&mut pool, i * 4096, None)).collect();
        pool.car_hit(ids[0]);
        admit_miss(&mut pool, 4 * 4096, None);
        // The referenced head rotated into LFU; the second-oldest was evicted.
        assert_eq!(pool.page(ids[0]).location(), PageLocation::CarLfu);
        assert_eq!(pool.page(ids[1]).location(), PageLocation::CarLruGhost);
        let stats = pool.stats();
        assert_eq!(stats.lfu_len, 1);
        assert_eq!(stats.lru_ghost_len, 1);
    }

    #[test]
    fn ghost_hit_admits_to_lfu_with_zero_delta_guard() {
        let mut pool = pool(4);
        let ids: Vec<_> = (0..4).map(|i| admit_miss(&mut pool, i * 4096, None)).collect();
        for i in 4..8 {
            admit_miss(&mut pool, i * 4096, None);
        }
        assert_eq!(pool.stats().lru_ghost_len, 4);
        let limit_before = pool.stats().arc_lru_limit;

        // Re-access offset 0: consume its ghost, then admit with history.
        let ghost = ids[0];
        assert_eq!(pool.page(ghost).location(), PageLocation::CarLruGhost);
        pool.car_remove_ghost(ghost);
        let victim = pool.car_evict().expect("victim");
        pool.transfer_frame(victim, ghost);
        let page = pool.page_mut(ghost);
        page.offset = 0;
        pool.car_adjust_and_hold(ghost, Some(HistoryHit::LruGhost));
        pool.car_insert(ghost);

        let stats = pool.stats();
        assert_eq!(stats.lfu_len, 1);
        // |LFU_GHOST| was 0, so the adaptive delta is 0.
        assert_eq!(stats.arc_lru_limit, limit_before);
        assert!(pool.validate());
    }

    #[test]
    fn lfu_ghost_hit_shrinks_lru_limit() {
        let mut pool = pool(2);
        // Build an LFU ghost: admit, promote via reference, evict twice.
        let a = admit_miss(&mut pool, 0, None);
        let b = admit_miss(&mut pool, 4096, None);
        pool.car_hit(a);
        pool.car_hit(b);
        // Both referenced: eviction rotates both into LFU, then evicts one
        // of them into the LFU ghost list.
        admit_miss(&mut pool, 2 * 4096, None);
        assert_eq!(pool.stats().lfu_ghost_len, 1);
        assert_eq!(pool.stats().lru_ghost_len, 0);

        let ghosted = if pool.page(a).location() == PageLocation::CarLfuGhost {
            a
        } else {
            b
        };
        let limit_before = pool.stats().arc_lru_limit;
        pool.car_remove_ghost(ghosted);
        let victim = pool.car_evict().expect("victim");
        pool.transfer_frame(victim, ghosted);
        pool.car_adjust_and_hold(ghosted, Some(HistoryHit::LfuGhost));
        pool.car_insert(ghosted);
        assert!(pool.stats().arc_lru_limit <= limit_before);
        assert!(pool.validate());
    }

    #[test]
    fn ghost_slot_reclaimed_when_recency_side_full() {
        let mut pool = pool(2);
        admit_miss(&mut pool, 0, None);
        admit_miss(&mut pool, 4096, None);
        admit_miss(&mut pool, 2 * 4096, None);
        admit_miss(&mut pool, 3 * 4096, None);
        // data_pages = 2: residents 2, ghosts 2, so |LRU| + |LRU_GHOST|
        // saturates and the next miss must recycle the ghost head.
        assert_eq!(pool.stats().lru_ghost_len, 2);
        admit_miss(&mut pool, 4 * 4096, None);
        assert_eq!(pool.stats().lru_ghost_len, 2);
        assert!(pool.validate());
    }

    #[test]
    fn sweep_holds_invariants() {
        let mut pool = pool(8);
        // Deterministic mixed workload: strided misses with periodic hits.
        let mut resident: Vec<PageId> = Vec::new();
        for step in 0_u64..64 {
            let offset = (step * 3 % 23) * 4096;
            if let Some(&id) = resident.iter().find(|&&id| pool.page(id).offset == offset
                && matches!(
                    pool.page(id).location(),
                    PageLocation::CarLru | PageLocation::CarLfu
                )) {
                pool.car_hit(id);
            } else {
                resident.push(admit_miss(&mut pool, offset, None));
            }
            assert!(pool.validate(), "step {step}");
        }
    }
}
