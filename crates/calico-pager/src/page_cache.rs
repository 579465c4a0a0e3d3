//! Fixed-capacity frame pool with strict-LRU eviction and the dirty
//! list.
//!
//! Frames live in an arena; everything else refers to them by index
//! plus a generation stamp that changes when a frame is recycled, so a
//! stale reference can never silently alias a different page.

use std::collections::VecDeque;

use calico_error::{CalicoError, Result};
use calico_types::PageId;
use hashbrown::HashMap;

/// Index of a frame within the cache arena.
pub(crate) type FrameId = usize;

/// Handle to a pinned (or at least tracked) cache frame.
///
/// Copyable token; the cache validates the generation on every data
/// access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    pub(crate) frame: FrameId,
    pub(crate) generation: u32,
    /// Raw page id; 0 for a scratch frame that has not been installed
    /// under a page id yet.
    pub(crate) page_id: u32,
}

impl PageRef {
    /// Page id this reference currently addresses.
    #[must_use]
    pub fn page_id(&self) -> PageId {
        PageId::new(self.page_id).expect("scratch frame has no page id")
    }
}

struct Frame {
    page_id: u32,
    data: Box<[u8]>,
    refcount: u32,
    dirty: bool,
    generation: u32,
}

/// The frame pool.
pub struct PageCache {
    frames: Vec<Frame>,
    /// Resident page id -> frame.
    map: HashMap<u32, FrameId>,
    /// LRU order of occupied frames; front is the eviction candidate.
    lru: VecDeque<FrameId>,
    /// Unoccupied frame slots.
    free: Vec<FrameId>,
    /// The dirty list: every dirty frame, unordered until [`Self::sorted_dirty`].
    dirty: Vec<FrameId>,
    page_size: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl PageCache {
    /// Minimum number of frames needed for tree rebalancing to make
    /// progress.
    pub const MIN_CAPACITY: usize = 16;

    #[must_use]
    pub fn new(page_size: usize, capacity: usize) -> Self {
        Self {
            frames: Vec::new(),
            map: HashMap::new(),
            lru: VecDeque::new(),
            free: Vec::new(),
            dirty: Vec::new(),
            page_size,
            capacity: capacity.max(Self::MIN_CAPACITY),
            hits: 0,
            misses: 0,
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub const fn misses(&self) -> u64 {
        self.misses
    }

    /// Number of occupied frames.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.frames.len() - self.free.len()
    }

    fn make_ref(&self, frame: FrameId) -> PageRef {
        let f = &self.frames[frame];
        PageRef {
            frame,
            generation: f.generation,
            page_id: f.page_id,
        }
    }

    fn check(&self, page: PageRef) -> &Frame {
        let f = &self.frames[page.frame];
        assert_eq!(f.generation, page.generation, "stale page reference");
        f
    }

    fn check_mut(&mut self, page: PageRef) -> &mut Frame {
        let f = &mut self.frames[page.frame];
        assert_eq!(f.generation, page.generation, "stale page reference");
        f
    }

    /// Look up a resident page without pinning it or touching LRU
    /// order.
    #[must_use]
    pub fn query(&self, page_id: PageId) -> Option<PageRef> {
        self.map.get(&page_id.get()).map(|&f| self.make_ref(f))
    }

    /// Look up a resident page, pin it, and move it to the MRU
    /// position.
    pub fn lookup(&mut self, page_id: PageId) -> Option<PageRef> {
        let Some(&frame) = self.map.get(&page_id.get()) else {
            self.misses += 1;
            return None;
        };
        self.hits += 1;
        self.frames[frame].refcount += 1;
        self.touch(frame);
        Some(self.make_ref(frame))
    }

    fn touch(&mut self, frame: FrameId) {
        if let Some(pos) = self.lru.iter().position(|&f| f == frame) {
            self.lru.remove(pos);
        }
        self.lru.push_back(frame);
    }

    /// The LRU unpinned clean frame, if any. Does not detach it.
    #[must_use]
    pub fn next_victim(&self) -> Option<PageRef> {
        self.lru
            .iter()
            .copied()
            .find(|&f| self.frames[f].refcount == 0 && !self.frames[f].dirty)
            .map(|f| self.make_ref(f))
    }

    /// Produce an unoccupied, unpinned frame, evicting the LRU clean
    /// frame when the pool is full. The returned frame has no page id
    /// and is not in the LRU order yet.
    pub fn allocate(&mut self) -> Result<PageRef> {
        if let Some(frame) = self.free.pop() {
            return Ok(self.make_ref(frame));
        }
        if self.frames.len() < self.capacity {
            self.frames.push(Frame {
                page_id: 0,
                data: vec![0_u8; self.page_size].into_boxed_slice(),
                refcount: 0,
                dirty: false,
                generation: 0,
            });
            return Ok(self.make_ref(self.frames.len() - 1));
        }
        let victim = self.next_victim().ok_or_else(|| {
            CalicoError::no_memory("page cache exhausted: every frame is pinned or dirty")
        })?;
        self.detach(victim.frame);
        Ok(self.make_ref(victim.frame))
    }

    /// Remove a frame from the page index and LRU order and recycle its
    /// identity.
    fn detach(&mut self, frame: FrameId) {
        let f = &mut self.frames[frame];
        if f.page_id != 0 {
            self.map.remove(&f.page_id);
        }
        f.page_id = 0;
        f.dirty = false;
        f.generation = f.generation.wrapping_add(1);
        f.refcount = 0;
        if let Some(pos) = self.lru.iter().position(|&x| x == frame) {
            self.lru.remove(pos);
        }
        self.dirty.retain(|&x| x != frame);
    }

    /// Install an allocated frame under `page_id`, pinned once.
    pub fn install(&mut self, page: PageRef, page_id: PageId) -> PageRef {
        debug_assert!(!self.map.contains_key(&page_id.get()));
        let frame = page.frame;
        {
            let f = self.check_mut(page);
            debug_assert_eq!(f.page_id, 0);
            f.page_id = page_id.get();
            f.refcount = 1;
        }
        self.map.insert(page_id.get(), frame);
        self.touch(frame);
        self.make_ref(frame)
    }

    /// Pin a page reference one more time.
    pub fn add_ref(&mut self, page: PageRef) {
        self.check_mut(page).refcount += 1;
    }

    /// Drop one pin.
    pub fn unref(&mut self, page: PageRef) {
        let f = self.check_mut(page);
        debug_assert!(f.refcount > 0);
        f.refcount -= 1;
    }

    #[must_use]
    pub fn refcount(&self, page: PageRef) -> u32 {
        self.check(page).refcount
    }

    /// Forget `page_id` entirely, regardless of the dirty flag. The
    /// frame must be unpinned (or about to be discarded by its sole
    /// holder).
    pub fn erase(&mut self, page_id: PageId) {
        if let Some(&frame) = self.map.get(&page_id.get()) {
            self.detach(frame);
            self.free.push(frame);
        }
    }

    /// Discard the frame behind `page` without consulting the dirty
    /// flag.
    pub fn discard(&mut self, page: PageRef) {
        let frame = page.frame;
        self.check_mut(page).refcount = 0;
        self.detach(frame);
        self.free.push(frame);
    }

    /// Change the page id of a (dirty) frame, displacing any stale
    /// frame cached under the destination id.
    pub fn rekey(&mut self, page: PageRef, new_id: PageId) -> PageRef {
        if let Some(&stale) = self.map.get(&new_id.get()) {
            if stale != page.frame {
                self.detach(stale);
                self.free.push(stale);
            }
        }
        let frame = page.frame;
        let old_id = self.check(page).page_id;
        if old_id != 0 {
            self.map.remove(&old_id);
        }
        self.frames[frame].page_id = new_id.get();
        self.map.insert(new_id.get(), frame);
        self.touch(frame);
        self.make_ref(frame)
    }

    /// Page contents.
    #[must_use]
    pub fn data(&self, page: PageRef) -> &[u8] {
        &self.check(page).data
    }

    /// Mutable page contents. The frame must already be on the dirty
    /// list.
    pub fn data_mut(&mut self, page: PageRef) -> &mut [u8] {
        let f = self.check_mut(page);
        debug_assert!(f.dirty, "page {} written without mark_dirty", f.page_id);
        &mut f.data
    }

    /// Mutable contents of a frame being populated from disk (not yet
    /// dirty).
    pub(crate) fn fill(&mut self, page: PageRef) -> &mut [u8] {
        &mut self.check_mut(page).data
    }

    #[must_use]
    pub fn is_dirty(&self, page: PageRef) -> bool {
        self.check(page).dirty
    }

    /// Add to the dirty list.
    pub fn mark_dirty(&mut self, page: PageRef) {
        let frame = page.frame;
        let f = self.check_mut(page);
        if !f.dirty {
            f.dirty = true;
            self.dirty.push(frame);
        }
    }

    /// Clear the dirty flag (frame became durable in the WAL).
    pub fn mark_clean(&mut self, page: PageRef) {
        let frame = page.frame;
        let f = self.check_mut(page);
        if f.dirty {
            f.dirty = false;
            self.dirty.retain(|&x| x != frame);
        }
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Dirty frames in ascending page-id order: the canonical order for
    /// one WAL commit group.
    #[must_use]
    pub fn sorted_dirty(&self) -> Vec<PageRef> {
        let mut out: Vec<PageRef> = self.dirty.iter().map(|&f| self.make_ref(f)).collect();
        out.sort_unstable_by_key(|p| p.page_id);
        out
    }

    /// Drop every dirty frame (rollback).
    pub fn discard_dirty(&mut self) {
        for frame in std::mem::take(&mut self.dirty) {
            self.frames[frame].dirty = false;
            self.detach(frame);
            self.free.push(frame);
        }
    }

    /// Drop every frame above the new last page (logical truncation).
    pub fn drop_pages_above(&mut self, max_id: u32) {
        let doomed: Vec<FrameId> = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.page_id > max_id)
            .map(|(i, _)| i)
            .collect();
        for frame in doomed {
            self.detach(frame);
            self.free.push(frame);
        }
    }

    /// Evict every unpinned clean frame (snapshot changed under us).
    pub fn purge_unpinned(&mut self) {
        let stale: Vec<FrameId> = self
            .lru
            .iter()
            .copied()
            .filter(|&f| self.frames[f].refcount == 0 && !self.frames[f].dirty)
            .collect();
        for frame in stale {
            self.detach(frame);
            self.free.push(frame);
        }
    }

    /// Change the page size, invalidating all cached contents. Only
    /// legal when nothing is pinned or dirty.
    pub fn reallocate(&mut self, page_size: usize) {
        assert!(self.dirty.is_empty());
        debug_assert!(self.frames.iter().all(|f| f.refcount == 0));
        self.page_size = page_size;
        self.frames.clear();
        self.map.clear();
        self.lru.clear();
        self.free.clear();
        self.dirty.clear();
    }
}
