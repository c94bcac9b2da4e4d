//! Per-file page cache.
//!
//! A bounded map from page id to frame. Each frame owns its buffer behind
//! a read/write latch and tracks a pin count, a dirty flag, and a last-use
//! tick for LRU eviction. Only unpinned frames are evictable, and the
//! store writes a dirty frame back before letting it go. Page 0 is never
//! an eviction candidate: the FCR must always be the last page written.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use xtrieve_common::types::PageId;

/// One cached page.
pub struct Frame {
    buffer: RwLock<Vec<u8>>,
    dirty: AtomicBool,
    pins: AtomicU32,
    last_used: AtomicU64,
}

impl Frame {
    fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer: RwLock::new(buffer),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
            last_used: AtomicU64::new(0),
        }
    }

    /// The page buffer latch.
    #[inline]
    pub fn buffer(&self) -> &RwLock<Vec<u8>> {
        &self.buffer
    }

    /// True if the frame holds changes not yet on disk.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks or clears the dirty flag.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Pins the frame against eviction.
    #[inline]
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one pin.
    #[inline]
    pub fn unpin(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unpin without matching pin");
    }

    fn touch(&self, tick: u64) {
        self.last_used.store(tick, Ordering::Release);
    }

    fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("dirty", &self.is_dirty())
            .field("pins", &self.pin_count())
            .finish()
    }
}

/// Bounded page-id → frame map with LRU eviction.
pub struct PageCache {
    frames: Mutex<HashMap<PageId, Arc<Frame>>>,
    capacity: usize,
    tick: AtomicU64,
}

impl PageCache {
    /// Creates a cache bounded to `capacity` pages.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            capacity: capacity.max(8),
            tick: AtomicU64::new(1),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Looks up a page, refreshing its LRU position.
    pub fn get(&self, page_id: PageId) -> Option<Arc<Frame>> {
        let frames = self.frames.lock();
        let frame = frames.get(&page_id)?;
        frame.touch(self.next_tick());
        Some(Arc::clone(frame))
    }

    /// Inserts (or replaces) a page buffer and returns its frame.
    pub fn insert(&self, page_id: PageId, buffer: Vec<u8>) -> Arc<Frame> {
        let frame = Arc::new(Frame::new(buffer));
        frame.touch(self.next_tick());
        self.frames.lock().insert(page_id, Arc::clone(&frame));
        frame
    }

    /// Removes a page outright.
    pub fn remove(&self, page_id: PageId) {
        self.frames.lock().remove(&page_id);
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Pages over capacity, if any.
    pub fn excess(&self) -> usize {
        self.len().saturating_sub(self.capacity)
    }

    /// The least recently used clean unpinned page, excluding the FCR.
    /// Dirty pages are never candidates: they leave the cache only after
    /// a flush has made them clean.
    pub fn lru_candidate(&self) -> Option<(PageId, Arc<Frame>)> {
        let frames = self.frames.lock();
        frames
            .iter()
            .filter(|(id, frame)| id.is_some() && frame.pin_count() == 0 && !frame.is_dirty())
            .min_by_key(|(_, frame)| frame.last_used())
            .map(|(id, frame)| (*id, Arc::clone(frame)))
    }

    /// Removes a page only if it is clean and unpinned; returns whether it
    /// was removed.
    pub fn remove_if_clean(&self, page_id: PageId) -> bool {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&page_id) {
            if !frame.is_dirty() && frame.pin_count() == 0 {
                frames.remove(&page_id);
                return true;
            }
        }
        false
    }

    /// All dirty pages, FCR last.
    pub fn dirty_pages(&self) -> Vec<(PageId, Arc<Frame>)> {
        let frames = self.frames.lock();
        let mut dirty: Vec<(PageId, Arc<Frame>)> = frames
            .iter()
            .filter(|(_, frame)| frame.is_dirty())
            .map(|(id, frame)| (*id, Arc::clone(frame)))
            .collect();
        dirty.sort_by_key(|(id, _)| (*id == PageId::FCR, id.as_u32()));
        dirty
    }

    /// Drops every cached page.
    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}
