//! Page cache.
//!
//! An arena of in-memory page frames with pin counts, dirty tracking, and
//! access stamps. Leases are RAII: every fetch pins its frame and the guard
//! unpins on drop, on every exit path. A frame may only be evicted while
//! unpinned; a leaked guard keeps its frame resident but never corrupts.

use crate::page::PageBuf;
use crate::types::Address;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One cached page
#[derive(Debug)]
pub(crate) struct Frame {
    pub buf: PageBuf,
    pub dirty: bool,
    pins: u32,
    stamp: u64,
}

/// Frame table with stamp-based eviction
#[derive(Debug)]
pub(crate) struct PageCache {
    frames: Mutex<HashMap<Address, Arc<RwLock<Frame>>>>,
    clock: AtomicU64,
    capacity: usize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(HashMap::with_capacity(capacity)),
            clock: AtomicU64::new(0),
            capacity,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a resident frame, refreshing its stamp
    pub fn get(&self, addr: Address) -> Option<Arc<RwLock<Frame>>> {
        let frames = self.frames.lock();
        let frame = frames.get(&addr)?;
        frame.write().stamp = self.tick();
        Some(Arc::clone(frame))
    }

    /// Insert a frame read from disk (or freshly allocated)
    pub fn insert(&self, addr: Address, buf: PageBuf, dirty: bool) -> Arc<RwLock<Frame>> {
        let frame = Arc::new(RwLock::new(Frame {
            buf,
            dirty,
            pins: 0,
            stamp: self.tick(),
        }));
        self.frames.lock().insert(addr, Arc::clone(&frame));
        frame
    }

    /// Whether the table is over capacity
    pub fn over_capacity(&self) -> bool {
        self.frames.lock().len() > self.capacity
    }

    /// Detach the least recently stamped unpinned frame, if any.
    ///
    /// The caller is responsible for writing it back when dirty.
    pub fn take_eviction_candidate(&self) -> Option<(Address, Arc<RwLock<Frame>>)> {
        let mut frames = self.frames.lock();
        let victim = frames
            .iter()
            .filter(|(_, frame)| frame.read().pins == 0)
            .min_by_key(|(_, frame)| frame.read().stamp)
            .map(|(addr, _)| *addr)?;
        let frame = frames.remove(&victim)?;
        Some((victim, frame))
    }

    /// Snapshot every resident frame, for flushing
    pub fn frames(&self) -> Vec<(Address, Arc<RwLock<Frame>>)> {
        let frames = self.frames.lock();
        let mut all: Vec<_> = frames
            .iter()
            .map(|(addr, frame)| (*addr, Arc::clone(frame)))
            .collect();
        all.sort_by_key(|(addr, _)| *addr);
        all
    }

    /// Drop every frame (used by clear)
    pub fn reset(&self) {
        self.frames.lock().clear();
    }
}

/// RAII read lease on a page
pub struct PageGuard {
    frame: Arc<RwLock<Frame>>,
}

impl PageGuard {
    pub(crate) fn new(frame: Arc<RwLock<Frame>>) -> Self {
        frame.write().pins += 1;
        Self { frame }
    }

    /// Borrow the page bytes
    pub fn read(&self) -> PageRef<'_> {
        PageRef {
            guard: self.frame.read(),
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let mut frame = self.frame.write();
        frame.pins = frame.pins.saturating_sub(1);
    }
}

/// RAII write lease on a page
pub struct PageGuardMut {
    frame: Arc<RwLock<Frame>>,
}

impl PageGuardMut {
    pub(crate) fn new(frame: Arc<RwLock<Frame>>) -> Self {
        frame.write().pins += 1;
        Self { frame }
    }

    /// Borrow the page bytes mutably, marking the frame dirty
    pub fn write(&self) -> PageRefMut<'_> {
        let mut guard = self.frame.write();
        guard.dirty = true;
        PageRefMut { guard }
    }

    /// Borrow the page bytes without dirtying
    pub fn read(&self) -> PageRef<'_> {
        PageRef {
            guard: self.frame.read(),
        }
    }
}

impl Drop for PageGuardMut {
    fn drop(&mut self) {
        let mut frame = self.frame.write();
        frame.pins = frame.pins.saturating_sub(1);
    }
}

/// Shared borrow of a cached page
pub struct PageRef<'a> {
    guard: RwLockReadGuard<'a, Frame>,
}

impl std::ops::Deref for PageRef<'_> {
    type Target = PageBuf;

    fn deref(&self) -> &Self::Target {
        &self.guard.buf
    }
}

/// Exclusive borrow of a cached page
pub struct PageRefMut<'a> {
    guard: RwLockWriteGuard<'a, Frame>,
}

impl std::ops::Deref for PageRefMut<'_> {
    type Target = PageBuf;

    fn deref(&self) -> &Self::Target {
        &self.guard.buf
    }
}

impl std::ops::DerefMut for PageRefMut<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_blocks_eviction() {
        let cache = PageCache::new(1);
        let frame = cache.insert(Address::new(1), PageBuf::new(64), false);
        let guard = PageGuard::new(frame);
        cache.insert(Address::new(2), PageBuf::new(64), false);

        // Page 1 is pinned, so page 2 is the only candidate
        let (victim, _) = cache.take_eviction_candidate().unwrap();
        assert_eq!(victim, Address::new(2));

        drop(guard);
        let (victim, _) = cache.take_eviction_candidate().unwrap();
        assert_eq!(victim, Address::new(1));
        assert!(cache.take_eviction_candidate().is_none());
    }

    #[test]
    fn test_stamp_order() {
        let cache = PageCache::new(8);
        cache.insert(Address::new(1), PageBuf::new(64), false);
        cache.insert(Address::new(2), PageBuf::new(64), false);

        // Touching page 1 makes page 2 the eviction candidate
        cache.get(Address::new(1)).unwrap();
        let (victim, _) = cache.take_eviction_candidate().unwrap();
        assert_eq!(victim, Address::new(2));
    }

    #[test]
    fn test_write_marks_dirty() {
        let cache = PageCache::new(8);
        let frame = cache.insert(Address::new(1), PageBuf::new(64), false);
        let guard = PageGuardMut::new(Arc::clone(&frame));
        guard.write()[0] = 7;
        drop(guard);

        assert!(frame.read().dirty);
        assert_eq!(frame.read().buf[0], 7);
    }
}
