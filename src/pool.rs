//! Fixed pool of pre-mapped segments shared by all proxy threads.
//!
//! The pool owns the segment ids. A thread acquires an id, drives one
//! request over that segment and releases it. Free ids are handed out in
//! FIFO order; `acquire` blocks while every segment is claimed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{CacheError, Result};
use crate::segment::{segment_name, Segment, SharedRegion};

struct FreeList {
    free: VecDeque<usize>,
    claimed: Vec<bool>,
}

pub struct SegmentPool {
    prefix: String,
    segments: Vec<Segment>,
    state: Mutex<FreeList>,
    available: Condvar,
}

impl SegmentPool {
    /// Create and map `count` segments named `<prefix><id>`, each with a
    /// `region_size` byte chunk buffer. Leftovers from an earlier run are
    /// unlinked first.
    pub fn initialize(prefix: &str, count: usize, region_size: usize) -> Result<Self> {
        let mut segments = Vec::with_capacity(count);
        for id in 0..count {
            let name = segment_name(prefix, id);
            if SharedRegion::unlink(&name)? {
                log::warn!("removed stale segment {}", name);
            }
            match Segment::create(prefix, id, region_size) {
                Ok(seg) => segments.push(seg),
                Err(e) => {
                    // Unlink what we created so a retry starts clean
                    for seg in &segments {
                        let _ = SharedRegion::unlink(seg.name());
                    }
                    return Err(e);
                }
            }
        }
        log::debug!(
            "segment pool ready: {} segments x {} bytes ({}0..{})",
            count,
            region_size,
            prefix,
            count.saturating_sub(1)
        );
        Ok(SegmentPool {
            prefix: prefix.to_string(),
            segments,
            state: Mutex::new(FreeList {
                free: (0..count).collect(),
                claimed: vec![false; count],
            }),
            available: Condvar::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Chunk buffer size shared by every segment.
    pub fn region_size(&self) -> usize {
        self.segments.first().map(Segment::capacity).unwrap_or(0)
    }

    pub fn segment(&self, id: usize) -> Result<&Segment> {
        self.segments.get(id).ok_or(CacheError::SegmentOutOfRange {
            id,
            count: self.segments.len(),
        })
    }

    /// Block until a segment is free and claim it.
    pub fn acquire(&self) -> usize {
        let mut state = self.state.lock();
        loop {
            if let Some(id) = state.free.pop_front() {
                state.claimed[id] = true;
                return id;
            }
            self.available.wait(&mut state);
        }
    }

    /// Claim a segment if one is free right now.
    pub fn try_acquire(&self) -> Option<usize> {
        let mut state = self.state.lock();
        let id = state.free.pop_front()?;
        state.claimed[id] = true;
        Some(id)
    }

    /// Like `acquire` but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(id) = state.free.pop_front() {
                state.claimed[id] = true;
                return Some(id);
            }
            let timed_out = self.available.wait_until(&mut state, deadline).timed_out();
            if timed_out && state.free.is_empty() {
                return None;
            }
        }
    }

    /// Return a claimed segment and wake a waiter.
    pub fn release(&self, id: usize) -> Result<()> {
        let mut state = self.state.lock();
        match state.claimed.get(id) {
            None => {
                return Err(CacheError::SegmentOutOfRange {
                    id,
                    count: self.segments.len(),
                })
            }
            Some(false) => return Err(CacheError::NotClaimed(id)),
            Some(true) => {}
        }
        state.claimed[id] = false;
        state.free.push_back(id);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Acquire a segment wrapped in a guard that releases it on drop.
    pub fn claim(&self) -> Claim<'_> {
        Claim {
            pool: self,
            id: Some(self.acquire()),
        }
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Snapshot of free ids in hand-out order.
    pub fn free_ids(&self) -> Vec<usize> {
        self.state.lock().free.iter().copied().collect()
    }

    /// Unlink every segment name. Mappings go away when the pool is dropped.
    pub fn teardown(&self) {
        for seg in &self.segments {
            match SharedRegion::unlink(seg.name()) {
                Ok(_) => {}
                Err(e) => log::warn!("teardown: {}", e),
            }
        }
    }
}

/// A claimed segment. Dropping the claim releases it.
pub struct Claim<'a> {
    pool: &'a SegmentPool,
    id: Option<usize>,
}

impl<'a> Claim<'a> {
    pub fn id(&self) -> usize {
        self.id.unwrap_or_default()
    }

    pub fn segment(&self) -> Result<&'a Segment> {
        self.pool.segment(self.id())
    }

    /// Release explicitly, surfacing any error.
    pub fn release(mut self) -> Result<()> {
        match self.id.take() {
            Some(id) => self.pool.release(id),
            None => Ok(()),
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.pool.release(id) {
                log::error!("releasing segment {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::unique_prefix;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct Pool(Arc<SegmentPool>);
    impl Pool {
        fn new(count: usize, size: usize) -> Self {
            Pool(Arc::new(
                SegmentPool::initialize(&unique_prefix(), count, size).unwrap(),
            ))
        }
    }
    impl Drop for Pool {
        fn drop(&mut self) {
            self.0.teardown();
        }
    }

    #[test]
    fn acquire_hands_out_ids_in_fifo_order() {
        let pool = Pool::new(3, 16);
        assert_eq!(pool.0.acquire(), 0);
        assert_eq!(pool.0.acquire(), 1);
        pool.0.release(0).unwrap();
        assert_eq!(pool.0.free_ids(), vec![2, 0]);
        assert_eq!(pool.0.acquire(), 2);
        assert_eq!(pool.0.acquire(), 0);
        assert_eq!(pool.0.try_acquire(), None);
    }

    #[test]
    fn release_rejects_unclaimed_and_unknown_ids() {
        let pool = Pool::new(2, 16);
        assert!(matches!(pool.0.release(1), Err(CacheError::NotClaimed(1))));
        assert!(matches!(
            pool.0.release(9),
            Err(CacheError::SegmentOutOfRange { id: 9, count: 2 })
        ));
        let id = pool.0.acquire();
        pool.0.release(id).unwrap();
        assert!(matches!(pool.0.release(id), Err(CacheError::NotClaimed(_))));
        assert_eq!(pool.0.free_count(), 2);
    }

    #[test]
    fn initialize_replaces_stale_segments() {
        let prefix = unique_prefix();
        let stale = SegmentPool::initialize(&prefix, 2, 8).unwrap();
        drop(stale);
        let pool = SegmentPool::initialize(&prefix, 2, 8).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.region_size(), 8);
        pool.teardown();
        assert!(Segment::open(&prefix, 0, 8).is_err());
    }

    #[test]
    fn claim_guard_releases_on_drop() {
        let pool = Pool::new(1, 16);
        {
            let claim = pool.0.claim();
            assert_eq!(claim.id(), 0);
            assert_eq!(claim.segment().unwrap().capacity(), 16);
            assert_eq!(pool.0.free_count(), 0);
        }
        assert_eq!(pool.0.free_count(), 1);
        let claim = pool.0.claim();
        claim.release().unwrap();
        assert_eq!(pool.0.free_count(), 1);
    }

    #[test]
    fn exhausted_pool_blocks_until_release() {
        let pool = Pool::new(1, 16);
        let first = pool.0.acquire();
        let released = Arc::new(AtomicBool::new(false));

        let waiter = {
            let pool = Arc::clone(&pool.0);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let id = pool.acquire();
                // The id must not be observed before its holder gave it back
                assert!(released.load(Ordering::SeqCst));
                pool.release(id).unwrap();
                id
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        released.store(true, Ordering::SeqCst);
        pool.0.release(first).unwrap();
        assert_eq!(waiter.join().unwrap(), first);
    }

    #[test]
    fn acquire_timeout_gives_up() {
        let pool = Pool::new(1, 16);
        let _held = pool.0.acquire();
        assert_eq!(pool.0.acquire_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn concurrent_holders_never_share_an_id() {
        const SEGMENTS: usize = 4;
        let pool = Pool::new(SEGMENTS, 8);
        let holders: Arc<Vec<AtomicUsize>> =
            Arc::new((0..SEGMENTS).map(|_| AtomicUsize::new(0)).collect());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool.0);
                let holders = Arc::clone(&holders);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let id = pool.acquire();
                        assert_eq!(holders[id].fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        holders[id].fetch_sub(1, Ordering::SeqCst);
                        pool.release(id).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let free: HashSet<usize> = pool.0.free_ids().into_iter().collect();
        assert_eq!(free, (0..SEGMENTS).collect::<HashSet<_>>());
        assert_eq!(pool.0.free_count(), SEGMENTS);
    }
}
