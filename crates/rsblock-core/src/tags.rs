//! Tag sets: the bounded pools of in-flight command slots behind each
//! hardware queue.
//!
//! A [`TagSet`] is either fully allocated or not allocated at all. The
//! allocator reserves tags queue by queue and every reservation is an RAII
//! guard, so a failure part way through hands back whatever was already
//! reserved before [`TagSetAllocator::allocate`] returns.

use crate::config::{QueueConfig, TagSetFlags};
use crate::{BlkError, BlkErrorKind, BlkResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct AllocatorShared {
    budget: usize,
    in_use: AtomicUsize,
    allocate_count: AtomicU64,
    release_count: AtomicU64,
}

impl AllocatorShared {
    fn reserve(self: &Arc<Self>, tags: usize) -> Option<Reservation> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(tags)?;
            if next > self.budget {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        shared: self.clone(),
                        tags,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Tags held against the allocator budget. Returned on drop.
#[derive(Debug)]
struct Reservation {
    shared: Arc<AllocatorShared>,
    tags: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.shared.in_use.fetch_sub(self.tags, Ordering::AcqRel);
    }
}

/// Hands out [`TagSet`]s from a fixed tag budget.
#[derive(Clone, Debug)]
pub struct TagSetAllocator {
    shared: Arc<AllocatorShared>,
}

impl TagSetAllocator {
    pub fn new(budget: usize) -> Self {
        Self {
            shared: Arc::new(AllocatorShared {
                budget,
                in_use: AtomicUsize::new(0),
                allocate_count: AtomicU64::new(0),
                release_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn budget(&self) -> usize {
        self.shared.budget
    }

    pub fn tags_in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::Acquire)
    }

    /// Number of tag sets successfully allocated so far.
    pub fn allocate_count(&self) -> u64 {
        self.shared.allocate_count.load(Ordering::Acquire)
    }

    /// Number of tag sets released so far.
    pub fn release_count(&self) -> u64 {
        self.shared.release_count.load(Ordering::Acquire)
    }

    pub fn allocate(&self, config: &QueueConfig) -> BlkResult<TagSet> {
        config.validate()?;
        let depth = config.queue_depth as usize;
        let mut pools = Vec::with_capacity(config.hw_queue_count as usize);
        let mut reservations = Vec::with_capacity(config.hw_queue_count as usize);
        for queue_id in 0..config.hw_queue_count {
            let Some(reservation) = self.shared.reserve(depth) else {
                warn!(
                    queue_id,
                    queue_depth = config.queue_depth,
                    in_use = self.tags_in_use(),
                    budget = self.shared.budget,
                    "tag budget exhausted; rolling back tag set"
                );
                // `reservations` drops here and returns every earlier queue's tags.
                return Err(BlkError::with_message(
                    BlkErrorKind::AllocationFailed,
                    format!(
                        "cannot reserve {depth} tags for queue {queue_id} ({} of {} in use)",
                        self.tags_in_use(),
                        self.shared.budget
                    ),
                ));
            };
            reservations.push(reservation);
            pools.push(TagPool::new(queue_id, config.queue_depth));
        }
        self.shared.allocate_count.fetch_add(1, Ordering::AcqRel);
        debug!(
            hw_queues = config.hw_queue_count,
            queue_depth = config.queue_depth,
            flags = ?config.flags,
            numa_affinity = config.numa_affinity,
            "tag set allocated"
        );
        Ok(TagSet {
            flags: config.flags,
            numa_affinity: config.numa_affinity,
            queue_depth: config.queue_depth,
            pools,
            _reservations: reservations,
            shared: self.shared.clone(),
        })
    }

    /// Return a tag set to the allocator.
    ///
    /// Takes the set by value; dropping a [`TagSet`] has the same effect.
    pub fn release(&self, tag_set: TagSet) {
        drop(tag_set);
    }
}

/// Per-device pool of dispatch tags, one [`TagPool`] per hardware queue.
pub struct TagSet {
    flags: TagSetFlags,
    numa_affinity: Option<u32>,
    queue_depth: u16,
    pools: Vec<TagPool>,
    _reservations: Vec<Reservation>,
    shared: Arc<AllocatorShared>,
}

impl TagSet {
    pub fn flags(&self) -> TagSetFlags {
        self.flags
    }

    pub fn numa_affinity(&self) -> Option<u32> {
        self.numa_affinity
    }

    pub fn hw_queue_count(&self) -> u16 {
        self.pools.len() as u16
    }

    pub fn queue_depth(&self) -> u16 {
        self.queue_depth
    }

    pub fn pool(&self, queue_id: u16) -> Option<&TagPool> {
        self.pools.get(queue_id as usize)
    }

    /// Tags currently checked out across every queue.
    pub fn busy_tags(&self) -> usize {
        self.pools.iter().map(TagPool::busy).sum()
    }
}

impl fmt::Debug for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagSet")
            .field("flags", &self.flags)
            .field("numa_affinity", &self.numa_affinity)
            .field("hw_queue_count", &self.pools.len())
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

impl Drop for TagSet {
    fn drop(&mut self) {
        let busy = self.busy_tags();
        if busy != 0 {
            warn!(busy, "tag set released with tags still checked out");
        }
        self.shared.release_count.fetch_add(1, Ordering::AcqRel);
        debug!(hw_queues = self.pools.len(), "tag set released");
    }
}

/// Free-tag pool for a single hardware queue.
pub struct TagPool {
    queue_id: u16,
    depth: u16,
    free: Mutex<Vec<u16>>,
}

impl TagPool {
    fn new(queue_id: u16, depth: u16) -> Self {
        Self {
            queue_id,
            depth,
            free: Mutex::new((0..depth).rev().collect()),
        }
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn busy(&self) -> usize {
        let free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        self.depth as usize - free.len()
    }

    pub fn try_acquire(&self) -> Option<Tag<'_>> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free.pop().map(|tag| Tag { pool: self, tag })
    }

    fn put(&self, tag: u16) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free.push(tag);
        trace!(queue_id = self.queue_id, tag, "tag returned");
    }
}

/// A checked-out tag. Goes back to its pool on drop.
pub struct Tag<'a> {
    pool: &'a TagPool,
    tag: u16,
}

impl Tag<'_> {
    pub fn value(&self) -> u16 {
        self.tag
    }

    pub fn queue_id(&self) -> u16 {
        self.pool.queue_id
    }
}

impl Drop for Tag<'_> {
    fn drop(&mut self) {
        self.pool.put(self.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn allocate_and_release_balance_counts() {
        let allocator = TagSetAllocator::new(1024);
        let set = allocator
            .allocate(&QueueConfig::new(2, 64).with_flags(TagSetFlags::SHOULD_MERGE))
            .unwrap();
        assert_eq!(set.hw_queue_count(), 2);
        assert_eq!(set.flags(), TagSetFlags::SHOULD_MERGE);
        assert_eq!(allocator.tags_in_use(), 128);
        assert_eq!(allocator.allocate_count(), 1);
        assert_eq!(allocator.release_count(), 0);

        allocator.release(set);
        assert_eq!(allocator.tags_in_use(), 0);
        assert_eq!(allocator.release_count(), 1);
    }

    #[test]
    fn invalid_config_holds_nothing() {
        let allocator = TagSetAllocator::new(1024);
        for cfg in [QueueConfig::new(0, 8), QueueConfig::new(8, 0)] {
            let err = allocator.allocate(&cfg).unwrap_err();
            assert_eq!(err.kind(), BlkErrorKind::InvalidConfig);
        }
        assert_eq!(allocator.tags_in_use(), 0);
        assert_eq!(allocator.allocate_count(), allocator.release_count());
    }

    #[test]
    fn partial_allocation_rolls_back() {
        // Room for the first queue only.
        let allocator = TagSetAllocator::new(96);
        let err = allocator.allocate(&QueueConfig::new(2, 64)).unwrap_err();
        assert_eq!(err.kind(), BlkErrorKind::AllocationFailed);
        assert_eq!(allocator.tags_in_use(), 0);
        assert_eq!(allocator.allocate_count(), 0);
        assert_eq!(allocator.release_count(), 0);

        // The budget is intact afterwards.
        let set = allocator.allocate(&QueueConfig::new(1, 96)).unwrap();
        assert_eq!(allocator.tags_in_use(), 96);
        drop(set);
        assert_eq!(allocator.tags_in_use(), 0);
    }

    #[test]
    fn tags_are_unique_and_recycled() {
        let allocator = TagSetAllocator::new(8);
        let set = allocator.allocate(&QueueConfig::new(1, 2)).unwrap();
        let pool = set.pool(0).unwrap();
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_ne!(a.value(), b.value());
        assert!(pool.try_acquire().is_none());
        assert_eq!(set.busy_tags(), 2);
        drop(a);
        let c = pool.try_acquire().unwrap();
        assert!(c.value() < 2);
        drop((b, c));
        assert_eq!(set.busy_tags(), 0);
    }

    #[test]
    fn tags_return_to_pool_across_threads() {
        let allocator = TagSetAllocator::new(8);
        let set = allocator.allocate(&QueueConfig::new(1, 4)).unwrap();
        let pool = set.pool(0).unwrap();
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        if let Some(tag) = pool.try_acquire() {
                            assert!(tag.value() < 4);
                        }
                    }
                });
            }
        });
        assert_eq!(pool.busy(), 0);
    }
}
