use crate::tags::{Tag, TagPool, TagSet};
use crate::{BlkError, BlkErrorKind, BlkResult};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Per hardware queue bookkeeping. Only touched by requests routed to it.
#[derive(Debug)]
pub struct HwQueue {
    queue_id: u16,
    inflight: AtomicUsize,
    dispatched: AtomicU64,
}

impl HwQueue {
    fn new(queue_id: u16) -> Self {
        Self {
            queue_id,
            inflight: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Requests that have completed on this queue.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Acquire)
    }
}

#[cfg(test)]
thread_local! {
    static FAIL_NEXT_BIND: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Make the next [`QueueSet::new`] on this thread fail as if the queue
/// contexts could not be allocated.
#[cfg(test)]
pub(crate) fn fail_next_bind() {
    FAIL_NEXT_BIND.with(|fail| fail.set(true));
}

/// Hardware dispatch queues of one device, bound to the device's [`TagSet`].
#[derive(Debug)]
pub struct QueueSet {
    queues: Vec<HwQueue>,
    tag_set: TagSet,
}

impl QueueSet {
    /// Bind a queue set to `tag_set`. The tag set is released if this fails.
    pub fn new(tag_set: TagSet) -> BlkResult<Self> {
        let count = tag_set.hw_queue_count();
        #[cfg(test)]
        if FAIL_NEXT_BIND.with(|fail| fail.replace(false)) {
            return Err(BlkError::with_message(
                BlkErrorKind::AllocationFailed,
                format!("queue contexts for {count} queues: injected failure"),
            ));
        }
        let mut queues = Vec::new();
        queues.try_reserve_exact(count as usize).map_err(|err| {
            BlkError::with_message(
                BlkErrorKind::AllocationFailed,
                format!("queue contexts for {count} queues: {err}"),
            )
        })?;
        queues.extend((0..count).map(HwQueue::new));
        debug!(
            hw_queues = count,
            queue_depth = tag_set.queue_depth(),
            "queue set ready"
        );
        Ok(Self { queues, tag_set })
    }

    pub fn hw_queue_count(&self) -> u16 {
        self.queues.len() as u16
    }

    pub fn queue_depth(&self) -> u16 {
        self.tag_set.queue_depth()
    }

    pub fn tag_set(&self) -> &TagSet {
        &self.tag_set
    }

    pub fn queue(&self, queue_id: u16) -> Option<&HwQueue> {
        self.queues.get(queue_id as usize)
    }

    pub fn queues(&self) -> impl Iterator<Item = &HwQueue> {
        self.queues.iter()
    }

    /// Pick the hardware queue for a request.
    ///
    /// An explicit hint wins (modulo the queue count). Otherwise the calling
    /// thread always lands on the same queue, the way a CPU maps to one
    /// hardware context.
    pub fn map_queue(&self, hint: Option<u16>) -> u16 {
        let count = self.queues.len() as u64;
        let slot = match hint {
            Some(hint) => hint as u64,
            None => {
                let mut hasher = DefaultHasher::new();
                std::thread::current().id().hash(&mut hasher);
                hasher.finish()
            }
        };
        (slot % count) as u16
    }

    /// Reserve a tag on `queue_id` for a request.
    ///
    /// A saturated queue fails with `DeviceBusy` instead of waiting for
    /// another request to complete.
    pub fn start_request(&self, queue_id: u16) -> BlkResult<QueueSlot<'_>> {
        let (queue, pool) = self.lookup(queue_id)?;
        let Some(tag) = pool.try_acquire() else {
            trace!(queue_id, depth = pool.depth(), "queue saturated");
            return Err(BlkError::with_message(
                BlkErrorKind::DeviceBusy,
                format!("queue {queue_id} has all {} tags in flight", pool.depth()),
            ));
        };
        queue.inflight.fetch_add(1, Ordering::AcqRel);
        Ok(QueueSlot { queue, tag })
    }

    /// Requests currently holding a tag, across all queues.
    pub fn inflight(&self) -> usize {
        self.queues.iter().map(HwQueue::inflight).sum()
    }

    /// Tear the queues down and hand back the tag set for release.
    pub fn into_tag_set(self) -> TagSet {
        debug!(hw_queues = self.queues.len(), "queue set released");
        self.tag_set
    }

    fn lookup(&self, queue_id: u16) -> BlkResult<(&HwQueue, &TagPool)> {
        match (self.queues.get(queue_id as usize), self.tag_set.pool(queue_id)) {
            (Some(queue), Some(pool)) => Ok((queue, pool)),
            _ => Err(BlkError::with_message(
                BlkErrorKind::InvalidConfig,
                format!("queue {queue_id} out of range"),
            )),
        }
    }
}

/// A request's hold on one hardware queue: its tag plus the in-flight count.
pub struct QueueSlot<'a> {
    queue: &'a HwQueue,
    tag: Tag<'a>,
}

impl QueueSlot<'_> {
    pub fn queue_id(&self) -> u16 {
        self.queue.queue_id
    }

    pub fn tag(&self) -> u16 {
        self.tag.value()
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queue.dispatched.fetch_add(1, Ordering::AcqRel);
        self.queue.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::tags::TagSetAllocator;

    fn queue_set(queues: u16, depth: u16) -> (TagSetAllocator, QueueSet) {
        let allocator = TagSetAllocator::new(4096);
        let tags = allocator
            .allocate(&QueueConfig::new(queues, depth))
            .unwrap();
        (allocator, QueueSet::new(tags).unwrap())
    }

    #[test]
    fn hint_selects_queue() {
        let (_alloc, set) = queue_set(4, 8);
        assert_eq!(set.map_queue(Some(2)), 2);
        assert_eq!(set.map_queue(Some(6)), 2);
    }

    #[test]
    fn thread_routing_is_stable() {
        let (_alloc, set) = queue_set(4, 8);
        let first = set.map_queue(None);
        for _ in 0..16 {
            assert_eq!(set.map_queue(None), first);
        }
        assert!(first < 4);
    }

    #[test]
    fn slot_tracks_inflight() {
        let (_alloc, set) = queue_set(2, 4);
        let slot = set.start_request(1).unwrap();
        assert_eq!(slot.queue_id(), 1);
        assert_eq!(set.inflight(), 1);
        assert_eq!(set.queue(1).unwrap().inflight(), 1);
        assert_eq!(set.queue(0).unwrap().inflight(), 0);
        drop(slot);
        assert_eq!(set.inflight(), 0);
        assert_eq!(set.queue(1).unwrap().dispatched(), 1);
        assert!(set.start_request(2).is_err());
    }

    #[test]
    fn failed_bind_releases_tag_set() {
        let allocator = TagSetAllocator::new(64);
        let tags = allocator.allocate(&QueueConfig::new(2, 16)).unwrap();
        assert_eq!(allocator.tags_in_use(), 32);
        fail_next_bind();
        let err = QueueSet::new(tags).unwrap_err();
        assert_eq!(err.kind(), BlkErrorKind::AllocationFailed);
        assert_eq!(allocator.tags_in_use(), 0);
        assert_eq!(allocator.allocate_count(), allocator.release_count());
    }

    #[test]
    fn saturated_queue_is_busy() {
        let (_alloc, set) = queue_set(2, 1);
        let held = set.start_request(0).unwrap();
        let err = set.start_request(0).err().unwrap();
        assert_eq!(err.kind(), BlkErrorKind::DeviceBusy);
        assert_eq!(set.queue(0).unwrap().inflight(), 1);
        // Other queues are unaffected.
        drop(set.start_request(1).unwrap());
        drop(held);
        assert!(set.start_request(0).is_ok());
    }

    #[test]
    fn teardown_returns_tag_set() {
        let (alloc, set) = queue_set(2, 16);
        assert_eq!(alloc.tags_in_use(), 32);
        let tags = set.into_tag_set();
        assert_eq!(tags.hw_queue_count(), 2);
        alloc.release(tags);
        assert_eq!(alloc.tags_in_use(), 0);
        assert_eq!(alloc.release_count(), 1);
    }
}
