//! # Disk lifecycle
//!
//! Each registered device owns one [`DiskLifecycleManager`]. It walks the
//! device through an explicit state machine:
//!
//! ```text
//! Unregistered --prepare_disk--> Created --activate--> Active
//! Active --begin_drain--> Draining --delete_disk--> Removed
//! Created --delete_disk--> Removed
//! Unregistered --unregister--> Removed
//! ```
//!
//! `Removed` is terminal. A handle that outlives its registry entry can
//! never bring a disk up again.
//!
//! * Queueing resources (tag set, queue set) and the backend exist only in
//!   `Created`, `Active` and `Draining`.
//! * Every setup step that can fail gives back what earlier steps acquired
//!   before the error reaches the caller. Nothing is released on success.
//! * Teardown drains first, then unpublishes, then releases the queue set and
//!   finally the tag set.
//!
//! Lifecycle calls are serialized by a dedicated lock. The state and the
//! in-flight count live behind a separate short-lived mutex that request
//! submission also takes, and that lock is never held across a backend call.

use crate::backend::Backend;
use crate::config::{DiskConfig, SECTOR_SIZE};
use crate::host::{BlockHost, DiskDescriptor, PublishHandle};
use crate::metrics;
use crate::queue::QueueSet;
use crate::tags::TagSetAllocator;
use crate::{BlkError, BlkErrorKind, BlkResult};
use std::fmt;
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Process-unique device identifier. Mirrors the host major number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Registered slot without a disk.
    Unregistered,
    Created,
    Active,
    Draining,
    Removed,
}

impl DeviceState {
    fn as_str(self) -> &'static str {
        match self {
            DeviceState::Unregistered => "unregistered",
            DeviceState::Created => "created",
            DeviceState::Active => "active",
            DeviceState::Draining => "draining",
            DeviceState::Removed => "removed",
        }
    }

    /// Whether queueing resources exist in this state.
    pub fn holds_resources(self) -> bool {
        matches!(
            self,
            DeviceState::Created | DeviceState::Active | DeviceState::Draining
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacity and block size fixed at disk creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskGeometry {
    pub capacity_sectors: u64,
    pub logical_block_size: u32,
}

impl DiskGeometry {
    pub fn sectors_per_block(&self) -> u64 {
        (self.logical_block_size / SECTOR_SIZE) as u64
    }
}

/// Point-in-time view of a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub state: DeviceState,
    pub geometry: Option<DiskGeometry>,
    pub hw_queue_count: Option<u16>,
    pub queue_depth: Option<u16>,
    pub inflight: usize,
}

/// Resources that exist while the disk is `Created`, `Active` or `Draining`.
pub(crate) struct DiskResources {
    pub(crate) geometry: DiskGeometry,
    pub(crate) queues: QueueSet,
    pub(crate) backend: Arc<dyn Backend>,
}

#[derive(Debug)]
struct DiskInner {
    state: DeviceState,
    inflight: usize,
    geometry: Option<DiskGeometry>,
    publish: Option<PublishHandle>,
}

/// Drives one device through creation, activation, drain and removal.
pub struct DiskLifecycleManager {
    id: DeviceId,
    name: String,
    host: Arc<dyn BlockHost>,
    allocator: TagSetAllocator,
    lifecycle: Mutex<()>,
    inner: Mutex<DiskInner>,
    drained: Condvar,
    resources: RwLock<Option<DiskResources>>,
}

impl DiskLifecycleManager {
    pub fn new(
        id: DeviceId,
        name: impl Into<String>,
        host: Arc<dyn BlockHost>,
        allocator: TagSetAllocator,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            host,
            allocator,
            lifecycle: Mutex::new(()),
            inner: Mutex::new(DiskInner {
                state: DeviceState::Unregistered,
                inflight: 0,
                geometry: None,
                publish: None,
            }),
            drained: Condvar::new(),
            resources: RwLock::new(None),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        self.lock_inner().state
    }

    pub fn geometry(&self) -> Option<DiskGeometry> {
        self.lock_inner().geometry
    }

    pub fn capacity_sectors(&self) -> Option<u64> {
        self.geometry().map(|g| g.capacity_sectors)
    }

    pub fn logical_block_size(&self) -> Option<u32> {
        self.geometry().map(|g| g.logical_block_size)
    }

    pub fn inflight(&self) -> usize {
        self.lock_inner().inflight
    }

    pub fn publish_handle(&self) -> Option<PublishHandle> {
        self.lock_inner().publish
    }

    pub fn info(&self) -> DeviceInfo {
        let (state, geometry, inflight) = {
            let inner = self.lock_inner();
            (inner.state, inner.geometry, inner.inflight)
        };
        let resources = self.read_resources();
        DeviceInfo {
            id: self.id,
            name: self.name.clone(),
            state,
            geometry,
            hw_queue_count: resources.as_ref().map(|r| r.queues.hw_queue_count()),
            queue_depth: resources.as_ref().map(|r| r.queues.queue_depth()),
            inflight,
        }
    }

    /// Allocate the tag set and queue set and record the geometry, leaving the
    /// disk `Created` but not yet visible to the host.
    pub fn prepare_disk(&self, config: &DiskConfig, backend: Arc<dyn Backend>) -> BlkResult<()> {
        let _lifecycle = self.lock_lifecycle();
        self.prepare_locked(config, backend)
    }

    /// Publish a `Created` disk so commands can reach it.
    pub fn activate(&self) -> BlkResult<()> {
        let _lifecycle = self.lock_lifecycle();
        self.activate_locked()
    }

    /// Full bring-up: [`prepare_disk`](Self::prepare_disk) then
    /// [`activate`](Self::activate).
    pub fn create_disk(&self, config: &DiskConfig, backend: Arc<dyn Backend>) -> BlkResult<()> {
        let _lifecycle = self.lock_lifecycle();
        self.prepare_locked(config, backend)?;
        self.activate_locked()
    }

    /// Stop admitting requests and wait for the in-flight ones to finish.
    pub fn begin_drain(&self) -> BlkResult<()> {
        let _lifecycle = self.lock_lifecycle();
        self.drain_locked(None)
    }

    /// Like [`begin_drain`](Self::begin_drain) but gives up after `timeout`.
    ///
    /// On timeout the disk stays `Draining` and `DeviceBusy` is returned.
    pub fn begin_drain_timeout(&self, timeout: Duration) -> BlkResult<()> {
        let _lifecycle = self.lock_lifecycle();
        self.drain_locked(Some(timeout))
    }

    /// Drain, unpublish and release everything. Repeatable.
    pub fn delete_disk(&self) -> BlkResult<()> {
        let _lifecycle = self.lock_lifecycle();
        match self.state() {
            DeviceState::Removed => {
                debug!(dev_id = self.id.raw(), "delete_disk on removed device");
                return Ok(());
            }
            DeviceState::Unregistered => {
                debug!(dev_id = self.id.raw(), "delete_disk without a disk");
                return Ok(());
            }
            DeviceState::Created => {}
            DeviceState::Active | DeviceState::Draining => self.drain_locked(None)?,
        }

        let handle = self.lock_inner().publish.take();
        if let Some(handle) = handle {
            self.host.unpublish(handle);
        }
        self.release_resources();
        self.transition(DeviceState::Removed);
        metrics::record_disk_removed();
        Ok(())
    }

    /// Mark a disk-less or removed device as finished for good. Any handle
    /// still held afterwards can no longer create a disk.
    pub(crate) fn retire(&self) -> BlkResult<()> {
        let _lifecycle = self.lock_lifecycle();
        let mut inner = self.lock_inner();
        match inner.state {
            DeviceState::Unregistered | DeviceState::Removed => {
                self.transition_locked(&mut inner, DeviceState::Removed);
                Ok(())
            }
            state => Err(BlkError::with_message(
                BlkErrorKind::DeviceBusy,
                format!("device {} is {state}; delete the disk first", self.id),
            )),
        }
    }

    fn prepare_locked(&self, config: &DiskConfig, backend: Arc<dyn Backend>) -> BlkResult<()> {
        let state = self.state();
        if state != DeviceState::Unregistered {
            return Err(BlkError::with_message(
                BlkErrorKind::DeviceBusy,
                format!("device {} already has a disk (state={state})", self.id),
            ));
        }
        debug!(
            dev_id = self.id.raw(),
            capacity_sectors = config.capacity_sectors,
            logical_block_size = config.logical_block_size,
            hw_queues = config.queue.hw_queue_count,
            queue_depth = config.queue.queue_depth,
            "create_disk requested"
        );
        config.validate_geometry()?;
        let backend_sectors = backend.capacity_sectors();
        if backend_sectors < config.capacity_sectors {
            return Err(BlkError::with_message(
                BlkErrorKind::InvalidConfig,
                format!(
                    "backend holds {backend_sectors} sectors, disk needs {}",
                    config.capacity_sectors
                ),
            ));
        }

        let tag_set = self.allocator.allocate(&config.queue)?;
        // QueueSet owns the tag set from here; it is dropped, and so released,
        // if binding fails.
        let queues = QueueSet::new(tag_set)?;
        let geometry = DiskGeometry {
            capacity_sectors: config.capacity_sectors,
            logical_block_size: config.logical_block_size,
        };
        *self.write_resources() = Some(DiskResources {
            geometry,
            queues,
            backend,
        });
        self.lock_inner().geometry = Some(geometry);
        self.transition(DeviceState::Created);
        Ok(())
    }

    fn activate_locked(&self) -> BlkResult<()> {
        let state = self.state();
        if state != DeviceState::Created {
            return Err(BlkError::with_message(
                BlkErrorKind::DeviceBusy,
                format!("device {} cannot be activated from {state}", self.id),
            ));
        }
        let descriptor = {
            let resources = self.read_resources();
            let Some(resources) = resources.as_ref() else {
                return Err(BlkError::with_message(
                    BlkErrorKind::DeviceBusy,
                    "created disk lost its resources",
                ));
            };
            DiskDescriptor {
                major: self.id.raw(),
                minor: 0,
                name: format!("rsblock{}", self.id),
                capacity_sectors: resources.geometry.capacity_sectors,
                logical_block_size: resources.geometry.logical_block_size,
                hw_queue_count: resources.queues.hw_queue_count(),
            }
        };

        match self.host.publish(&descriptor) {
            Ok(handle) => {
                let mut inner = self.lock_inner();
                inner.publish = Some(handle);
                self.transition_locked(&mut inner, DeviceState::Active);
                drop(inner);
                metrics::record_disk_created();
                info!(
                    dev_id = self.id.raw(),
                    name = %self.name,
                    capacity_sectors = descriptor.capacity_sectors,
                    logical_block_size = descriptor.logical_block_size,
                    hw_queues = descriptor.hw_queue_count,
                    "disk active"
                );
                Ok(())
            }
            Err(err) => {
                warn!(dev_id = self.id.raw(), error = %err, "publish failed; rolling back disk");
                self.release_resources();
                let mut inner = self.lock_inner();
                inner.geometry = None;
                self.transition_locked(&mut inner, DeviceState::Unregistered);
                Err(err.into())
            }
        }
    }

    fn drain_locked(&self, timeout: Option<Duration>) -> BlkResult<()> {
        let mut inner = self.lock_inner();
        match inner.state {
            DeviceState::Active => self.transition_locked(&mut inner, DeviceState::Draining),
            DeviceState::Draining => {}
            other => {
                return Err(BlkError::with_message(
                    BlkErrorKind::DeviceNotActive,
                    format!("device {} cannot drain from {other}", self.id),
                ));
            }
        }
        if inner.inflight != 0 {
            debug!(
                dev_id = self.id.raw(),
                inflight = inner.inflight,
                "waiting for in-flight requests"
            );
        }
        let started = Instant::now();
        match timeout {
            None => {
                let _inner = self
                    .drained
                    .wait_while(inner, |inner| inner.inflight != 0)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(timeout) => {
                let (inner, result) = self
                    .drained
                    .wait_timeout_while(inner, timeout, |inner| inner.inflight != 0)
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() {
                    warn!(
                        dev_id = self.id.raw(),
                        inflight = inner.inflight,
                        "drain timed out"
                    );
                    return Err(BlkError::with_message(
                        BlkErrorKind::DeviceBusy,
                        format!(
                            "device {} still has {} requests in flight",
                            self.id, inner.inflight
                        ),
                    ));
                }
            }
        }
        debug!(
            dev_id = self.id.raw(),
            waited_us = started.elapsed().as_micros() as u64,
            "drain complete"
        );
        Ok(())
    }

    /// Queue set first, then its tag set, then the backend reference.
    fn release_resources(&self) {
        let resources = self.write_resources().take();
        if let Some(DiskResources {
            queues, backend, ..
        }) = resources
        {
            let tag_set = queues.into_tag_set();
            self.allocator.release(tag_set);
            drop(backend);
            debug!(dev_id = self.id.raw(), "disk resources released");
        }
    }

    /// Admit one request. Fails unless the disk is `Active`.
    pub(crate) fn admit(&self) -> BlkResult<Admission<'_>> {
        let mut inner = self.lock_inner();
        if inner.state != DeviceState::Active {
            return Err(BlkError::with_message(
                BlkErrorKind::DeviceNotActive,
                format!("device {} is {}", self.id, inner.state),
            ));
        }
        inner.inflight += 1;
        metrics::record_inflight(self.id.raw(), inner.inflight);
        Ok(Admission { disk: self })
    }

    fn finish_request(&self) {
        let mut inner = self.lock_inner();
        inner.inflight -= 1;
        metrics::record_inflight(self.id.raw(), inner.inflight);
        if inner.inflight == 0 && inner.state == DeviceState::Draining {
            self.drained.notify_all();
        }
    }

    pub(crate) fn read_resources(&self) -> RwLockReadGuard<'_, Option<DiskResources>> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_resources(&self) -> RwLockWriteGuard<'_, Option<DiskResources>> {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_inner(&self) -> MutexGuard<'_, DiskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: DeviceState) {
        let mut inner = self.lock_inner();
        self.transition_locked(&mut inner, next);
    }

    fn transition_locked(&self, inner: &mut DiskInner, next: DeviceState) {
        if inner.state == next {
            return;
        }
        info!(
            dev_id = self.id.raw(),
            from = %inner.state,
            to = %next,
            "device state transition"
        );
        inner.state = next;
    }
}

impl fmt::Debug for DiskLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskLifecycleManager")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for DiskLifecycleManager {
    fn drop(&mut self) {
        if self.state().holds_resources() {
            warn!(
                dev_id = self.id.raw(),
                "disk dropped without delete_disk; releasing resources"
            );
            let handle = self.lock_inner().publish.take();
            if let Some(handle) = handle {
                self.host.unpublish(handle);
            }
            self.release_resources();
        }
    }
}

/// An admitted request's claim on the disk's in-flight count.
#[derive(Debug)]
pub(crate) struct Admission<'a> {
    disk: &'a DiskLifecycleManager,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.disk.finish_request();
    }
}
