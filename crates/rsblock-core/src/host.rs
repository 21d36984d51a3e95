//! Boundary with the host block-I/O layer.
//!
//! The host owns major-number allocation and makes published disks visible
//! to its users. [`MemoryHost`] is an in-process stand-in that keeps the
//! same contract and is what the CLI and the tests run against.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Highest dynamically assigned major number.
pub const DYNAMIC_MAJOR_MAX: u32 = 254;

/// Host error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostErrorKind {
    /// No major number is available.
    Busy,
    /// The handle or major is not known to the host.
    NotFound,
    /// The host refused to make the disk visible.
    PublishFailed,
}

/// Errors surfaced by [`BlockHost`] implementations.
#[derive(Clone, Debug)]
pub struct HostError {
    kind: HostErrorKind,
    message: Option<String>,
}

impl HostError {
    pub const fn new(kind: HostErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: HostErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> HostErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for HostError {}

pub type HostResult<T> = core::result::Result<T, HostError>;

/// Geometry announced to the host when a disk is published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub major: u32,
    pub minor: u32,
    pub name: String,
    pub capacity_sectors: u64,
    pub logical_block_size: u32,
    pub hw_queue_count: u16,
}

/// Host-side token for a published disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublishHandle(u64);

impl PublishHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Host block layer operations consumed by the core.
pub trait BlockHost: Send + Sync {
    /// Reserve a major number for `name`.
    fn register(&self, name: &str) -> HostResult<u32>;

    /// Make a disk visible. Commands may be routed to it as soon as this returns.
    fn publish(&self, disk: &DiskDescriptor) -> HostResult<PublishHandle>;

    fn unpublish(&self, handle: PublishHandle);

    fn unregister(&self, major: u32);

    /// User open of the disk node. Stateless for the core.
    fn open(&self, _handle: PublishHandle) -> HostResult<()> {
        Ok(())
    }

    /// User release of the disk node.
    fn release(&self, _handle: PublishHandle) -> HostResult<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct PublishedDisk {
    descriptor: DiskDescriptor,
    open_count: u32,
}

#[derive(Debug, Default)]
struct MemoryHostInner {
    majors: BTreeMap<u32, String>,
    published: BTreeMap<PublishHandle, PublishedDisk>,
    next_handle: u64,
    fail_publish: bool,
    publish_calls: u64,
    unpublish_calls: u64,
}

/// In-process host: hands out dynamic majors and tracks published disks.
#[derive(Debug)]
pub struct MemoryHost {
    inner: Mutex<MemoryHostInner>,
    max_majors: usize,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::with_max_majors(DYNAMIC_MAJOR_MAX as usize)
    }

    pub fn with_max_majors(max_majors: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryHostInner::default()),
            max_majors,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryHostInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following `publish` fail until cleared.
    pub fn set_fail_publish(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    pub fn registered_majors(&self) -> Vec<u32> {
        self.lock().majors.keys().copied().collect()
    }

    pub fn published(&self) -> Vec<DiskDescriptor> {
        self.lock()
            .published
            .values()
            .map(|disk| disk.descriptor.clone())
            .collect()
    }

    pub fn is_published(&self, handle: PublishHandle) -> bool {
        self.lock().published.contains_key(&handle)
    }

    pub fn open_count(&self, handle: PublishHandle) -> Option<u32> {
        self.lock().published.get(&handle).map(|disk| disk.open_count)
    }

    pub fn publish_calls(&self) -> u64 {
        self.lock().publish_calls
    }

    pub fn unpublish_calls(&self) -> u64 {
        self.lock().unpublish_calls
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockHost for MemoryHost {
    fn register(&self, name: &str) -> HostResult<u32> {
        let mut inner = self.lock();
        if inner.majors.len() >= self.max_majors {
            return Err(HostError::with_message(
                HostErrorKind::Busy,
                format!("no free major for {name}"),
            ));
        }
        let major = (1..=DYNAMIC_MAJOR_MAX)
            .rev()
            .find(|major| !inner.majors.contains_key(major))
            .ok_or_else(|| {
                HostError::with_message(HostErrorKind::Busy, format!("no free major for {name}"))
            })?;
        inner.majors.insert(major, name.to_owned());
        debug!(major, name, "host major registered");
        Ok(major)
    }

    fn publish(&self, disk: &DiskDescriptor) -> HostResult<PublishHandle> {
        let mut inner = self.lock();
        inner.publish_calls += 1;
        if inner.fail_publish {
            return Err(HostError::with_message(
                HostErrorKind::PublishFailed,
                format!("host refused {}", disk.name),
            ));
        }
        if !inner.majors.contains_key(&disk.major) {
            return Err(HostError::with_message(
                HostErrorKind::NotFound,
                format!("major {} not registered", disk.major),
            ));
        }
        inner.next_handle += 1;
        let handle = PublishHandle(inner.next_handle);
        inner.published.insert(
            handle,
            PublishedDisk {
                descriptor: disk.clone(),
                open_count: 0,
            },
        );
        info!(
            name = %disk.name,
            major = disk.major,
            minor = disk.minor,
            capacity_sectors = disk.capacity_sectors,
            logical_block_size = disk.logical_block_size,
            "disk published"
        );
        Ok(handle)
    }

    fn unpublish(&self, handle: PublishHandle) {
        let mut inner = self.lock();
        inner.unpublish_calls += 1;
        match inner.published.remove(&handle) {
            Some(disk) => {
                if disk.open_count != 0 {
                    warn!(
                        name = %disk.descriptor.name,
                        open_count = disk.open_count,
                        "disk unpublished while still open"
                    );
                }
                info!(name = %disk.descriptor.name, "disk unpublished");
            }
            None => warn!(handle = handle.raw(), "unpublish of unknown handle"),
        }
    }

    fn unregister(&self, major: u32) {
        if self.lock().majors.remove(&major).is_none() {
            warn!(major, "unregister of unknown major");
        } else {
            debug!(major, "host major unregistered");
        }
    }

    fn open(&self, handle: PublishHandle) -> HostResult<()> {
        let mut inner = self.lock();
        let disk = inner
            .published
            .get_mut(&handle)
            .ok_or_else(|| HostError::new(HostErrorKind::NotFound))?;
        disk.open_count += 1;
        debug!(name = %disk.descriptor.name, open_count = disk.open_count, "disk opened");
        Ok(())
    }

    fn release(&self, handle: PublishHandle) -> HostResult<()> {
        let mut inner = self.lock();
        let disk = inner
            .published
            .get_mut(&handle)
            .ok_or_else(|| HostError::new(HostErrorKind::NotFound))?;
        disk.open_count = disk.open_count.saturating_sub(1);
        debug!(name = %disk.descriptor.name, open_count = disk.open_count, "disk released");
        Ok(())
    }
}
