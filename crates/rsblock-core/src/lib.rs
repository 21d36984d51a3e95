//! Multi-queue block device core: tag allocation, hardware queues, disk
//! lifecycle and request dispatch.

pub mod backend;
pub mod config;
pub mod disk;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod host;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod request;
pub mod tags;
pub mod workers;

pub use backend::{Backend, BackendError, BackendErrorKind, BackendResult, FileBackend, RamBackend};
pub use config::{
    DiskConfig, DriverConfig, MAX_LOGICAL_BLOCK_SIZE, MAX_QUEUE_DEPTH, QueueConfig, SECTOR_SHIFT,
    SECTOR_SIZE, TagSetFlags,
};
pub use disk::{DeviceId, DeviceInfo, DeviceState, DiskGeometry, DiskLifecycleManager};
pub use dispatch::RequestDispatcher;
pub use driver::BlockDriver;
pub use error::{BlkError, BlkErrorKind, BlkResult};
pub use host::{
    BlockHost, DiskDescriptor, HostError, HostErrorKind, HostResult, MemoryHost, PublishHandle,
};
pub use queue::{HwQueue, QueueSet, QueueSlot};
pub use registry::DeviceRegistry;
pub use request::{Completion, FsOp, Outcome, Request, RequestKind, RequestStatus};
pub use tags::{Tag, TagPool, TagSet, TagSetAllocator};
pub use workers::{PendingCompletion, QueueWorkers};
