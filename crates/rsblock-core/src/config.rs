use crate::{BlkError, BlkErrorKind, BlkResult};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Physical sector size. Every sector address in the core is in these units.
pub const SECTOR_SIZE: u32 = 512;
pub const SECTOR_SHIFT: u32 = 9;

/// Upper bound on tags per hardware queue.
pub const MAX_QUEUE_DEPTH: u16 = 4096;
/// Largest logical block size a disk may advertise.
pub const MAX_LOGICAL_BLOCK_SIZE: u32 = 64 * 1024;

bitflags! {
    /// Behavioural options attached to a tag set.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TagSetFlags: u32 {
        /// Adjacent commands may be merged before dispatch.
        const SHOULD_MERGE = 1 << 0;
        /// The dispatch path may sleep inside the backend.
        const BLOCKING = 1 << 1;
        /// Bypass the host I/O scheduler.
        const NO_SCHED = 1 << 2;
    }
}

/// Shape of the queueing resources requested for one disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub hw_queue_count: u16,
    pub queue_depth: u16,
    #[serde(default)]
    pub flags: TagSetFlags,
    #[serde(default)]
    pub numa_affinity: Option<u32>,
}

impl QueueConfig {
    pub fn new(hw_queue_count: u16, queue_depth: u16) -> Self {
        Self {
            hw_queue_count,
            queue_depth,
            flags: TagSetFlags::empty(),
            numa_affinity: None,
        }
    }

    pub fn with_flags(mut self, flags: TagSetFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_numa_affinity(mut self, node: u32) -> Self {
        self.numa_affinity = Some(node);
        self
    }

    /// Total number of tags this configuration asks for.
    pub fn total_tags(&self) -> usize {
        self.hw_queue_count as usize * self.queue_depth as usize
    }

    pub fn validate(&self) -> BlkResult<()> {
        if self.hw_queue_count == 0 {
            return Err(BlkError::with_message(
                BlkErrorKind::InvalidConfig,
                "hw_queue_count must be non-zero",
            ));
        }
        if self.queue_depth == 0 {
            return Err(BlkError::with_message(
                BlkErrorKind::InvalidConfig,
                "queue_depth must be non-zero",
            ));
        }
        if self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(BlkError::with_message(
                BlkErrorKind::InvalidConfig,
                format!(
                    "queue_depth {} exceeds limit {MAX_QUEUE_DEPTH}",
                    self.queue_depth
                ),
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(1, 128)
    }
}

/// Geometry and queueing parameters for a disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub capacity_sectors: u64,
    #[serde(default = "default_logical_block_size")]
    pub logical_block_size: u32,
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_logical_block_size() -> u32 {
    SECTOR_SIZE
}

impl DiskConfig {
    pub fn new(capacity_sectors: u64, logical_block_size: u32, queue: QueueConfig) -> Self {
        Self {
            capacity_sectors,
            logical_block_size,
            queue,
        }
    }

    /// Capacity in bytes, or `None` if it does not fit in a `u64`.
    pub fn capacity_bytes(&self) -> Option<u64> {
        self.capacity_sectors.checked_mul(SECTOR_SIZE as u64)
    }

    /// Checks geometry only. Queue parameters are checked by the tag allocator.
    pub fn validate_geometry(&self) -> BlkResult<()> {
        let lbs = self.logical_block_size;
        if lbs < SECTOR_SIZE || lbs % SECTOR_SIZE != 0 {
            return Err(BlkError::with_message(
                BlkErrorKind::InvalidConfig,
                format!("logical block size {lbs} must be a multiple of {SECTOR_SIZE}"),
            ));
        }
        if !lbs.is_power_of_two() || lbs > MAX_LOGICAL_BLOCK_SIZE {
            return Err(BlkError::with_message(
                BlkErrorKind::InvalidConfig,
                format!(
                    "logical block size {lbs} must be a power of two no larger than {MAX_LOGICAL_BLOCK_SIZE}"
                ),
            ));
        }
        if self.capacity_bytes().is_none() {
            return Err(BlkError::with_message(
                BlkErrorKind::InvalidConfig,
                "device capacity overflow",
            ));
        }
        let sectors_per_block = (lbs / SECTOR_SIZE) as u64;
        if self.capacity_sectors % sectors_per_block != 0 {
            return Err(BlkError::with_message(
                BlkErrorKind::InvalidConfig,
                "capacity must be a whole number of logical blocks",
            ));
        }
        Ok(())
    }
}

/// Process-wide limits for a registry and its tag allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Maximum number of live registrations.
    pub max_devices: usize,
    /// Total tags the allocator may hand out across all tag sets.
    pub tag_budget: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_devices: 16,
            tag_budget: 64 * 1024,
        }
    }
}
