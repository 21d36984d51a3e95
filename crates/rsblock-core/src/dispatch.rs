use crate::backend::Backend;
use crate::config::SECTOR_SHIFT;
use crate::disk::{DeviceId, DiskGeometry, DiskLifecycleManager};
use crate::metrics;
use crate::queue::QueueSlot;
use crate::registry::DeviceRegistry;
use crate::request::{Completion, FsOp, Outcome, Request, RequestKind, RequestStatus};
use crate::{BlkError, BlkErrorKind, BlkResult};
use std::sync::Arc;
use std::time::Instant;
use tracing::{trace, warn};

/// Routes requests to registered devices and completes them.
#[derive(Clone, Debug)]
pub struct RequestDispatcher {
    registry: Arc<DeviceRegistry>,
}

impl RequestDispatcher {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Submit `request` to device `id` and wait for its completion.
    ///
    /// Fails with `NotFound` for unknown devices and `DeviceNotActive` unless
    /// the device is `Active`, and with `DeviceBusy` when the chosen queue
    /// has no free tag. Backend failures are not errors here: they come
    /// back as a completion with [`Outcome::IoError`].
    pub fn submit(&self, id: DeviceId, request: Request) -> BlkResult<Completion> {
        let disk = self.registry.disk(id)?;
        disk.submit(request)
    }
}

/// A request that holds a tag and has not completed yet.
///
/// Completing consumes it, so a request cannot complete twice.
struct StartedRequest<'a> {
    dev_id: DeviceId,
    slot: QueueSlot<'a>,
    payload: Vec<u8>,
    started_at: Instant,
}

impl StartedRequest<'_> {
    fn complete(self, outcome: Outcome) -> Completion {
        let ok = outcome == Outcome::Ok;
        metrics::observe_request(
            self.dev_id.raw(),
            self.slot.queue_id(),
            self.payload.len(),
            ok,
            self.started_at.elapsed(),
        );
        trace!(
            dev_id = self.dev_id.raw(),
            queue_id = self.slot.queue_id(),
            tag = self.slot.tag(),
            status = %RequestStatus::Completed(outcome),
            "request completed"
        );
        Completion {
            queue_id: self.slot.queue_id(),
            tag: Some(self.slot.tag()),
            outcome,
            payload: self.payload,
        }
    }
}

impl DiskLifecycleManager {
    /// Submit a request directly to this disk.
    pub fn submit(&self, request: Request) -> BlkResult<Completion> {
        let _admission = self.admit()?;
        let resources = self.read_resources();
        let Some(resources) = resources.as_ref() else {
            return Err(BlkError::with_message(
                BlkErrorKind::DeviceNotActive,
                format!("device {} has no queues", self.id()),
            ));
        };
        let queue_id = resources.queues.map_queue(request.queue_hint());
        let (kind, payload) = request.into_parts();
        trace!(
            dev_id = self.id().raw(),
            queue_id,
            kind = ?kind,
            status = %RequestStatus::Submitted,
            "request submitted"
        );

        let (op, sector, num_sectors) = match kind {
            RequestKind::Passthrough { opcode } => {
                trace!(dev_id = self.id().raw(), opcode, "passthrough request rejected");
                metrics::record_passthrough_rejected(self.id().raw());
                return Ok(Completion {
                    queue_id,
                    tag: None,
                    outcome: Outcome::IoError,
                    payload,
                });
            }
            RequestKind::Filesystem {
                op,
                sector,
                num_sectors,
            } => (op, sector, num_sectors),
        };

        let slot = resources.queues.start_request(queue_id)?;
        let mut started = StartedRequest {
            dev_id: self.id(),
            slot,
            payload,
            started_at: Instant::now(),
        };
        trace!(
            dev_id = self.id().raw(),
            queue_id,
            tag = started.slot.tag(),
            status = %RequestStatus::Started,
            op = ?op,
            sector,
            num_sectors,
            "request started"
        );

        let outcome = match check_range(&resources.geometry, op, sector, num_sectors, &started.payload)
        {
            Ok(()) => run_backend(
                resources.backend.as_ref(),
                op,
                sector,
                num_sectors,
                &mut started.payload,
            ),
            Err(reason) => {
                warn!(
                    dev_id = self.id().raw(),
                    queue_id,
                    op = ?op,
                    sector,
                    num_sectors,
                    reason,
                    "rejecting malformed request"
                );
                Outcome::IoError
            }
        };
        if outcome == Outcome::IoError {
            trace!(dev_id = self.id().raw(), queue_id, "request failed");
        }
        Ok(started.complete(outcome))
    }
}

/// Validate a filesystem request against the disk geometry.
fn check_range(
    geometry: &DiskGeometry,
    op: FsOp,
    sector: u64,
    num_sectors: u32,
    payload: &[u8],
) -> Result<(), &'static str> {
    if op == FsOp::Flush {
        return Ok(());
    }
    if matches!(op, FsOp::Read | FsOp::Write)
        && payload.len() != (num_sectors as usize) << SECTOR_SHIFT
    {
        return Err("payload length does not match sector count");
    }
    let end = sector
        .checked_add(num_sectors as u64)
        .ok_or("sector overflow")?;
    if end > geometry.capacity_sectors {
        return Err("request past end of device");
    }
    let per_block = geometry.sectors_per_block();
    if sector % per_block != 0 || num_sectors as u64 % per_block != 0 {
        return Err("request not aligned to logical block size");
    }
    Ok(())
}

fn run_backend(
    backend: &dyn Backend,
    op: FsOp,
    sector: u64,
    num_sectors: u32,
    payload: &mut [u8],
) -> Outcome {
    let result = match op {
        FsOp::Read => backend.read(sector, payload),
        FsOp::Write => backend.write(sector, payload),
        FsOp::Flush => backend.flush(),
        FsOp::Discard => backend.discard(sector, num_sectors),
    };
    match result {
        Ok(()) => Outcome::Ok,
        Err(err) => {
            warn!(op = ?op, sector, num_sectors, error = %err, "backend request failed");
            Outcome::IoError
        }
    }
}
