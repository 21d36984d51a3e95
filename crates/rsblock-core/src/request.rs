use crate::config::SECTOR_SHIFT;
use std::fmt;

/// Filesystem-originated block operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsOp {
    Read,
    Write,
    Flush,
    Discard,
}

/// What a request asks of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Regular I/O addressed in 512-byte sectors.
    Filesystem {
        op: FsOp,
        sector: u64,
        num_sectors: u32,
    },
    /// Vendor or diagnostic command the device does not service.
    Passthrough { opcode: u32 },
}

impl RequestKind {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, RequestKind::Passthrough { .. })
    }
}

/// A command submitted against an active device.
#[derive(Clone, Debug)]
pub struct Request {
    kind: RequestKind,
    payload: Vec<u8>,
    queue_hint: Option<u16>,
}

impl Request {
    pub fn new(kind: RequestKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            queue_hint: None,
        }
    }

    /// Read `num_sectors` starting at `sector` into a fresh buffer.
    pub fn read(sector: u64, num_sectors: u32) -> Self {
        let len = (num_sectors as usize) << SECTOR_SHIFT;
        Self::new(
            RequestKind::Filesystem {
                op: FsOp::Read,
                sector,
                num_sectors,
            },
            vec![0u8; len],
        )
    }

    /// Write `data` starting at `sector`. The sector count follows the
    /// buffer length; a partial trailing sector fails at dispatch.
    pub fn write(sector: u64, data: Vec<u8>) -> Self {
        let num_sectors = data.len().div_ceil(1 << SECTOR_SHIFT) as u32;
        Self::new(
            RequestKind::Filesystem {
                op: FsOp::Write,
                sector,
                num_sectors,
            },
            data,
        )
    }

    pub fn flush() -> Self {
        Self::new(
            RequestKind::Filesystem {
                op: FsOp::Flush,
                sector: 0,
                num_sectors: 0,
            },
            Vec::new(),
        )
    }

    pub fn discard(sector: u64, num_sectors: u32) -> Self {
        Self::new(
            RequestKind::Filesystem {
                op: FsOp::Discard,
                sector,
                num_sectors,
            },
            Vec::new(),
        )
    }

    pub fn passthrough(opcode: u32, payload: Vec<u8>) -> Self {
        Self::new(RequestKind::Passthrough { opcode }, payload)
    }

    /// Pin the request to a hardware queue instead of routing by thread.
    pub fn with_queue_hint(mut self, queue_id: u16) -> Self {
        self.queue_hint = Some(queue_id);
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn queue_hint(&self) -> Option<u16> {
        self.queue_hint
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn into_parts(self) -> (RequestKind, Vec<u8>) {
        (self.kind, self.payload)
    }
}

/// Terminal result of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    IoError,
}

/// Where a request is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Submitted,
    Started,
    Completed(Outcome),
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Submitted => f.write_str("submitted"),
            RequestStatus::Started => f.write_str("started"),
            RequestStatus::Completed(Outcome::Ok) => f.write_str("completed(ok)"),
            RequestStatus::Completed(Outcome::IoError) => f.write_str("completed(io_error)"),
        }
    }
}

/// Completion record handed back by [`crate::RequestDispatcher::submit`].
#[derive(Debug)]
pub struct Completion {
    pub(crate) queue_id: u16,
    pub(crate) tag: Option<u16>,
    pub(crate) outcome: Outcome,
    pub(crate) payload: Vec<u8>,
}

impl Completion {
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == Outcome::Ok
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    /// Tag the request held. `None` for requests rejected before a tag was taken.
    pub fn tag(&self) -> Option<u16> {
        self.tag
    }

    /// The request buffer; holds the data for completed reads.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
