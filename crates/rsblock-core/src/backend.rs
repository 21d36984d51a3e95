use crate::config::{SECTOR_SHIFT, SECTOR_SIZE};
use anyhow::{Context, Result, ensure};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

pub type BackendResult<T> = core::result::Result<T, BackendError>;

/// Failure category for backend operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendErrorKind {
    InvalidInput,
    OutOfRange,
    Io,
    Unsupported,
}

/// Error surfaced by [`Backend`] implementations.
#[derive(Clone, Debug)]
pub struct BackendError {
    kind: BackendErrorKind,
    message: Option<String>,
}

impl BackendError {
    pub const fn new(kind: BackendErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> BackendErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::with_message(BackendErrorKind::Io, err.to_string())
    }
}

/// The storage medium behind a disk.
///
/// Addresses are 512-byte sectors regardless of the disk's logical block
/// size, and buffers are whole sectors. Calls may arrive concurrently from
/// every hardware queue.
pub trait Backend: Send + Sync {
    /// Capacity in sectors.
    fn capacity_sectors(&self) -> u64;

    fn read(&self, sector: u64, buf: &mut [u8]) -> BackendResult<()>;

    fn write(&self, sector: u64, buf: &[u8]) -> BackendResult<()>;

    fn flush(&self) -> BackendResult<()> {
        Ok(())
    }

    fn discard(&self, _sector: u64, _num_sectors: u32) -> BackendResult<()> {
        Ok(())
    }
}

fn byte_range(capacity_sectors: u64, sector: u64, len: usize) -> BackendResult<(u64, u64)> {
    if len % SECTOR_SIZE as usize != 0 {
        return Err(BackendError::with_message(
            BackendErrorKind::InvalidInput,
            "buffer length must align to sector size",
        ));
    }
    let sectors = (len >> SECTOR_SHIFT) as u64;
    let end = sector.checked_add(sectors).ok_or_else(|| {
        BackendError::with_message(BackendErrorKind::OutOfRange, "sector overflow")
    })?;
    if end > capacity_sectors {
        return Err(BackendError::with_message(
            BackendErrorKind::OutOfRange,
            "request past end of device",
        ));
    }
    Ok((sector << SECTOR_SHIFT, end << SECTOR_SHIFT))
}

/// Zero-initialised in-memory medium.
pub struct RamBackend {
    data: RwLock<Vec<u8>>,
    sectors: u64,
}

impl RamBackend {
    pub fn new(capacity_sectors: u64) -> Result<Self> {
        let bytes = capacity_sectors
            .checked_mul(SECTOR_SIZE as u64)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .context("ram backend size overflow")?;
        Ok(Self {
            data: RwLock::new(vec![0u8; bytes]),
            sectors: capacity_sectors,
        })
    }
}

impl Backend for RamBackend {
    fn capacity_sectors(&self) -> u64 {
        self.sectors
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> BackendResult<()> {
        let (start, end) = byte_range(self.sectors, sector, buf.len())?;
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&data[start as usize..end as usize]);
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8]) -> BackendResult<()> {
        let (start, end) = byte_range(self.sectors, sector, buf.len())?;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data[start as usize..end as usize].copy_from_slice(buf);
        Ok(())
    }

    fn discard(&self, sector: u64, num_sectors: u32) -> BackendResult<()> {
        let len = (num_sectors as usize) << SECTOR_SHIFT;
        let (start, end) = byte_range(self.sectors, sector, len)?;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data[start as usize..end as usize].fill(0);
        Ok(())
    }
}

/// Medium backed by a regular file, addressed with positional I/O.
pub struct FileBackend {
    file: File,
    sectors: u64,
}

impl FileBackend {
    /// Open (creating if needed) `path` and size it to `capacity_sectors`.
    pub fn open(path: impl AsRef<Path>, capacity_sectors: u64) -> Result<Self> {
        let path = path.as_ref();
        let bytes = capacity_sectors
            .checked_mul(SECTOR_SIZE as u64)
            .context("file backend size overflow")?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        ensure!(
            len <= bytes,
            "{} is {len} bytes, larger than the configured capacity {bytes}",
            path.display()
        );
        if len < bytes {
            file.set_len(bytes)
                .with_context(|| format!("extend {} to {bytes} bytes", path.display()))?;
        }
        debug!(path = %path.display(), bytes, "opened file backend");
        Ok(Self {
            file,
            sectors: capacity_sectors,
        })
    }
}

impl Backend for FileBackend {
    fn capacity_sectors(&self) -> u64 {
        self.sectors
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> BackendResult<()> {
        let (offset, _) = byte_range(self.sectors, sector, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8]) -> BackendResult<()> {
        let (offset, _) = byte_range(self.sectors, sector, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn flush(&self) -> BackendResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
