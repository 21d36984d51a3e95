use crate::backend::BackendError;
use crate::host::HostError;
use std::fmt;

/// Failure categories surfaced by the dispatch and lifecycle core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlkErrorKind {
    /// A live registration already uses the requested name.
    AlreadyRegistered,
    /// No identifiers remain for a new registration.
    ResourceExhausted,
    /// The device identifier is unknown to the registry.
    NotFound,
    /// The device is in a state that forbids the operation.
    DeviceBusy,
    /// Queue or disk parameters are out of range.
    InvalidConfig,
    /// Tag or queue resources could not be provided.
    AllocationFailed,
    /// Submission against a device that is not `Active`.
    DeviceNotActive,
    /// Backend or medium failure.
    IoError,
    /// The host block layer rejected a call.
    Host,
}

/// Error returned by registry, lifecycle and dispatch operations.
#[derive(Clone, Debug)]
pub struct BlkError {
    kind: BlkErrorKind,
    message: Option<String>,
}

impl BlkError {
    pub const fn new(kind: BlkErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: BlkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> BlkErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for BlkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for BlkError {}

impl From<HostError> for BlkError {
    fn from(err: HostError) -> Self {
        BlkError::with_message(BlkErrorKind::Host, err.to_string())
    }
}

impl From<BackendError> for BlkError {
    fn from(err: BackendError) -> Self {
        BlkError::with_message(BlkErrorKind::IoError, err.to_string())
    }
}

pub type BlkResult<T> = core::result::Result<T, BlkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostErrorKind;

    #[test]
    fn display_includes_kind_and_message() {
        let err = BlkError::with_message(BlkErrorKind::DeviceBusy, "device 7 is active");
        assert_eq!(err.to_string(), "DeviceBusy: device 7 is active");
        assert_eq!(BlkError::new(BlkErrorKind::NotFound).to_string(), "NotFound");
    }

    #[test]
    fn host_errors_map_to_host_kind() {
        let err: BlkError = HostError::new(HostErrorKind::Busy).into();
        assert_eq!(err.kind(), BlkErrorKind::Host);
        assert_eq!(err.message(), Some("Busy"));
    }
}
