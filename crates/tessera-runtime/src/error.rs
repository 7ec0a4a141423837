//! Error types for runtime operations

use serde::{Deserialize, Serialize};
use tessera_device::DeviceError;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    Allocation,
    Transfer,
    Execution,
    Internal,
}

/// Errors returned by the runtime
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape, device ordinal or replica count mismatch; nothing was mutated
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Device memory exhausted
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Marshaling or host↔device copy failure
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Device-side program failure
    #[error("execution failed: {0}")]
    Execution(String),

    /// Broken internal invariant
    #[error("internal error: {0}")]
    Internal(String),

    /// A replica of a replicated launch failed
    #[error("{source}; while running replica {replica} of a replicated computation (other replicas may have failed as well).")]
    ReplicaFailed {
        replica: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Allocation(_) => ErrorKind::Allocation,
            Error::Transfer(_) => ErrorKind::Transfer,
            Error::Execution(_) => ErrorKind::Execution,
            Error::Internal(_) => ErrorKind::Internal,
            Error::ReplicaFailed { source, .. } => source.kind(),
        }
    }

    /// Replica index of an annotated replica failure.
    pub fn replica(&self) -> Option<usize> {
        match self {
            Error::ReplicaFailed { replica, .. } => Some(*replica),
            _ => None,
        }
    }

    /// Map a device error raised while copying between host and device.
    pub(crate) fn transfer(error: DeviceError) -> Self {
        match error {
            DeviceError::OutOfMemory { .. } => Error::Allocation(error.to_string()),
            DeviceError::Execution(msg) => Error::Execution(msg),
            other => Error::Transfer(other.to_string()),
        }
    }
}

impl From<DeviceError> for Error {
    fn from(error: DeviceError) -> Self {
        match error {
            DeviceError::OutOfMemory { .. } => Error::Allocation(error.to_string()),
            DeviceError::InvalidArgument(msg) => Error::InvalidArgument(msg),
            DeviceError::ShapeMismatch { .. } | DeviceError::InvalidDeviceOrdinal { .. } => {
                Error::InvalidArgument(error.to_string())
            }
            DeviceError::Execution(msg) => Error::Execution(msg),
            DeviceError::InvalidMemory(_) | DeviceError::Stream(_) | DeviceError::Internal(_) => {
                Error::Internal(error.to_string())
            }
        }
    }
}
