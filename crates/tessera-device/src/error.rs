//! Error types for device platform operations

/// Result type for device platform operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors raised by the device platform layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The executor's memory capacity is exhausted
    #[error("out of memory on device {ordinal}: requested {requested} bytes, {available} bytes available")]
    OutOfMemory {
        ordinal: usize,
        requested: usize,
        available: usize,
    },

    /// No executor exists for the requested ordinal
    #[error("invalid device ordinal {ordinal}: platform has {device_count} device(s)")]
    InvalidDeviceOrdinal { ordinal: usize, device_count: usize },

    /// A device memory handle that is unknown, freed, or of the wrong size
    #[error("invalid device memory: {0}")]
    InvalidMemory(String),

    /// Two shapes that were required to agree do not
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Caller-supplied argument is malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Stream-level failure (closed stream, failed dependency)
    #[error("stream error: {0}")]
    Stream(String),

    /// Device-side program failure
    #[error("execution failed: {0}")]
    Execution(String),

    /// Broken internal invariant
    #[error("internal error: {0}")]
    Internal(String),
}

impl DeviceError {
    pub(crate) fn shape_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_message() {
        let err = DeviceError::OutOfMemory {
            ordinal: 1,
            requested: 4096,
            available: 128,
        };
        let msg = err.to_string();
        assert!(msg.contains("device 1"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("128"));
    }

    #[test]
    fn test_shape_mismatch_helper() {
        let err = DeviceError::shape_mismatch("f32[2]", "s32[2]");
        assert_eq!(err.to_string(), "shape mismatch: expected f32[2], got s32[2]");
    }
}
