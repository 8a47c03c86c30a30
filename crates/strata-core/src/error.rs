//! Error types for control-side operations

use strata_backends::{AsDeviceError, DeviceError};

/// Result type for array handle and algorithm operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Invalid argument detected before any work was scheduled
    #[error("bad value: {0}")]
    BadValue(String),

    /// Failure reported by a device adapter
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl Error {
    pub fn bad_value(msg: impl Into<String>) -> Self {
        Self::BadValue(msg.into())
    }

    /// Whether this is an execution error, including kernel-raised messages.
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Device(err) if err.is_execution())
    }

    /// Kernel or primitive failure message, if this is an execution error.
    pub fn execution_message(&self) -> Option<&str> {
        match self {
            Self::Device(DeviceError::Execution(msg)) => Some(msg),
            _ => None,
        }
    }
}

impl AsDeviceError for Error {
    fn as_device_error(&self) -> Option<&DeviceError> {
        match self {
            Self::Device(err) => Some(err),
            Self::BadValue(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_are_transparent() {
        let err: Error = DeviceError::execution("point 9 out of range").into();
        assert_eq!(err.to_string(), "execution error: point 9 out of range");
        assert!(err.is_execution());
        assert_eq!(err.execution_message(), Some("point 9 out of range"));
        assert!(err.as_device_error().is_some());
    }

    #[test]
    fn bad_value_is_local() {
        let err = Error::bad_value("negative offset");
        assert!(!err.is_execution());
        assert!(err.as_device_error().is_none());
    }
}
