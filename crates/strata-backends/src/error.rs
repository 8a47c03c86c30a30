//! Error types for device adapter operations

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Result type for device adapter operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors raised by device adapters, their memory and their schedulers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// A primitive or a scheduled kernel failed while running on a device.
    ///
    /// Kernel-raised messages from the error buffer, panics caught at the
    /// primitive boundary and backend failures all surface as this variant.
    #[error("execution error: {0}")]
    Execution(String),

    /// Invalid argument detected before any work was started
    #[error("bad value: {0}")]
    BadValue(String),

    /// The requested device adapter cannot run here
    #[error("bad device: {0}")]
    BadDevice(String),

    /// Device memory capacity exceeded
    #[error("out of device memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Launch geometry the device cannot represent
    #[error("invalid launch configuration: {0}")]
    InvalidLaunchConfig(String),

    /// Runtime configuration could not be parsed or validated
    #[error("invalid runtime configuration: {0}")]
    Config(String),
}

impl DeviceError {
    /// Create an execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a bad value error
    pub fn bad_value(msg: impl Into<String>) -> Self {
        Self::BadValue(msg.into())
    }

    /// Create a bad device error
    pub fn bad_device(msg: impl Into<String>) -> Self {
        Self::BadDevice(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    pub fn is_bad_device(&self) -> bool {
        matches!(self, Self::BadDevice(_))
    }
}

/// Access to an underlying [`DeviceError`] from a wrapping error type.
///
/// The runtime registry uses this to decide whether a failure means "try the
/// next device" (only [`DeviceError::BadDevice`]) or must be returned as is.
pub trait AsDeviceError {
    fn as_device_error(&self) -> Option<&DeviceError>;
}

impl AsDeviceError for DeviceError {
    fn as_device_error(&self) -> Option<&DeviceError> {
        Some(self)
    }
}

/// Run `f`, converting a panic into [`DeviceError::Execution`].
///
/// Every primitive and every schedule call goes through this, so callers
/// only ever observe the single execution error kind.
pub fn catch_execution<R>(operation: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(operation = operation, message = %message, "device primitive panicked");
            Err(DeviceError::Execution(format!("{operation}: {message}")))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
