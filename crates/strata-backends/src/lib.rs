//! Device adapters for data-parallel execution
//!
//! This crate provides:
//! - **DeviceAdapter**: allocation, 1-D/3-D scheduling and parallel primitives
//! - **Serial / Threaded / Accelerator**: the three adapter implementations
//! - **Portals**: index accessors handed to kernels
//! - **ErrorMessageBuffer**: first-writer-wins kernel error reporting
//! - **DeviceRegistry**: run-time adapter selection with fallback
//!
//! # Usage
//!
//! ```rust
//! use strata_backends::{DeviceAdapter, SerialAdapter, WritePortal};
//!
//! # fn main() -> Result<(), strata_backends::DeviceError> {
//! let device = SerialAdapter;
//! let squares = WritePortal::new(device.allocate::<i64>(8)?, 8);
//! device.schedule(|i, _| squares.set(i, i * i), 8)?;
//!
//! let total = device.reduce(&squares.as_read(), 0, |a, b| a + b)?;
//! assert_eq!(total, 140);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod adapters;
pub mod config;
pub mod error;
pub mod error_buffer;
pub mod kernel;
pub mod memory;
pub mod portal;
pub mod registry;

pub use adapter::{
    BlockDim, DeviceAdapter, DeviceAdapterId, GridDim, Id, Id3, IdComponent, LaunchConfig, MemorySpace,
    TransferDirection, Value,
};
pub use adapters::{AcceleratorAdapter, AcceleratorStats, SerialAdapter, ThreadedAdapter};
pub use config::{AcceleratorConfig, RuntimeConfig, ThreadedConfig};
pub use error::{catch_execution, AsDeviceError, DeviceError, Result};
pub use error_buffer::{ErrorMessageBuffer, ERROR_BUFFER_CAPACITY};
pub use kernel::{Kernel, Kernel3D};
pub use memory::{transfer, MemoryLedger, MemoryStats, Storage};
pub use portal::{ReadPortal, WritePortal};
pub use registry::{DeviceFunctor, DeviceRegistry};
