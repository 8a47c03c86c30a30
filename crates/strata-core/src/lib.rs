//! Control-side layer of the strata runtime
//!
//! This crate provides:
//! - **ArrayHandle**: arrays with lazily synchronised control and execution copies
//! - **Algorithm**: the parallel primitives over handles on one device adapter
//! - **AtomicArray**: atomic add / compare-and-swap for kernels
//! - **ReverseConnectivityBuilder**: point-to-cell connectivity via histogram, scan and scatter
//!
//! # Usage
//!
//! ```rust
//! use strata_core::{Algorithm, ArrayHandle};
//! use strata_backends::ThreadedAdapter;
//!
//! # fn main() -> strata_core::Result<()> {
//! let algorithm = Algorithm::new(ThreadedAdapter::new());
//! let keys = ArrayHandle::from_vec(vec![2_i32, 0, 1, 0]);
//! let values = ArrayHandle::from_vec(vec![20_i64, 1, 10, 2]);
//! algorithm.sort_by_key(&keys, &values)?;
//!
//! let unique_keys = ArrayHandle::new();
//! let sums = ArrayHandle::new();
//! let runs = algorithm.reduce_by_key(&keys, &values, &unique_keys, &sums, |a, b| a + b)?;
//! assert_eq!(runs, 3);
//! assert_eq!(unique_keys.to_vec()?, vec![0, 1, 2]);
//! assert_eq!(sums.to_vec()?, vec![3, 10, 20]);
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod array_handle;
pub mod atomic_array;
pub mod error;
pub mod reverse_connectivity;

pub use algorithm::Algorithm;
pub use array_handle::{ArrayHandle, Residency};
pub use atomic_array::{AtomicArray, AtomicValue};
pub use error::{Error, Result};
pub use reverse_connectivity::{
    CellIdMap, ConnectivityIndexMap, ExplicitCells, LegacyCellArray, PassThrough, ReverseConnectivity,
    ReverseConnectivityBuilder, SingleTypeCells,
};

pub use strata_backends::{DeviceAdapter, DeviceAdapterId, Id, Id3, IdComponent, Value};
