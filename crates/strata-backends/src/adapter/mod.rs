//! Device adapter trait and shared types

mod traits;
mod types;

pub use traits::DeviceAdapter;
pub use types::{
    BlockDim, DeviceAdapterId, GridDim, Id, Id3, IdComponent, LaunchConfig, MemorySpace, TransferDirection, Value,
};
