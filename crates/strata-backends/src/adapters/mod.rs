//! Device adapter implementations
//!
//! - `general` - Primitives built from `schedule` alone, shared by every adapter
//! - `serial` - Single-threaded reference adapter
//! - `threaded` - Rayon thread-pool adapter
//! - `accelerator` - Block/grid scheduler over its own memory space

pub mod accelerator;
pub mod general;
pub mod serial;
pub mod threaded;

pub use accelerator::{AcceleratorAdapter, AcceleratorStats};
pub use serial::SerialAdapter;
pub use threaded::ThreadedAdapter;
