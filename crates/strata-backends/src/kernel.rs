//! Per-index kernels ("worklets") accepted by the schedulers.
//!
//! A kernel is invoked once for every index of a 1-D range or every
//! coordinate of a 3-D extent, in no particular order and possibly
//! concurrently. Invocations report failures through the shared
//! [`ErrorMessageBuffer`]; panics are also caught and reported, but are the
//! slower path.

use crate::adapter::{Id, Id3};
use crate::error_buffer::ErrorMessageBuffer;

/// Kernel over a 1-D index space
pub trait Kernel: Sync {
    fn invoke(&self, index: Id, errors: &ErrorMessageBuffer);
}

impl<F> Kernel for F
where
    F: Fn(Id, &ErrorMessageBuffer) + Sync,
{
    #[inline]
    fn invoke(&self, index: Id, errors: &ErrorMessageBuffer) {
        self(index, errors)
    }
}

/// Kernel over a 3-D index space
pub trait Kernel3D: Sync {
    fn invoke(&self, index: Id3, errors: &ErrorMessageBuffer);
}

impl<F> Kernel3D for F
where
    F: Fn(Id3, &ErrorMessageBuffer) + Sync,
{
    #[inline]
    fn invoke(&self, index: Id3, errors: &ErrorMessageBuffer) {
        self(index, errors)
    }
}
