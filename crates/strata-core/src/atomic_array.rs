//! Atomic add and compare-and-swap on array elements shared between kernel
//! invocations.

use std::mem;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use strata_backends::{DeviceAdapter, Id, Value, WritePortal};

use crate::array_handle::ArrayHandle;
use crate::error::{Error, Result};

mod sealed {
    pub trait Sealed {}
}

/// Element types with hardware atomic operations (32- and 64-bit integers)
pub trait AtomicValue: Value + sealed::Sealed {
    /// Whether elements of `Self` are aligned for the matching atomic type.
    const ATOMIC_ALIGNED: bool;

    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes and only accessed atomically
    /// for the duration of the call.
    #[doc(hidden)]
    unsafe fn fetch_add(ptr: *mut Self, value: Self) -> Self;

    /// # Safety
    ///
    /// As for [`AtomicValue::fetch_add`].
    #[doc(hidden)]
    unsafe fn compare_exchange(ptr: *mut Self, new: Self, expected: Self) -> Self;

    /// # Safety
    ///
    /// As for [`AtomicValue::fetch_add`].
    #[doc(hidden)]
    unsafe fn load(ptr: *mut Self) -> Self;
}

macro_rules! impl_atomic_value {
    ($($ty:ty => $atomic:ty),+ $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl AtomicValue for $ty {
                const ATOMIC_ALIGNED: bool = mem::align_of::<$ty>() == mem::align_of::<$atomic>();

                unsafe fn fetch_add(ptr: *mut Self, value: Self) -> Self {
                    // SAFETY: forwarded from the caller; alignment checked in `AtomicArray::new`
                    unsafe { <$atomic>::from_ptr(ptr) }.fetch_add(value, Ordering::AcqRel)
                }

                unsafe fn compare_exchange(ptr: *mut Self, new: Self, expected: Self) -> Self {
                    // SAFETY: as above
                    let atomic = unsafe { <$atomic>::from_ptr(ptr) };
                    match atomic.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(previous) | Err(previous) => previous,
                    }
                }

                unsafe fn load(ptr: *mut Self) -> Self {
                    // SAFETY: as above
                    unsafe { <$atomic>::from_ptr(ptr) }.load(Ordering::Acquire)
                }
            }
        )+
    };
}

impl_atomic_value!(i32 => AtomicI32, i64 => AtomicI64, u32 => AtomicU32, u64 => AtomicU64);

/// Atomic view over an [`ArrayHandle`] prepared in place on one device.
///
/// Addition wraps on overflow. There is no ordering between different
/// indices; operations on the same index never lose updates.
pub struct AtomicArray<T: AtomicValue> {
    portal: WritePortal<T>,
}

impl<T: AtomicValue> AtomicArray<T> {
    pub fn new<D: DeviceAdapter>(handle: &ArrayHandle<T>, device: &D) -> Result<Self> {
        if !T::ATOMIC_ALIGNED {
            return Err(Error::bad_value(format!(
                "{} is not aligned for atomic access on this target",
                std::any::type_name::<T>()
            )));
        }
        Ok(Self {
            portal: handle.prepare_for_in_place(device)?,
        })
    }

    pub fn len(&self) -> Id {
        self.portal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.portal.is_empty()
    }

    /// Add `value` to element `index`, returning the previous value.
    #[inline]
    pub fn add(&self, index: Id, value: T) -> T {
        let ptr = self.portal.cell_ptr(index);
        // SAFETY: `cell_ptr` checked the index; elements of an atomic array
        // are only touched through these methods while kernels run.
        unsafe { T::fetch_add(ptr, value) }
    }

    /// Store `new` at `index` if it currently holds `expected`.
    ///
    /// Returns the value observed before the operation; the swap happened
    /// iff that equals `expected`.
    #[inline]
    pub fn compare_and_swap(&self, index: Id, new: T, expected: T) -> T {
        let ptr = self.portal.cell_ptr(index);
        // SAFETY: see `add`
        unsafe { T::compare_exchange(ptr, new, expected) }
    }

    #[inline]
    pub fn get(&self, index: Id) -> T {
        let ptr = self.portal.cell_ptr(index);
        // SAFETY: see `add`
        unsafe { T::load(ptr) }
    }
}
