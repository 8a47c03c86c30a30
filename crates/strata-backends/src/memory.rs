//! Buffer storage, device memory accounting and host/device transfers.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use strata_tracing::performance::record_transfer;

use crate::adapter::{MemorySpace, TransferDirection, Value};
use crate::error::{DeviceError, Result};

// ================================================================================================
// Storage
// ================================================================================================

/// A fixed-size buffer of `T` shared between the control side and kernels.
///
/// Elements sit in `UnsafeCell`s so that portals can write through shared
/// references from many kernel invocations at once. The contract is the usual
/// data-parallel one: concurrent invocations may read any element and may
/// write disjoint elements, but two invocations must never write (or write
/// and read) the same element. Shared counters go through atomic arrays
/// built on [`Storage::cell_ptr`] instead.
pub struct Storage<T: Value> {
    cells: Box<[UnsafeCell<T>]>,
    space: MemorySpace,
    ledger: Option<Arc<MemoryLedger>>,
}

unsafe impl<T: Value> Sync for Storage<T> {}

impl<T: Value> Storage<T> {
    /// Zero-filled host storage
    pub fn host_zeroed(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| UnsafeCell::new(T::zeroed())).collect(),
            space: MemorySpace::Host,
            ledger: None,
        }
    }

    /// Host storage taking ownership of `values`
    pub fn from_vec(values: Vec<T>) -> Self {
        Self {
            cells: values.into_iter().map(UnsafeCell::new).collect(),
            space: MemorySpace::Host,
            ledger: None,
        }
    }

    /// Zero-filled storage in `space`, charged against `ledger` until dropped.
    pub fn zeroed_in(len: usize, space: MemorySpace, ledger: Arc<MemoryLedger>) -> Result<Self> {
        ledger.reserve(len * mem::size_of::<T>())?;
        Ok(Self {
            cells: (0..len).map(|_| UnsafeCell::new(T::zeroed())).collect(),
            space,
            ledger: Some(ledger),
        })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn size_in_bytes(&self) -> usize {
        self.cells.len() * mem::size_of::<T>()
    }

    #[inline]
    pub fn get(&self, index: usize) -> T {
        // SAFETY: see the type-level contract on concurrent access
        unsafe { *self.cells[index].get() }
    }

    #[inline]
    pub fn set(&self, index: usize, value: T) {
        // SAFETY: see the type-level contract on concurrent access
        unsafe { *self.cells[index].get() = value }
    }

    /// Raw pointer to one element, for atomic access.
    #[inline]
    pub fn cell_ptr(&self, index: usize) -> *mut T {
        self.cells[index].get()
    }

    pub fn to_vec(&self, len: usize) -> Vec<T> {
        (0..len.min(self.len())).map(|i| self.get(i)).collect()
    }

    fn base_ptr(&self) -> *mut T {
        // UnsafeCell<T> has the same layout as T
        self.cells.as_ptr() as *mut T
    }
}

impl<T: Value> Drop for Storage<T> {
    fn drop(&mut self) {
        if let Some(ledger) = &self.ledger {
            ledger.release(self.size_in_bytes());
        }
    }
}

impl<T: Value> fmt::Debug for Storage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("len", &self.len())
            .field("space", &self.space)
            .finish()
    }
}

/// Copy the first `len` elements of `src` into `dst` across memory spaces.
///
/// The transfer is accounted on whichever side carries a ledger and logged
/// through [`record_transfer`].
pub fn transfer<T: Value>(src: &Storage<T>, dst: &Storage<T>, len: usize, direction: TransferDirection) -> Result<()> {
    if len > src.len() || len > dst.len() {
        return Err(DeviceError::bad_value(format!(
            "transfer of {len} elements exceeds buffers ({} -> {})",
            src.len(),
            dst.len()
        )));
    }
    if ptr::eq(src, dst) || len == 0 {
        return Ok(());
    }

    let start = Instant::now();
    // SAFETY: distinct allocations, both at least `len` long. The caller
    // holds the owning handle's lock so no kernel is touching either side.
    unsafe {
        ptr::copy_nonoverlapping(src.base_ptr() as *const T, dst.base_ptr(), len);
    }
    let bytes = len * mem::size_of::<T>();

    let ledger = match direction {
        TransferDirection::HostToDevice => dst.ledger.as_ref(),
        TransferDirection::DeviceToHost => src.ledger.as_ref(),
    };
    if let Some(ledger) = ledger {
        ledger.record_transfer(bytes, direction);
    }
    record_transfer(bytes, direction.label(), start.elapsed().as_micros() as u64);
    Ok(())
}

// ================================================================================================
// Ledger
// ================================================================================================

/// Byte accounting for one device memory space.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    capacity: Option<usize>,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicU64,
    host_to_device: AtomicU64,
    device_to_host: AtomicU64,
}

/// Point-in-time copy of a [`MemoryLedger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub capacity: Option<usize>,
    pub bytes_in_use: usize,
    pub peak_bytes: usize,
    pub allocations: u64,
    pub host_to_device_bytes: u64,
    pub device_to_host_bytes: u64,
}

impl MemoryLedger {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Claim `bytes`, failing with [`DeviceError::OutOfMemory`] past capacity.
    pub fn reserve(&self, bytes: usize) -> Result<()> {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let next = current + bytes;
            if let Some(capacity) = self.capacity {
                if next > capacity {
                    return Err(DeviceError::OutOfMemory {
                        requested: bytes,
                        available: capacity.saturating_sub(current),
                    });
                }
            }
            match self
                .in_use
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    self.allocations.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn record_transfer(&self, bytes: usize, direction: TransferDirection) {
        let counter = match direction {
            TransferDirection::HostToDevice => &self.host_to_device,
            TransferDirection::DeviceToHost => &self.device_to_host,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            capacity: self.capacity,
            bytes_in_use: self.in_use.load(Ordering::Acquire),
            peak_bytes: self.peak.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            host_to_device_bytes: self.host_to_device.load(Ordering::Relaxed),
            device_to_host_bytes: self.device_to_host.load(Ordering::Relaxed),
        }
    }
}
