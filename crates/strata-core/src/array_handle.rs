//! Typed arrays with a control-side buffer and one cached execution buffer.
//!
//! ```text
//!   ArrayHandle<T> ──clone──► shares the same state (not a deep copy)
//!        │
//!        ├── control:   host Storage<T>          (authoritative when valid)
//!        └── execution: Storage<T> on a device   (cached, valid or stale)
//! ```
//!
//! Host adapters (serial, threaded) read and write the control buffer
//! directly. A device adapter gets its own buffer, filled from the control
//! side on first input use and copied back lazily when the host reads.
//!
//! `prepare_for_output` always hands out fresh storage, so portals obtained
//! earlier keep observing the old contents. This is what makes
//! `algorithm.scan_inclusive(&a, &a)` and similar aliased calls safe.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_backends::{
    transfer, DeviceAdapter, DeviceAdapterId, Id, MemorySpace, ReadPortal, Storage, TransferDirection, Value,
    WritePortal,
};

use crate::error::{Error, Result};

struct ExecutionSlot<T: Value> {
    device: DeviceAdapterId,
    space: MemorySpace,
    storage: Arc<Storage<T>>,
    valid: bool,
}

struct HandleState<T: Value> {
    len: usize,
    /// Always `Some` while `control_valid`
    control: Option<Arc<Storage<T>>>,
    control_valid: bool,
    execution: Option<ExecutionSlot<T>>,
}

impl<T: Value> HandleState<T> {
    fn with_control(storage: Storage<T>, len: usize) -> Self {
        Self {
            len,
            control: Some(Arc::new(storage)),
            control_valid: true,
            execution: None,
        }
    }

    /// Make the control buffer valid, copying back from the device if needed.
    fn sync_control(&mut self) -> Result<Arc<Storage<T>>> {
        if self.control_valid {
            if let Some(control) = &self.control {
                return Ok(Arc::clone(control));
            }
        }
        let slot = self
            .execution
            .as_ref()
            .filter(|slot| slot.valid)
            .ok_or_else(|| Error::bad_value("array handle holds no valid data"))?;
        let host = Arc::new(Storage::host_zeroed(self.len));
        transfer(&slot.storage, &host, self.len, TransferDirection::DeviceToHost)?;
        tracing::debug!(len = self.len, from = %slot.space, "synchronized control array");
        self.control = Some(Arc::clone(&host));
        self.control_valid = true;
        Ok(host)
    }

    /// Valid execution storage on `device`, uploading from control if needed.
    fn sync_execution<D: DeviceAdapter>(&mut self, device: &D) -> Result<Arc<Storage<T>>> {
        let space = device.memory_space();
        if let Some(slot) = &self.execution {
            if slot.space == space && slot.valid {
                return Ok(Arc::clone(&slot.storage));
            }
        }
        let control = self.sync_control()?;
        // refresh a stale buffer in place when it is still large enough
        if let Some(slot) = self.execution.as_mut() {
            if slot.space == space && slot.storage.len() >= self.len {
                transfer(&control, &slot.storage, self.len, TransferDirection::HostToDevice)?;
                slot.valid = true;
                return Ok(Arc::clone(&slot.storage));
            }
        }
        let storage = device.upload(&control, self.len)?;
        self.execution = Some(ExecutionSlot {
            device: device.id(),
            space,
            storage: Arc::clone(&storage),
            valid: true,
        });
        Ok(storage)
    }

    fn invalidate_execution(&mut self) {
        if let Some(slot) = self.execution.as_mut() {
            slot.valid = false;
        }
    }

    /// Make `storage` the only valid copy.
    fn install<D: DeviceAdapter>(&mut self, storage: Arc<Storage<T>>, len: usize, device: &D) {
        self.len = len;
        if storage.space().is_host() {
            self.control = Some(storage);
            self.control_valid = true;
            self.execution = None;
        } else {
            self.control = None;
            self.control_valid = false;
            self.execution = Some(ExecutionSlot {
                device: device.id(),
                space: storage.space(),
                storage,
                valid: true,
            });
        }
    }
}

/// Where the data of an [`ArrayHandle`] currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Residency {
    pub control_valid: bool,
    /// Memory space of the cached execution buffer, if any
    pub execution: Option<MemorySpace>,
    pub execution_valid: bool,
}

/// Reference-counted typed array
pub struct ArrayHandle<T: Value> {
    inner: Arc<Mutex<HandleState<T>>>,
}

impl<T: Value> ArrayHandle<T> {
    /// An empty array
    pub fn new() -> Self {
        Self::from_storage(Storage::host_zeroed(0), 0)
    }

    pub fn from_vec(values: Vec<T>) -> Self {
        let len = values.len();
        Self::from_storage(Storage::from_vec(values), len)
    }

    pub fn from_slice(values: &[T]) -> Self {
        Self::from_vec(values.to_vec())
    }

    fn from_storage(storage: Storage<T>, len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HandleState::with_control(storage, len))),
        }
    }

    pub fn len(&self) -> Id {
        self.inner.lock().len as Id
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().len == 0
    }

    /// Resize to `len` zeroed control-side values, dropping all residencies.
    pub fn allocate(&self, len: Id) -> Result<()> {
        let len = checked_len(len)?;
        *self.inner.lock() = HandleState::with_control(Storage::host_zeroed(len), len);
        Ok(())
    }

    /// Truncate the logical length without moving memory.
    pub fn shrink(&self, len: Id) -> Result<()> {
        let len = checked_len(len)?;
        let mut state = self.inner.lock();
        if len > state.len {
            return Err(Error::bad_value(format!(
                "shrink to {len} exceeds current length {}",
                state.len
            )));
        }
        state.len = len;
        Ok(())
    }

    /// Read-only portal on `device`, reusing a valid cached copy.
    #[tracing::instrument(level = "trace", skip_all, fields(device = %device.id()))]
    pub fn prepare_for_input<D: DeviceAdapter>(&self, device: &D) -> Result<ReadPortal<T>> {
        let mut state = self.inner.lock();
        let len = state.len;
        let storage = if device.memory_space().is_host() {
            state.sync_control()?
        } else {
            state.sync_execution(device)?
        };
        Ok(ReadPortal::new(storage, len))
    }

    /// Write portal of `len` fresh values on `device`; every other copy is discarded.
    #[tracing::instrument(level = "trace", skip_all, fields(device = %device.id(), len = len))]
    pub fn prepare_for_output<D: DeviceAdapter>(&self, len: Id, device: &D) -> Result<WritePortal<T>> {
        let len = checked_len(len)?;
        let storage = device.allocate::<T>(len)?;
        self.inner.lock().install(Arc::clone(&storage), len, device);
        Ok(WritePortal::new(storage, len))
    }

    /// Read/write portal on `device`; other copies become stale.
    #[tracing::instrument(level = "trace", skip_all, fields(device = %device.id()))]
    pub fn prepare_for_in_place<D: DeviceAdapter>(&self, device: &D) -> Result<WritePortal<T>> {
        let mut state = self.inner.lock();
        let len = state.len;
        let storage = if device.memory_space().is_host() {
            let control = state.sync_control()?;
            state.invalidate_execution();
            control
        } else {
            let storage = state.sync_execution(device)?;
            state.control_valid = false;
            storage
        };
        Ok(WritePortal::new(storage, len))
    }

    /// Grow to `len` on `device`, keeping the current values at the front.
    pub fn reallocate_preserving<D: DeviceAdapter>(&self, len: Id, device: &D) -> Result<()> {
        let old = self.prepare_for_input(device)?;
        if len < old.len() {
            return Err(Error::bad_value(format!(
                "cannot grow from {} to {len} values",
                old.len()
            )));
        }
        let grown = WritePortal::new(device.allocate::<T>(len as usize)?, len as usize);
        device.copy(&old, &grown)?;
        self.inner.lock().install(Arc::clone(grown.storage()), len as usize, device);
        Ok(())
    }

    /// Control-side read portal; copies back from the device if needed.
    pub fn read_portal(&self) -> Result<ReadPortal<T>> {
        let mut state = self.inner.lock();
        let len = state.len;
        Ok(ReadPortal::new(state.sync_control()?, len))
    }

    /// Control-side write portal; marks any execution copy stale.
    pub fn write_portal(&self) -> Result<WritePortal<T>> {
        let mut state = self.inner.lock();
        let len = state.len;
        let control = state.sync_control()?;
        state.invalidate_execution();
        Ok(WritePortal::new(control, len))
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.read_portal()?.to_vec())
    }

    pub fn get_value(&self, index: Id) -> Result<T> {
        let portal = self.read_portal()?;
        if index < 0 || index >= portal.len() {
            return Err(Error::bad_value(format!(
                "index {index} out of range for length {}",
                portal.len()
            )));
        }
        Ok(portal.get(index))
    }

    /// Bring the control buffer up to date with the execution copy.
    pub fn sync_control_array(&self) -> Result<()> {
        self.inner.lock().sync_control().map(|_| ())
    }

    /// Drop the execution buffer after copying its contents back if needed.
    pub fn release_resources_execution(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.sync_control()?;
        if let Some(slot) = state.execution.take() {
            tracing::debug!(device = %slot.device, space = %slot.space, "released execution buffer");
        }
        Ok(())
    }

    pub fn residency(&self) -> Residency {
        let state = self.inner.lock();
        Residency {
            control_valid: state.control_valid,
            execution: state.execution.as_ref().map(|slot| slot.space),
            execution_valid: state.execution.as_ref().is_some_and(|slot| slot.valid),
        }
    }

    /// Whether both handles share one underlying array.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Like [`Self::ptr_eq`] for handles that may differ in element type.
    pub fn shares_array_with<U: Value>(&self, other: &ArrayHandle<U>) -> bool {
        Arc::as_ptr(&self.inner) as *const u8 == Arc::as_ptr(&other.inner) as *const u8
    }
}

fn checked_len(len: Id) -> Result<usize> {
    usize::try_from(len).map_err(|_| Error::bad_value(format!("array length must not be negative, got {len}")))
}

impl<T: Value> Clone for ArrayHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Value> Default for ArrayHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Value> From<Vec<T>> for ArrayHandle<T> {
    fn from(values: Vec<T>) -> Self {
        Self::from_vec(values)
    }
}

impl<T: Value> fmt::Debug for ArrayHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ArrayHandle")
            .field("len", &state.len)
            .field("control_valid", &state.control_valid)
            .field("execution", &state.execution.as_ref().map(|slot| (slot.space, slot.valid)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_backends::{AcceleratorAdapter, AcceleratorConfig, SerialAdapter};

    fn accelerator() -> AcceleratorAdapter {
        AcceleratorAdapter::with_config(AcceleratorConfig {
            compute_units: Some(2),
            ..AcceleratorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn clones_share_storage() {
        let a = ArrayHandle::from_vec(vec![1_i32, 2, 3]);
        let b = a.clone();
        b.write_portal().unwrap().set(0, 9);
        assert_eq!(a.to_vec().unwrap(), vec![9, 2, 3]);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&ArrayHandle::from_vec(vec![9, 2, 3])));
    }

    #[test]
    fn shrink_truncates_without_reallocating() {
        let handle = ArrayHandle::from_vec(vec![1_u64, 2, 3, 4]);
        let before = handle.read_portal().unwrap();
        handle.shrink(2).unwrap();
        let after = handle.read_portal().unwrap();
        assert_eq!(after.to_vec(), vec![1, 2]);
        assert!(Arc::ptr_eq(before.storage(), after.storage()));
        assert!(matches!(handle.shrink(3), Err(Error::BadValue(_))));
    }

    #[test]
    fn host_adapters_use_the_control_buffer() {
        let handle = ArrayHandle::from_vec(vec![5_i16, 6]);
        let portal = handle.prepare_for_input(&SerialAdapter).unwrap();
        assert!(Arc::ptr_eq(portal.storage(), handle.read_portal().unwrap().storage()));
        assert_eq!(handle.residency().execution, None);
    }

    #[test]
    fn device_input_uploads_once_and_is_reused() {
        let device = accelerator();
        let handle = ArrayHandle::from_vec(vec![1.0_f64, 2.0, 3.0]);
        let first = handle.prepare_for_input(&device).unwrap();
        let second = handle.prepare_for_input(&device).unwrap();
        assert!(Arc::ptr_eq(first.storage(), second.storage()));
        assert_eq!(device.stats().memory.host_to_device_bytes, 24);

        let residency = handle.residency();
        assert!(residency.control_valid && residency.execution_valid);
        assert_eq!(residency.execution, Some(device.memory_space()));
    }

    #[test]
    fn device_writes_flow_back_on_host_read() {
        let device = accelerator();
        let handle = ArrayHandle::from_vec(vec![0_i32; 4]);
        let portal = handle.prepare_for_in_place(&device).unwrap();
        device.schedule(|i, _| portal.set(i, (i * 10) as i32), 4).unwrap();
        assert!(!handle.residency().control_valid);

        assert_eq!(handle.to_vec().unwrap(), vec![0, 10, 20, 30]);
        assert!(handle.residency().control_valid);
        assert_eq!(device.stats().memory.device_to_host_bytes, 16);
    }

    #[test]
    fn stale_device_buffer_is_refreshed_in_place() {
        let device = accelerator();
        let handle = ArrayHandle::from_vec(vec![1_i32, 2, 3]);
        let first = handle.prepare_for_input(&device).unwrap();
        handle.write_portal().unwrap().set(0, 100);
        assert!(!handle.residency().execution_valid);

        let second = handle.prepare_for_input(&device).unwrap();
        assert!(Arc::ptr_eq(first.storage(), second.storage()));
        assert_eq!(second.to_vec(), vec![100, 2, 3]);
        assert_eq!(device.stats().memory.allocations, 1);
    }

    #[test]
    fn output_replaces_contents_and_leaves_old_portals_intact() {
        let device = accelerator();
        let handle = ArrayHandle::from_vec(vec![7_u32; 3]);
        let old = handle.prepare_for_input(&device).unwrap();
        let fresh = handle.prepare_for_output(5, &device).unwrap();
        assert_eq!(handle.len(), 5);
        assert_eq!(old.to_vec(), vec![7, 7, 7]);
        assert_eq!(fresh.to_vec(), vec![0; 5]);
        assert!(!handle.residency().control_valid);
    }

    #[test]
    fn release_keeps_data_on_host() {
        let device = accelerator();
        let handle = ArrayHandle::from_vec(vec![0_i64; 2]);
        let portal = handle.prepare_for_in_place(&device).unwrap();
        portal.set(1, 42);
        drop(portal);
        handle.release_resources_execution().unwrap();
        assert_eq!(handle.residency().execution, None);
        assert_eq!(handle.get_value(1).unwrap(), 42);
        assert_eq!(device.stats().memory.bytes_in_use, 0);
    }

    #[test]
    fn reallocate_preserving_keeps_prefix() {
        let handle = ArrayHandle::from_vec(vec![1_i32, 2]);
        handle.reallocate_preserving(4, &SerialAdapter).unwrap();
        assert_eq!(handle.to_vec().unwrap(), vec![1, 2, 0, 0]);
    }

    #[test]
    fn invalid_lengths_and_indices() {
        let handle = ArrayHandle::<i32>::new();
        assert!(handle.is_empty());
        assert!(matches!(handle.allocate(-1), Err(Error::BadValue(_))));
        assert!(matches!(handle.get_value(0), Err(Error::BadValue(_))));
        handle.allocate(3).unwrap();
        assert_eq!(handle.to_vec().unwrap(), vec![0, 0, 0]);
    }
}
