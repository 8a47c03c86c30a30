//! The device adapter trait.
//!
//! Every backend implements [`DeviceAdapter`]. Only memory allocation and the
//! two schedulers are required; every parallel primitive has a provided
//! implementation built from `schedule` (see [`crate::adapters::general`])
//! that a backend overrides when it has something faster.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │               control side (ArrayHandle, Algorithm)           │
//! └──────────────────────────────┬────────────────────────────────┘
//!                                │ portals + kernels
//!                                ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        DeviceAdapter                          │
//! │   allocate · schedule · schedule_3d · primitives (provided)   │
//! └───────┬──────────────────────┬──────────────────────┬─────────┘
//!         ▼                      ▼                      ▼
//!   ┌───────────┐         ┌────────────┐        ┌───────────────┐
//!   │  Serial   │         │  Threaded  │        │  Accelerator  │
//!   │  loops    │         │  rayon     │        │  blocks/grid  │
//!   └───────────┘         └────────────┘        └───────────────┘
//! ```
//!
//! Adapters are cheap to clone and are passed by value as a compile-time tag
//! (`Algorithm<SerialAdapter>`), or looked up at run time through
//! [`crate::registry::DeviceRegistry`].

use std::fmt;
use std::sync::Arc;

use crate::adapter::{DeviceAdapterId, Id, Id3, MemorySpace, TransferDirection, Value};
use crate::adapters::general;
use crate::error::{catch_execution, Result};
use crate::error_buffer::ErrorMessageBuffer;
use crate::kernel::{Kernel, Kernel3D};
use crate::memory::{transfer, Storage};
use crate::portal::{ReadPortal, WritePortal};

/// A backend able to allocate arrays and run kernels over index spaces.
///
/// # Primitive conventions
///
/// - Output portals must be at least as long as the result; the control
///   layer sizes them and shrinks afterwards using the returned counts.
/// - `op` arguments must be associative. Order of application within a
///   reduction is unspecified beyond that.
/// - `less` comparators are strict weak orderings.
/// - Any panic inside a primitive or kernel is reported as
///   [`DeviceError::Execution`](crate::DeviceError::Execution).
pub trait DeviceAdapter: Clone + Send + Sync + fmt::Debug + 'static {
    // ============================================================================================
    // Identity & memory
    // ============================================================================================

    fn id(&self) -> DeviceAdapterId;

    /// Whether this adapter can run in the current process.
    fn is_available(&self) -> bool {
        true
    }

    /// Memory space of buffers returned by [`Self::allocate`].
    fn memory_space(&self) -> MemorySpace;

    /// Allocate `len` zeroed elements in this adapter's memory space.
    fn allocate<T: Value>(&self, len: usize) -> Result<Arc<Storage<T>>>;

    /// Copy the first `len` host elements into a fresh buffer of this adapter.
    fn upload<T: Value>(&self, host: &Storage<T>, len: usize) -> Result<Arc<Storage<T>>> {
        let device = self.allocate::<T>(len)?;
        transfer(host, &device, len, TransferDirection::HostToDevice)?;
        Ok(device)
    }

    // ============================================================================================
    // Scheduling
    // ============================================================================================

    /// Invoke `kernel` once for every index in `0..num_instances`.
    ///
    /// Returns after all invocations completed. The first message raised
    /// through the error buffer becomes an execution error.
    fn schedule<F>(&self, kernel: F, num_instances: Id) -> Result<()>
    where
        F: Fn(Id, &ErrorMessageBuffer) + Sync;

    /// Invoke `kernel` once for every coordinate in `[0, range)` per axis.
    ///
    /// A zero extent on any axis schedules nothing.
    fn schedule_3d<F>(&self, kernel: F, range: Id3) -> Result<()>
    where
        F: Fn(Id3, &ErrorMessageBuffer) + Sync;

    fn schedule_kernel<K: Kernel>(&self, kernel: &K, num_instances: Id) -> Result<()> {
        self.schedule(|index, errors| kernel.invoke(index, errors), num_instances)
    }

    fn schedule_kernel_3d<K: Kernel3D>(&self, kernel: &K, range: Id3) -> Result<()> {
        self.schedule_3d(|index, errors| kernel.invoke(index, errors), range)
    }

    /// Wait for outstanding work. Schedules are synchronous, so this only
    /// matters for adapters that queue work.
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    // ============================================================================================
    // Primitives
    // ============================================================================================

    fn copy<T: Value>(&self, input: &ReadPortal<T>, output: &WritePortal<T>) -> Result<()> {
        catch_execution("copy", || general::copy(self, input, output))
    }

    fn fill<T: Value>(&self, output: &WritePortal<T>, value: T) -> Result<()> {
        catch_execution("fill", || general::fill(self, output, value))
    }

    /// Copy `input[input_start..input_start + count]` to `output[output_start..]`.
    ///
    /// The ranges must be in bounds and must not overlap within one storage.
    fn copy_sub_range<T: Value>(
        &self,
        input: &ReadPortal<T>,
        input_start: Id,
        count: Id,
        output: &WritePortal<T>,
        output_start: Id,
    ) -> Result<()> {
        catch_execution("copy_sub_range", || {
            general::copy_sub_range(self, input, input_start, count, output, output_start)
        })
    }

    /// Stream-compact `input` where `predicate(stencil[i])` holds, keeping order.
    fn copy_if<T, S, P>(
        &self,
        input: &ReadPortal<T>,
        stencil: &ReadPortal<S>,
        output: &WritePortal<T>,
        predicate: P,
    ) -> Result<Id>
    where
        T: Value,
        S: Value,
        P: Fn(S) -> bool + Sync + Send,
    {
        catch_execution("copy_if", || general::copy_if(self, input, stencil, output, predicate))
    }

    /// For each value, the first index in `sorted` where it could be inserted.
    fn lower_bounds<T, C>(
        &self,
        sorted: &ReadPortal<T>,
        values: &ReadPortal<T>,
        output: &WritePortal<Id>,
        less: C,
    ) -> Result<()>
    where
        T: Value,
        C: Fn(T, T) -> bool + Sync + Send,
    {
        catch_execution("lower_bounds", || general::lower_bounds(self, sorted, values, output, less))
    }

    /// For each value, the last index in `sorted` where it could be inserted.
    fn upper_bounds<T, C>(
        &self,
        sorted: &ReadPortal<T>,
        values: &ReadPortal<T>,
        output: &WritePortal<Id>,
        less: C,
    ) -> Result<()>
    where
        T: Value,
        C: Fn(T, T) -> bool + Sync + Send,
    {
        catch_execution("upper_bounds", || general::upper_bounds(self, sorted, values, output, less))
    }

    /// Fold `input` into `initial`. Empty input yields `initial`.
    fn reduce<T, Op>(&self, input: &ReadPortal<T>, initial: T, op: Op) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        catch_execution("reduce", || general::reduce(self, input, initial, op))
    }

    /// One output pair per run of equal adjacent keys; returns the run count.
    fn reduce_by_key<K, V, Op>(
        &self,
        keys: &ReadPortal<K>,
        values: &ReadPortal<V>,
        keys_output: &WritePortal<K>,
        values_output: &WritePortal<V>,
        op: Op,
    ) -> Result<Id>
    where
        K: Value,
        V: Value,
        Op: Fn(V, V) -> V + Sync + Send,
    {
        catch_execution("reduce_by_key", || {
            general::reduce_by_key(self, keys, values, keys_output, values_output, op)
        })
    }

    /// Inclusive prefix scan; returns the last output (zero when empty).
    fn scan_inclusive<T, Op>(&self, input: &ReadPortal<T>, output: &WritePortal<T>, op: Op) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        catch_execution("scan_inclusive", || general::scan_inclusive(self, input, output, op))
    }

    /// Exclusive prefix scan seeded with `initial`.
    ///
    /// Returns `op(last output, last input)`, i.e. the total including the
    /// seed, or zero when empty.
    fn scan_exclusive<T, Op>(&self, input: &ReadPortal<T>, output: &WritePortal<T>, initial: T, op: Op) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        catch_execution("scan_exclusive", || general::scan_exclusive(self, input, output, initial, op))
    }

    /// Inclusive scan restarting at every change of key.
    fn scan_inclusive_by_key<K, V, Op>(
        &self,
        keys: &ReadPortal<K>,
        values: &ReadPortal<V>,
        output: &WritePortal<V>,
        op: Op,
    ) -> Result<()>
    where
        K: Value,
        V: Value,
        Op: Fn(V, V) -> V + Sync + Send,
    {
        catch_execution("scan_inclusive_by_key", || {
            general::scan_inclusive_by_key(self, keys, values, output, op)
        })
    }

    /// Exclusive scan restarting at `initial` on every change of key.
    fn scan_exclusive_by_key<K, V, Op>(
        &self,
        keys: &ReadPortal<K>,
        values: &ReadPortal<V>,
        output: &WritePortal<V>,
        initial: V,
        op: Op,
    ) -> Result<()>
    where
        K: Value,
        V: Value,
        Op: Fn(V, V) -> V + Sync + Send,
    {
        catch_execution("scan_exclusive_by_key", || {
            general::scan_exclusive_by_key(self, keys, values, output, initial, op)
        })
    }

    /// Sort in place by `less`.
    fn sort<T, C>(&self, values: &WritePortal<T>, less: C) -> Result<()>
    where
        T: Value,
        C: Fn(T, T) -> bool + Sync + Send,
    {
        catch_execution("sort", || general::sort(self, values, less))
    }

    /// Sort `keys` in place by `less`, applying the same permutation to `values`.
    fn sort_by_key<K, V, C>(&self, keys: &WritePortal<K>, values: &WritePortal<V>, less: C) -> Result<()>
    where
        K: Value,
        V: Value,
        C: Fn(K, K) -> bool + Sync + Send,
    {
        catch_execution("sort_by_key", || general::sort_by_key(self, keys, values, less))
    }

    /// Drop adjacent duplicates in place; returns the new length.
    fn unique<T, E>(&self, values: &WritePortal<T>, equal: E) -> Result<Id>
    where
        T: Value,
        E: Fn(T, T) -> bool + Sync + Send,
    {
        catch_execution("unique", || general::unique(self, values, equal))
    }
}
