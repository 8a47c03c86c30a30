//! Serial device adapter
//!
//! Runs every kernel in a plain loop on the calling thread and implements
//! each primitive directly with sequential code. It is the reference the
//! other adapters are tested against and the fallback when nothing else is
//! available.

use std::sync::Arc;

use strata_tracing::performance::record_throughput;
use strata_tracing::{perf_span, timed_block};

use crate::adapter::{DeviceAdapter, DeviceAdapterId, Id, Id3, MemorySpace, Value};
use crate::adapters::general::{self, ensure_len};
use crate::error::{catch_execution, DeviceError, Result};
use crate::error_buffer::ErrorMessageBuffer;
use crate::memory::Storage;
use crate::portal::{ReadPortal, WritePortal};

/// Single-threaded adapter on host memory
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialAdapter;

impl SerialAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn check_count(num_instances: Id) -> Result<()> {
    if num_instances < 0 {
        return Err(DeviceError::bad_value(format!(
            "cannot schedule a negative number of instances ({num_instances})"
        )));
    }
    Ok(())
}

impl DeviceAdapter for SerialAdapter {
    fn id(&self) -> DeviceAdapterId {
        DeviceAdapterId::Serial
    }

    fn memory_space(&self) -> MemorySpace {
        MemorySpace::Host
    }

    fn allocate<T: Value>(&self, len: usize) -> Result<Arc<Storage<T>>> {
        Ok(Arc::new(Storage::host_zeroed(len)))
    }

    fn schedule<F>(&self, kernel: F, num_instances: Id) -> Result<()>
    where
        F: Fn(Id, &ErrorMessageBuffer) + Sync,
    {
        check_count(num_instances)?;
        if num_instances == 0 {
            return Ok(());
        }
        let _span = perf_span!("serial_schedule", n = num_instances);
        let errors = ErrorMessageBuffer::new();
        let (launched, duration_us) = timed_block!("serial_schedule", {
            catch_execution("schedule", || {
                for index in 0..num_instances {
                    kernel(index, &errors);
                }
                Ok(())
            })
        });
        launched?;
        record_throughput("serial_schedule", num_instances as u64, duration_us);
        errors.check()
    }

    fn schedule_3d<F>(&self, kernel: F, range: Id3) -> Result<()>
    where
        F: Fn(Id3, &ErrorMessageBuffer) + Sync,
    {
        range.iter().try_for_each(|&axis| check_count(axis))?;
        if range.contains(&0) {
            return Ok(());
        }
        let _span = perf_span!("serial_schedule_3d", x = range[0], y = range[1], z = range[2]);
        let errors = ErrorMessageBuffer::new();
        let (launched, duration_us) = timed_block!("serial_schedule_3d", {
            catch_execution("schedule_3d", || {
                for k in 0..range[2] {
                    for j in 0..range[1] {
                        for i in 0..range[0] {
                            kernel([i, j, k], &errors);
                        }
                    }
                }
                Ok(())
            })
        });
        launched?;
        record_throughput("serial_schedule_3d", (range[0] * range[1] * range[2]) as u64, duration_us);
        errors.check()
    }

    // ============================================================================================
    // Primitives
    // ============================================================================================

    fn copy<T: Value>(&self, input: &ReadPortal<T>, output: &WritePortal<T>) -> Result<()> {
        catch_execution("copy", || {
            ensure_len("copy", "output", output.len(), input.len())?;
            for (i, value) in input.iter().enumerate() {
                output.set(i as Id, value);
            }
            Ok(())
        })
    }

    fn fill<T: Value>(&self, output: &WritePortal<T>, value: T) -> Result<()> {
        catch_execution("fill", || {
            for i in 0..output.len() {
                output.set(i, value);
            }
            Ok(())
        })
    }

    fn copy_sub_range<T: Value>(
        &self,
        input: &ReadPortal<T>,
        input_start: Id,
        count: Id,
        output: &WritePortal<T>,
        output_start: Id,
    ) -> Result<()> {
        catch_execution("copy_sub_range", || {
            general::check_sub_range(input, input_start, count, output, output_start)?;
            for i in 0..count {
                output.set(output_start + i, input.get(input_start + i));
            }
            Ok(())
        })
    }

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
        catch_execution("copy_if", || {
            ensure_len("copy_if", "stencil", stencil.len(), input.len())?;
            let mut count = 0;
            for i in 0..input.len() {
                if predicate(stencil.get(i)) {
                    output.set(count, input.get(i));
                    count += 1;
                }
            }
            Ok(count)
        })
    }

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
        catch_execution("lower_bounds", || {
            ensure_len("lower_bounds", "output", output.len(), values.len())?;
            for (i, value) in values.iter().enumerate() {
                output.set(i as Id, general::lower_bound_index(sorted, value, &less));
            }
            Ok(())
        })
    }

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
        catch_execution("upper_bounds", || {
            ensure_len("upper_bounds", "output", output.len(), values.len())?;
            for (i, value) in values.iter().enumerate() {
                output.set(i as Id, general::upper_bound_index(sorted, value, &less));
            }
            Ok(())
        })
    }

    fn reduce<T, Op>(&self, input: &ReadPortal<T>, initial: T, op: Op) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        catch_execution("reduce", || Ok(input.iter().fold(initial, &op)))
    }

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
            let n = keys.len();
            ensure_len("reduce_by_key", "values", values.len(), n)?;
            if n == 0 {
                return Ok(0);
            }
            let mut count = 0;
            let mut key = keys.get(0);
            let mut acc = values.get(0);
            for i in 1..n {
                let next = keys.get(i);
                if next == key {
                    acc = op(acc, values.get(i));
                } else {
                    keys_output.set(count, key);
                    values_output.set(count, acc);
                    count += 1;
                    key = next;
                    acc = values.get(i);
                }
            }
            keys_output.set(count, key);
            values_output.set(count, acc);
            Ok(count + 1)
        })
    }

    fn scan_inclusive<T, Op>(&self, input: &ReadPortal<T>, output: &WritePortal<T>, op: Op) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        catch_execution("scan_inclusive", || {
            let n = input.len();
            if n == 0 {
                return Ok(T::zeroed());
            }
            ensure_len("scan_inclusive", "output", output.len(), n)?;
            let mut acc = input.get(0);
            output.set(0, acc);
            for i in 1..n {
                acc = op(acc, input.get(i));
                output.set(i, acc);
            }
            Ok(acc)
        })
    }

    fn scan_exclusive<T, Op>(&self, input: &ReadPortal<T>, output: &WritePortal<T>, initial: T, op: Op) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        catch_execution("scan_exclusive", || {
            let n = input.len();
            if n == 0 {
                return Ok(T::zeroed());
            }
            ensure_len("scan_exclusive", "output", output.len(), n)?;
            let mut acc = initial;
            for i in 0..n {
                let x = input.get(i);
                output.set(i, acc);
                acc = op(acc, x);
            }
            Ok(acc)
        })
    }

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
            let n = keys.len();
            ensure_len("scan_inclusive_by_key", "values", values.len(), n)?;
            ensure_len("scan_inclusive_by_key", "output", output.len(), n)?;
            let mut acc = V::zeroed();
            for i in 0..n {
                let x = values.get(i);
                acc = if i == 0 || keys.get(i) != keys.get(i - 1) { x } else { op(acc, x) };
                output.set(i, acc);
            }
            Ok(())
        })
    }

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
            let n = keys.len();
            ensure_len("scan_exclusive_by_key", "values", values.len(), n)?;
            ensure_len("scan_exclusive_by_key", "output", output.len(), n)?;
            let mut acc = initial;
            for i in 0..n {
                if i > 0 && keys.get(i) != keys.get(i - 1) {
                    acc = initial;
                }
                let x = values.get(i);
                output.set(i, acc);
                acc = op(acc, x);
            }
            Ok(())
        })
    }

    fn sort<T, C>(&self, values: &WritePortal<T>, less: C) -> Result<()>
    where
        T: Value,
        C: Fn(T, T) -> bool + Sync + Send,
    {
        catch_execution("sort", || {
            let mut host = values.to_vec();
            host.sort_by(|&a, &b| ordering(&less, a, b));
            for (i, value) in host.into_iter().enumerate() {
                values.set(i as Id, value);
            }
            Ok(())
        })
    }

    fn sort_by_key<K, V, C>(&self, keys: &WritePortal<K>, values: &WritePortal<V>, less: C) -> Result<()>
    where
        K: Value,
        V: Value,
        C: Fn(K, K) -> bool + Sync + Send,
    {
        catch_execution("sort_by_key", || {
            ensure_len("sort_by_key", "values", values.len(), keys.len())?;
            general::ensure_distinct_storage(keys, values)?;
            let mut pairs: Vec<(K, V)> = (0..keys.len()).map(|i| (keys.get(i), values.get(i))).collect();
            pairs.sort_by(|a, b| ordering(&less, a.0, b.0));
            for (i, (key, value)) in pairs.into_iter().enumerate() {
                keys.set(i as Id, key);
                values.set(i as Id, value);
            }
            Ok(())
        })
    }

    fn unique<T, E>(&self, values: &WritePortal<T>, equal: E) -> Result<Id>
    where
        T: Value,
        E: Fn(T, T) -> bool + Sync + Send,
    {
        catch_execution("unique", || {
            let n = values.len();
            if n == 0 {
                return Ok(0);
            }
            // compare adjacent input values; `previous` survives the overwrite
            let mut previous = values.get(0);
            let mut kept = 1;
            for i in 1..n {
                let value = values.get(i);
                if !equal(previous, value) {
                    values.set(kept, value);
                    kept += 1;
                }
                previous = value;
            }
            Ok(kept)
        })
    }
}

/// Total order from a strict-weak `less`, for the std sorts.
pub(crate) fn ordering<T: Copy, C: Fn(T, T) -> bool>(less: &C, a: T, b: T) -> std::cmp::Ordering {
    if less(a, b) {
        std::cmp::Ordering::Less
    } else if less(b, a) {
        std::cmp::Ordering::Greater
    } else {
        std::cmp::Ordering::Equal
    }
}
