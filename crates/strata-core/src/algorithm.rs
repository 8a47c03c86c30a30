//! Parallel algorithms over [`ArrayHandle`]s on one device adapter.
//!
//! `Algorithm<D>` prepares portals on `D`, runs the adapter primitive and
//! sizes the outputs. Input handles are read, output handles are replaced
//! with fresh storage of the result length, and in-place operations (`sort`,
//! `unique`) rewrite their argument. Passing the same handle as input and
//! output is allowed everywhere.
//!
//! ```rust
//! use strata_core::{Algorithm, ArrayHandle};
//! use strata_backends::SerialAdapter;
//!
//! # fn main() -> strata_core::Result<()> {
//! let algorithm = Algorithm::new(SerialAdapter);
//! let input = ArrayHandle::from_vec(vec![3_i64, 1, 4, 1, 5]);
//! let prefix = ArrayHandle::new();
//! let total = algorithm.scan_inclusive(&input, &prefix)?;
//! assert_eq!(prefix.to_vec()?, vec![3, 4, 8, 9, 14]);
//! assert_eq!(total, 14);
//! # Ok(())
//! # }
//! ```

use std::ops::Add;

use num_traits::AsPrimitive;
use strata_backends::{DeviceAdapter, ErrorMessageBuffer, Id, Id3, Value, WritePortal};

use crate::array_handle::ArrayHandle;
use crate::error::{Error, Result};

fn add<T: Add<Output = T>>(a: T, b: T) -> T {
    a + b
}

fn less<T: PartialOrd>(a: T, b: T) -> bool {
    a < b
}

fn ensure_same_len(operation: &str, first: Id, second: Id) -> Result<()> {
    if first != second {
        return Err(Error::bad_value(format!(
            "{operation}: arrays have different lengths ({first} and {second})"
        )));
    }
    Ok(())
}

/// Algorithm facade bound to one device adapter
#[derive(Debug, Clone, Default)]
pub struct Algorithm<D: DeviceAdapter> {
    device: D,
}

impl<D: DeviceAdapter> Algorithm<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    // ============================================================================================
    // Copies
    // ============================================================================================

    /// Copy `input` into `output`, resizing it to match.
    pub fn copy<T: Value>(&self, input: &ArrayHandle<T>, output: &ArrayHandle<T>) -> Result<()> {
        let source = input.prepare_for_input(&self.device)?;
        let target = output.prepare_for_output(source.len(), &self.device)?;
        self.device.copy(&source, &target)?;
        Ok(())
    }

    /// Copy with a numeric conversion of every element (`as` semantics).
    pub fn copy_as<T, U>(&self, input: &ArrayHandle<T>, output: &ArrayHandle<U>) -> Result<()>
    where
        T: Value + AsPrimitive<U>,
        U: Value,
    {
        let source = input.prepare_for_input(&self.device)?;
        let target = output.prepare_for_output(source.len(), &self.device)?;
        self.device.schedule(|i, _| target.set(i, source.get(i).as_()), source.len())?;
        Ok(())
    }

    /// Keep `input[i]` where `stencil[i]` is non-zero; returns the kept count.
    pub fn copy_if<T: Value, S: Value>(
        &self,
        input: &ArrayHandle<T>,
        stencil: &ArrayHandle<S>,
        output: &ArrayHandle<T>,
    ) -> Result<Id> {
        let zero = S::zeroed();
        self.copy_if_with(input, stencil, output, move |s| s != zero)
    }

    pub fn copy_if_with<T, S, P>(
        &self,
        input: &ArrayHandle<T>,
        stencil: &ArrayHandle<S>,
        output: &ArrayHandle<T>,
        predicate: P,
    ) -> Result<Id>
    where
        T: Value,
        S: Value,
        P: Fn(S) -> bool + Sync + Send,
    {
        ensure_same_len("copy_if", input.len(), stencil.len())?;
        let source = input.prepare_for_input(&self.device)?;
        let flags = stencil.prepare_for_input(&self.device)?;
        let target = output.prepare_for_output(source.len(), &self.device)?;
        let count = self.device.copy_if(&source, &flags, &target, predicate)?;
        output.shrink(count)?;
        Ok(count)
    }

    /// Copy `count` values from `input_start` to `output_start`.
    ///
    /// Returns `Ok(false)` without touching anything when an argument is
    /// negative, `input_start` is past the end of `input`, or the copy would
    /// end beyond `Id::MAX`. `count` is clamped to the available input, and
    /// `output` grows (keeping its contents) when the copy would run past its
    /// end.
    pub fn copy_sub_range<T: Value>(
        &self,
        input: &ArrayHandle<T>,
        input_start: Id,
        count: Id,
        output: &ArrayHandle<T>,
        output_start: Id,
    ) -> Result<bool> {
        let in_size = input.len();
        if input_start < 0 || count < 0 || output_start < 0 || input_start >= in_size {
            return Ok(false);
        }
        let count = count.min(in_size - input_start);
        let Some(copy_end) = output_start.checked_add(count) else {
            return Ok(false);
        };

        let out_size = output.len();
        if out_size < copy_end {
            if out_size == 0 {
                output.prepare_for_output(copy_end, &self.device)?;
            } else {
                output.reallocate_preserving(copy_end, &self.device)?;
            }
        }

        let source = input.prepare_for_input(&self.device)?;
        if input.ptr_eq(output) {
            // ranges within one array may overlap; stage through a temporary
            let staged = WritePortal::new(self.device.allocate::<T>(count as usize)?, count as usize);
            self.device.copy_sub_range(&source, input_start, count, &staged, 0)?;
            let target = output.prepare_for_in_place(&self.device)?;
            self.device.copy_sub_range(&staged.as_read(), 0, count, &target, output_start)?;
        } else {
            let target = output.prepare_for_in_place(&self.device)?;
            self.device.copy_sub_range(&source, input_start, count, &target, output_start)?;
        }
        Ok(true)
    }

    /// Resize `output` to `len` values all equal to `value`.
    pub fn fill<T: Value>(&self, output: &ArrayHandle<T>, value: T, len: Id) -> Result<()> {
        let target = output.prepare_for_output(len, &self.device)?;
        self.device.fill(&target, value)?;
        Ok(())
    }

    // ============================================================================================
    // Searches
    // ============================================================================================

    pub fn lower_bounds<T: Value + PartialOrd>(
        &self,
        sorted: &ArrayHandle<T>,
        values: &ArrayHandle<T>,
        output: &ArrayHandle<Id>,
    ) -> Result<()> {
        self.lower_bounds_by(sorted, values, output, less)
    }

    /// For each value, the first index of `sorted` not less than it.
    pub fn lower_bounds_by<T, C>(
        &self,
        sorted: &ArrayHandle<T>,
        values: &ArrayHandle<T>,
        output: &ArrayHandle<Id>,
        less: C,
    ) -> Result<()>
    where
        T: Value,
        C: Fn(T, T) -> bool + Sync + Send,
    {
        let haystack = sorted.prepare_for_input(&self.device)?;
        let needles = values.prepare_for_input(&self.device)?;
        let target = output.prepare_for_output(needles.len(), &self.device)?;
        self.device.lower_bounds(&haystack, &needles, &target, less)?;
        Ok(())
    }

    pub fn upper_bounds<T: Value + PartialOrd>(
        &self,
        sorted: &ArrayHandle<T>,
        values: &ArrayHandle<T>,
        output: &ArrayHandle<Id>,
    ) -> Result<()> {
        self.upper_bounds_by(sorted, values, output, less)
    }

    /// For each value, the first index of `sorted` greater than it.
    pub fn upper_bounds_by<T, C>(
        &self,
        sorted: &ArrayHandle<T>,
        values: &ArrayHandle<T>,
        output: &ArrayHandle<Id>,
        less: C,
    ) -> Result<()>
    where
        T: Value,
        C: Fn(T, T) -> bool + Sync + Send,
    {
        let haystack = sorted.prepare_for_input(&self.device)?;
        let needles = values.prepare_for_input(&self.device)?;
        let target = output.prepare_for_output(needles.len(), &self.device)?;
        self.device.upper_bounds(&haystack, &needles, &target, less)?;
        Ok(())
    }

    // ============================================================================================
    // Reductions
    // ============================================================================================

    /// Sum of `input` plus `initial`.
    pub fn reduce<T: Value + Add<Output = T>>(&self, input: &ArrayHandle<T>, initial: T) -> Result<T> {
        self.reduce_with(input, initial, add)
    }

    pub fn reduce_with<T, Op>(&self, input: &ArrayHandle<T>, initial: T, op: Op) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        let source = input.prepare_for_input(&self.device)?;
        Ok(self.device.reduce(&source, initial, op)?)
    }

    /// Fold each run of equal adjacent keys; returns the number of runs.
    pub fn reduce_by_key<K, V, Op>(
        &self,
        keys: &ArrayHandle<K>,
        values: &ArrayHandle<V>,
        keys_output: &ArrayHandle<K>,
        values_output: &ArrayHandle<V>,
        op: Op,
    ) -> Result<Id>
    where
        K: Value,
        V: Value,
        Op: Fn(V, V) -> V + Sync + Send,
    {
        ensure_same_len("reduce_by_key", keys.len(), values.len())?;
        let key_source = keys.prepare_for_input(&self.device)?;
        let value_source = values.prepare_for_input(&self.device)?;
        let n = key_source.len();
        let key_target = keys_output.prepare_for_output(n, &self.device)?;
        let value_target = values_output.prepare_for_output(n, &self.device)?;
        let runs = self
            .device
            .reduce_by_key(&key_source, &value_source, &key_target, &value_target, op)?;
        keys_output.shrink(runs)?;
        values_output.shrink(runs)?;
        Ok(runs)
    }

    // ============================================================================================
    // Scans
    // ============================================================================================

    pub fn scan_inclusive<T: Value + Add<Output = T>>(&self, input: &ArrayHandle<T>, output: &ArrayHandle<T>) -> Result<T> {
        self.scan_inclusive_with(input, output, add)
    }

    /// `output[i] = input[0] op ... op input[i]`; returns the total.
    pub fn scan_inclusive_with<T, Op>(&self, input: &ArrayHandle<T>, output: &ArrayHandle<T>, op: Op) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        let source = input.prepare_for_input(&self.device)?;
        let target = output.prepare_for_output(source.len(), &self.device)?;
        Ok(self.device.scan_inclusive(&source, &target, op)?)
    }

    /// Exclusive sum starting from zero; returns the total.
    pub fn scan_exclusive<T: Value + Add<Output = T>>(&self, input: &ArrayHandle<T>, output: &ArrayHandle<T>) -> Result<T> {
        self.scan_exclusive_with(input, output, T::zeroed(), add)
    }

    /// `output[i] = initial op input[0] op ... op input[i - 1]`; returns the
    /// fold of `initial` with the whole input.
    pub fn scan_exclusive_with<T, Op>(
        &self,
        input: &ArrayHandle<T>,
        output: &ArrayHandle<T>,
        initial: T,
        op: Op,
    ) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        let source = input.prepare_for_input(&self.device)?;
        let target = output.prepare_for_output(source.len(), &self.device)?;
        Ok(self.device.scan_exclusive(&source, &target, initial, op)?)
    }

    pub fn scan_inclusive_by_key<K, V>(
        &self,
        keys: &ArrayHandle<K>,
        values: &ArrayHandle<V>,
        output: &ArrayHandle<V>,
    ) -> Result<()>
    where
        K: Value,
        V: Value + Add<Output = V>,
    {
        self.scan_inclusive_by_key_with(keys, values, output, add)
    }

    /// Inclusive scan restarting at each run of equal keys.
    pub fn scan_inclusive_by_key_with<K, V, Op>(
        &self,
        keys: &ArrayHandle<K>,
        values: &ArrayHandle<V>,
        output: &ArrayHandle<V>,
        op: Op,
    ) -> Result<()>
    where
        K: Value,
        V: Value,
        Op: Fn(V, V) -> V + Sync + Send,
    {
        ensure_same_len("scan_inclusive_by_key", keys.len(), values.len())?;
        let key_source = keys.prepare_for_input(&self.device)?;
        let value_source = values.prepare_for_input(&self.device)?;
        let target = output.prepare_for_output(value_source.len(), &self.device)?;
        self.device
            .scan_inclusive_by_key(&key_source, &value_source, &target, op)?;
        Ok(())
    }

    pub fn scan_exclusive_by_key<K, V>(
        &self,
        keys: &ArrayHandle<K>,
        values: &ArrayHandle<V>,
        output: &ArrayHandle<V>,
    ) -> Result<()>
    where
        K: Value,
        V: Value + Add<Output = V>,
    {
        self.scan_exclusive_by_key_with(keys, values, output, V::zeroed(), add)
    }

    /// Exclusive scan restarting from `initial` at each run of equal keys.
    pub fn scan_exclusive_by_key_with<K, V, Op>(
        &self,
        keys: &ArrayHandle<K>,
        values: &ArrayHandle<V>,
        output: &ArrayHandle<V>,
        initial: V,
        op: Op,
    ) -> Result<()>
    where
        K: Value,
        V: Value,
        Op: Fn(V, V) -> V + Sync + Send,
    {
        ensure_same_len("scan_exclusive_by_key", keys.len(), values.len())?;
        let key_source = keys.prepare_for_input(&self.device)?;
        let value_source = values.prepare_for_input(&self.device)?;
        let target = output.prepare_for_output(value_source.len(), &self.device)?;
        self.device
            .scan_exclusive_by_key(&key_source, &value_source, &target, initial, op)?;
        Ok(())
    }

    // ============================================================================================
    // Sorting & uniqueness
    // ============================================================================================

    pub fn sort<T: Value + PartialOrd>(&self, values: &ArrayHandle<T>) -> Result<()> {
        self.sort_by(values, less)
    }

    pub fn sort_by<T, C>(&self, values: &ArrayHandle<T>, less: C) -> Result<()>
    where
        T: Value,
        C: Fn(T, T) -> bool + Sync + Send,
    {
        let target = values.prepare_for_in_place(&self.device)?;
        self.device.sort(&target, less)?;
        Ok(())
    }

    pub fn sort_by_key<K: Value + PartialOrd, V: Value>(&self, keys: &ArrayHandle<K>, values: &ArrayHandle<V>) -> Result<()> {
        self.sort_by_key_by(keys, values, less)
    }

    /// Sort `keys` and apply the same permutation to `values`.
    pub fn sort_by_key_by<K, V, C>(&self, keys: &ArrayHandle<K>, values: &ArrayHandle<V>, less: C) -> Result<()>
    where
        K: Value,
        V: Value,
        C: Fn(K, K) -> bool + Sync + Send,
    {
        ensure_same_len("sort_by_key", keys.len(), values.len())?;
        if keys.shares_array_with(values) {
            return Err(Error::bad_value("sort_by_key: keys and values are the same array"));
        }
        let key_target = keys.prepare_for_in_place(&self.device)?;
        let value_target = values.prepare_for_in_place(&self.device)?;
        self.device.sort_by_key(&key_target, &value_target, less)?;
        Ok(())
    }

    pub fn unique<T: Value>(&self, values: &ArrayHandle<T>) -> Result<Id> {
        self.unique_by(values, |a, b| a == b)
    }

    /// Drop adjacent values for which `equal` holds; returns the new length.
    pub fn unique_by<T, E>(&self, values: &ArrayHandle<T>, equal: E) -> Result<Id>
    where
        T: Value,
        E: Fn(T, T) -> bool + Sync + Send,
    {
        let target = values.prepare_for_in_place(&self.device)?;
        let kept = self.device.unique(&target, equal)?;
        values.shrink(kept)?;
        Ok(kept)
    }

    // ============================================================================================
    // Scheduling
    // ============================================================================================

    /// Invoke `kernel` once per index in `0..num_instances`.
    pub fn schedule<F>(&self, kernel: F, num_instances: Id) -> Result<()>
    where
        F: Fn(Id, &ErrorMessageBuffer) + Sync,
    {
        Ok(self.device.schedule(kernel, num_instances)?)
    }

    /// Invoke `kernel` once per coordinate inside `range`.
    pub fn schedule_3d<F>(&self, kernel: F, range: Id3) -> Result<()>
    where
        F: Fn(Id3, &ErrorMessageBuffer) + Sync,
    {
        Ok(self.device.schedule_3d(kernel, range)?)
    }

    pub fn synchronize(&self) -> Result<()> {
        Ok(self.device.synchronize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_backends::SerialAdapter;

    fn algorithm() -> Algorithm<SerialAdapter> {
        Algorithm::new(SerialAdapter)
    }

    #[test]
    fn copy_as_converts_numbers() {
        let input = ArrayHandle::from_vec(vec![1.9_f32, -2.5, 300.0]);
        let output = ArrayHandle::<i32>::new();
        algorithm().copy_as(&input, &output).unwrap();
        assert_eq!(output.to_vec().unwrap(), vec![1, -2, 300]);
    }

    #[test]
    fn copy_if_default_stencil_is_non_zero() {
        let input = ArrayHandle::from_vec(vec![1_u8, 2, 3, 4]);
        let stencil = ArrayHandle::from_vec(vec![0.0_f64, 1.0, -0.5, 0.0]);
        let output = ArrayHandle::new();
        assert_eq!(algorithm().copy_if(&input, &stencil, &output).unwrap(), 2);
        assert_eq!(output.to_vec().unwrap(), vec![2, 3]);
    }

    #[test]
    fn copy_if_rejects_mismatched_stencil() {
        let input = ArrayHandle::from_vec(vec![1_i32, 2]);
        let stencil = ArrayHandle::from_vec(vec![1_i32]);
        assert!(matches!(
            algorithm().copy_if(&input, &stencil, &ArrayHandle::new()),
            Err(Error::BadValue(_))
        ));
    }

    #[test]
    fn copy_sub_range_clamps_and_grows() {
        let input = ArrayHandle::from_vec(vec![1_i32, 2, 3, 4, 5]);
        let output = ArrayHandle::from_vec(vec![9, 9]);
        assert!(algorithm().copy_sub_range(&input, 3, 10, &output, 1).unwrap());
        assert_eq!(output.to_vec().unwrap(), vec![9, 4, 5]);

        let empty = ArrayHandle::new();
        assert!(algorithm().copy_sub_range(&input, 0, 2, &empty, 2).unwrap());
        assert_eq!(empty.to_vec().unwrap(), vec![0, 0, 1, 2]);
    }

    #[test]
    fn copy_sub_range_rejects_bad_arguments_untouched() {
        let input = ArrayHandle::from_vec(vec![1_i32, 2, 3]);
        let output = ArrayHandle::from_vec(vec![7, 7]);
        for (start, count, offset) in [(3, 1, 0), (-1, 1, 0), (0, -1, 0), (0, 1, -1), (10, 1, 0)] {
            assert!(!algorithm().copy_sub_range(&input, start, count, &output, offset).unwrap());
        }
        assert_eq!(output.to_vec().unwrap(), vec![7, 7]);
    }

    #[test]
    fn copy_sub_range_refuses_overflowing_output_offset() {
        let input = ArrayHandle::from_vec(vec![1_i32, 2, 3]);
        let output = ArrayHandle::from_vec(vec![7, 7]);
        assert!(!algorithm().copy_sub_range(&input, 0, 3, &output, Id::MAX - 1).unwrap());
        assert_eq!(output.to_vec().unwrap(), vec![7, 7]);
    }

    #[test]
    fn sort_by_key_rejects_one_array_as_keys_and_values() {
        let data = ArrayHandle::from_vec(vec![3_i32, 1, 2]);
        assert!(matches!(
            algorithm().sort_by_key(&data, &data.clone()),
            Err(Error::BadValue(_))
        ));
        assert_eq!(data.to_vec().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn copy_sub_range_within_one_array_handles_overlap() {
        let data = ArrayHandle::from_vec(vec![1_i32, 2, 3, 4, 5]);
        assert!(algorithm().copy_sub_range(&data, 0, 4, &data, 1).unwrap());
        assert_eq!(data.to_vec().unwrap(), vec![1, 1, 2, 3, 4]);
    }

    #[test]
    fn aliased_scan_reads_original_values() {
        let data = ArrayHandle::from_vec(vec![1_i64, 2, 3]);
        let total = algorithm().scan_exclusive(&data, &data).unwrap();
        assert_eq!(data.to_vec().unwrap(), vec![0, 1, 3]);
        assert_eq!(total, 6);
    }

    #[test]
    fn reduce_by_key_empty_sizes_outputs_to_zero() {
        let keys = ArrayHandle::<i32>::new();
        let values = ArrayHandle::<f32>::new();
        let keys_out = ArrayHandle::from_vec(vec![1, 2]);
        let values_out = ArrayHandle::from_vec(vec![1.0, 2.0]);
        let runs = algorithm()
            .reduce_by_key(&keys, &values, &keys_out, &values_out, |a, b| a + b)
            .unwrap();
        assert_eq!(runs, 0);
        assert!(keys_out.is_empty() && values_out.is_empty());
    }

    #[test]
    fn unique_shrinks_in_place() {
        let values = ArrayHandle::from_vec(vec![1_u16, 1, 2, 3, 3, 3]);
        assert_eq!(algorithm().unique(&values).unwrap(), 3);
        assert_eq!(values.to_vec().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn fill_resizes() {
        let handle = ArrayHandle::from_vec(vec![1_i8]);
        algorithm().fill(&handle, 4, 3).unwrap();
        assert_eq!(handle.to_vec().unwrap(), vec![4, 4, 4]);
    }
}
