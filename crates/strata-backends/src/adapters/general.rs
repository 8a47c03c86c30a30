//! Parallel primitives expressed only through `allocate` and `schedule`.
//!
//! These are the provided implementations of [`DeviceAdapter`]'s primitives.
//! They assume nothing about the device beyond "a schedule call runs every
//! index and returns when all are done", which makes them correct on any
//! adapter and the primary implementation on the accelerator.
//!
//! Reductions and scans work on chunks of [`CHUNK`] elements:
//!
//! ```text
//!   input   | c0 ........ | c1 ........ | c2 ........ |
//!   pass 1  totals[c] = fold(chunk c)                    (one invocation per chunk)
//!   pass 2  carries[c] = fold(totals[..c])               (single invocation)
//!   pass 3  out[j] = carries[c] ∘ fold(chunk c up to j)  (one invocation per chunk)
//! ```
//!
//! Sorting uses a bitonic network over the next power of two, skipping
//! comparisons that reach past the end of the data.

use std::sync::Arc;

use crate::adapter::{DeviceAdapter, Id, Value};
use crate::error::{DeviceError, Result};
use crate::portal::{ReadPortal, WritePortal};

/// Elements folded by one invocation in reductions and scans
pub const CHUNK: Id = 1024;

#[inline]
fn num_chunks(n: Id) -> Id {
    (n + CHUNK - 1) / CHUNK
}

#[inline]
fn chunk_bounds(chunk: Id, n: Id) -> (Id, Id) {
    let start = chunk * CHUNK;
    (start, (start + CHUNK).min(n))
}

fn temp<D: DeviceAdapter, T: Value>(device: &D, len: Id) -> Result<WritePortal<T>> {
    let storage = device.allocate::<T>(len as usize)?;
    Ok(WritePortal::new(storage, len as usize))
}

/// Fail with [`DeviceError::BadValue`] unless `have >= need`.
pub fn ensure_len(operation: &str, what: &str, have: Id, need: Id) -> Result<()> {
    if have < need {
        return Err(DeviceError::bad_value(format!(
            "{operation}: {what} holds {have} values, {need} required"
        )));
    }
    Ok(())
}

#[inline]
fn is_head<K: Value>(keys: &ReadPortal<K>, index: Id) -> bool {
    index == 0 || keys.get(index) != keys.get(index - 1)
}

// ================================================================================================
// Copies
// ================================================================================================

pub fn copy<D: DeviceAdapter, T: Value>(device: &D, input: &ReadPortal<T>, output: &WritePortal<T>) -> Result<()> {
    ensure_len("copy", "output", output.len(), input.len())?;
    device.schedule(|i, _| output.set(i, input.get(i)), input.len())
}

pub fn fill<D: DeviceAdapter, T: Value>(device: &D, output: &WritePortal<T>, value: T) -> Result<()> {
    device.schedule(|i, _| output.set(i, value), output.len())
}

pub fn copy_sub_range<D: DeviceAdapter, T: Value>(
    device: &D,
    input: &ReadPortal<T>,
    input_start: Id,
    count: Id,
    output: &WritePortal<T>,
    output_start: Id,
) -> Result<()> {
    check_sub_range(input, input_start, count, output, output_start)?;
    device.schedule(
        |i, _| output.set(output_start + i, input.get(input_start + i)),
        count,
    )
}

/// Bounds check shared by every adapter's `copy_sub_range`.
pub fn check_sub_range<T: Value>(
    input: &ReadPortal<T>,
    input_start: Id,
    count: Id,
    output: &WritePortal<T>,
    output_start: Id,
) -> Result<()> {
    if input_start < 0 || count < 0 || output_start < 0 {
        return Err(DeviceError::bad_value(format!(
            "copy_sub_range: negative argument (input_start={input_start}, count={count}, output_start={output_start})"
        )));
    }
    ensure_len("copy_sub_range", "input", input.len(), input_start + count)?;
    ensure_len("copy_sub_range", "output", output.len(), output_start + count)
}

pub fn copy_if<D, T, S, P>(
    device: &D,
    input: &ReadPortal<T>,
    stencil: &ReadPortal<S>,
    output: &WritePortal<T>,
    predicate: P,
) -> Result<Id>
where
    D: DeviceAdapter,
    T: Value,
    S: Value,
    P: Fn(S) -> bool + Sync + Send,
{
    let n = input.len();
    ensure_len("copy_if", "stencil", stencil.len(), n)?;
    if n == 0 {
        return Ok(0);
    }
    let flags = temp::<D, Id>(device, n)?;
    device.schedule(|i, _| flags.set(i, predicate(stencil.get(i)) as Id), n)?;
    compact(device, input, &flags.as_read(), output)
}

/// Scatter `input[i]` where `flags[i] != 0` to consecutive output slots.
fn compact<D: DeviceAdapter, T: Value>(
    device: &D,
    input: &ReadPortal<T>,
    flags: &ReadPortal<Id>,
    output: &WritePortal<T>,
) -> Result<Id> {
    let n = input.len();
    let positions = temp::<D, Id>(device, n)?;
    let count = scan_exclusive(device, flags, &positions, 0, |a, b| a + b)?;
    ensure_len("copy_if", "output", output.len(), count)?;
    device.schedule(
        |i, _| {
            if flags.get(i) != 0 {
                output.set(positions.get(i), input.get(i));
            }
        },
        n,
    )?;
    Ok(count)
}

pub fn unique<D, T, E>(device: &D, values: &WritePortal<T>, equal: E) -> Result<Id>
where
    D: DeviceAdapter,
    T: Value,
    E: Fn(T, T) -> bool + Sync + Send,
{
    let n = values.len();
    if n == 0 {
        return Ok(0);
    }
    // Compacting in place would race the scatter against later reads.
    let snapshot = temp::<D, T>(device, n)?;
    copy(device, &values.as_read(), &snapshot)?;
    let snapshot = snapshot.as_read();

    let flags = temp::<D, Id>(device, n)?;
    device.schedule(
        |i, _| {
            let keep = i == 0 || !equal(snapshot.get(i - 1), snapshot.get(i));
            flags.set(i, keep as Id);
        },
        n,
    )?;
    compact(device, &snapshot, &flags.as_read(), values)
}

// ================================================================================================
// Searches
// ================================================================================================

/// First index `i` in `sorted` with `!less(sorted[i], value)`.
pub fn lower_bound_index<T: Value, C: Fn(T, T) -> bool>(sorted: &ReadPortal<T>, value: T, less: &C) -> Id {
    let (mut lo, mut hi) = (0, sorted.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if less(sorted.get(mid), value) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// First index `i` in `sorted` with `less(value, sorted[i])`.
pub fn upper_bound_index<T: Value, C: Fn(T, T) -> bool>(sorted: &ReadPortal<T>, value: T, less: &C) -> Id {
    let (mut lo, mut hi) = (0, sorted.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if less(value, sorted.get(mid)) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

pub fn lower_bounds<D, T, C>(
    device: &D,
    sorted: &ReadPortal<T>,
    values: &ReadPortal<T>,
    output: &WritePortal<Id>,
    less: C,
) -> Result<()>
where
    D: DeviceAdapter,
    T: Value,
    C: Fn(T, T) -> bool + Sync + Send,
{
    ensure_len("lower_bounds", "output", output.len(), values.len())?;
    device.schedule(
        |i, _| output.set(i, lower_bound_index(sorted, values.get(i), &less)),
        values.len(),
    )
}

pub fn upper_bounds<D, T, C>(
    device: &D,
    sorted: &ReadPortal<T>,
    values: &ReadPortal<T>,
    output: &WritePortal<Id>,
    less: C,
) -> Result<()>
where
    D: DeviceAdapter,
    T: Value,
    C: Fn(T, T) -> bool + Sync + Send,
{
    ensure_len("upper_bounds", "output", output.len(), values.len())?;
    device.schedule(
        |i, _| output.set(i, upper_bound_index(sorted, values.get(i), &less)),
        values.len(),
    )
}

// ================================================================================================
// Reductions and scans
// ================================================================================================

pub fn reduce<D, T, Op>(device: &D, input: &ReadPortal<T>, initial: T, op: Op) -> Result<T>
where
    D: DeviceAdapter,
    T: Value,
    Op: Fn(T, T) -> T + Sync + Send,
{
    let mut current = input.clone();
    loop {
        let len = current.len();
        if len <= CHUNK {
            return Ok(current.iter().fold(initial, &op));
        }
        let chunks = num_chunks(len);
        let partials = temp::<D, T>(device, chunks)?;
        device.schedule(
            |c, _| {
                let (start, end) = chunk_bounds(c, len);
                let mut acc = current.get(start);
                for j in start + 1..end {
                    acc = op(acc, current.get(j));
                }
                partials.set(c, acc);
            },
            chunks,
        )?;
        current = partials.as_read();
    }
}

/// Pass 1 of the chunked scans: `totals[c]` is the fold of chunk `c`.
fn chunk_totals<D, T, Op>(device: &D, input: &ReadPortal<T>, op: &Op) -> Result<ReadPortal<T>>
where
    D: DeviceAdapter,
    T: Value,
    Op: Fn(T, T) -> T + Sync + Send,
{
    let n = input.len();
    let chunks = num_chunks(n);
    let totals = temp::<D, T>(device, chunks)?;
    device.schedule(
        |c, _| {
            let (start, end) = chunk_bounds(c, n);
            let mut acc = input.get(start);
            for j in start + 1..end {
                acc = op(acc, input.get(j));
            }
            totals.set(c, acc);
        },
        chunks,
    )?;
    Ok(totals.as_read())
}

pub fn scan_inclusive<D, T, Op>(device: &D, input: &ReadPortal<T>, output: &WritePortal<T>, op: Op) -> Result<T>
where
    D: DeviceAdapter,
    T: Value,
    Op: Fn(T, T) -> T + Sync + Send,
{
    let n = input.len();
    if n == 0 {
        return Ok(T::zeroed());
    }
    ensure_len("scan_inclusive", "output", output.len(), n)?;

    let totals = chunk_totals(device, input, &op)?;
    let chunks = totals.len();

    // carries[c] folds totals[..c]; carries[0] is unused
    let carries = temp::<D, T>(device, chunks)?;
    device.schedule(
        |_, _| {
            let mut acc = totals.get(0);
            for c in 1..chunks {
                carries.set(c, acc);
                acc = op(acc, totals.get(c));
            }
        },
        1,
    )?;

    device.schedule(
        |c, _| {
            let (start, end) = chunk_bounds(c, n);
            let mut acc = if c > 0 { Some(carries.get(c)) } else { None };
            for j in start..end {
                let x = input.get(j);
                let value = match acc {
                    Some(a) => op(a, x),
                    None => x,
                };
                output.set(j, value);
                acc = Some(value);
            }
        },
        chunks,
    )?;
    Ok(output.get(n - 1))
}

pub fn scan_exclusive<D, T, Op>(
    device: &D,
    input: &ReadPortal<T>,
    output: &WritePortal<T>,
    initial: T,
    op: Op,
) -> Result<T>
where
    D: DeviceAdapter,
    T: Value,
    Op: Fn(T, T) -> T + Sync + Send,
{
    let n = input.len();
    if n == 0 {
        return Ok(T::zeroed());
    }
    ensure_len("scan_exclusive", "output", output.len(), n)?;
    // read before an in-place scan overwrites it
    let last_input = input.get(n - 1);

    let totals = chunk_totals(device, input, &op)?;
    let chunks = totals.len();

    let carries = temp::<D, T>(device, chunks)?;
    device.schedule(
        |_, _| {
            let mut acc = initial;
            for c in 0..chunks {
                carries.set(c, acc);
                acc = op(acc, totals.get(c));
            }
        },
        1,
    )?;

    device.schedule(
        |c, _| {
            let (start, end) = chunk_bounds(c, n);
            let mut acc = carries.get(c);
            for j in start..end {
                let x = input.get(j);
                output.set(j, acc);
                acc = op(acc, x);
            }
        },
        chunks,
    )?;
    Ok(op(output.get(n - 1), last_input))
}

/// Segmented scan shared by the by-key variants.
///
/// `seed` selects the flavour: `None` is inclusive, `Some(init)` exclusive
/// with every segment starting from `init`.
fn segmented_scan<D, K, V, Op>(
    device: &D,
    keys: &ReadPortal<K>,
    values: &ReadPortal<V>,
    output: &WritePortal<V>,
    seed: Option<V>,
    op: &Op,
) -> Result<()>
where
    D: DeviceAdapter,
    K: Value,
    V: Value,
    Op: Fn(V, V) -> V + Sync + Send,
{
    let n = keys.len();
    ensure_len("scan_by_key", "values", values.len(), n)?;
    if n == 0 {
        return Ok(());
    }
    ensure_len("scan_by_key", "output", output.len(), n)?;
    let chunks = num_chunks(n);

    // Pass 1: fold since the last segment head inside each chunk.
    let tails = temp::<D, V>(device, chunks)?;
    let has_head = temp::<D, u8>(device, chunks)?;
    device.schedule(
        |c, _| {
            let (start, end) = chunk_bounds(c, n);
            let mut acc = values.get(start);
            let mut head = is_head(keys, start);
            for j in start + 1..end {
                let x = values.get(j);
                if is_head(keys, j) {
                    head = true;
                    acc = x;
                } else {
                    acc = op(acc, x);
                }
            }
            tails.set(c, acc);
            has_head.set(c, head as u8);
        },
        chunks,
    )?;

    // Pass 2: the running segment value flowing into each chunk.
    let carries = temp::<D, V>(device, chunks)?;
    let has_carry = temp::<D, u8>(device, chunks)?;
    device.schedule(
        |_, _| {
            let mut running: Option<V> = None;
            for c in 0..chunks {
                match running {
                    Some(value) => {
                        carries.set(c, value);
                        has_carry.set(c, 1);
                    }
                    None => has_carry.set(c, 0),
                }
                let tail = tails.get(c);
                running = match running {
                    Some(value) if has_head.get(c) == 0 => Some(op(value, tail)),
                    _ => Some(tail),
                };
            }
        },
        1,
    )?;

    // Pass 3: rescan each chunk from its carry.
    device.schedule(
        |c, _| {
            let (start, end) = chunk_bounds(c, n);
            let mut acc = if has_carry.get(c) != 0 {
                Some(carries.get(c))
            } else {
                None
            };
            for j in start..end {
                if is_head(keys, j) {
                    acc = None;
                }
                let x = values.get(j);
                let folded = match acc {
                    Some(a) => op(a, x),
                    None => x,
                };
                match seed {
                    None => output.set(j, folded),
                    Some(init) => output.set(j, acc.map_or(init, |a| op(init, a))),
                }
                acc = Some(folded);
            }
        },
        chunks,
    )
}

pub fn scan_inclusive_by_key<D, K, V, Op>(
    device: &D,
    keys: &ReadPortal<K>,
    values: &ReadPortal<V>,
    output: &WritePortal<V>,
    op: Op,
) -> Result<()>
where
    D: DeviceAdapter,
    K: Value,
    V: Value,
    Op: Fn(V, V) -> V + Sync + Send,
{
    segmented_scan(device, keys, values, output, None, &op)
}

pub fn scan_exclusive_by_key<D, K, V, Op>(
    device: &D,
    keys: &ReadPortal<K>,
    values: &ReadPortal<V>,
    output: &WritePortal<V>,
    initial: V,
    op: Op,
) -> Result<()>
where
    D: DeviceAdapter,
    K: Value,
    V: Value,
    Op: Fn(V, V) -> V + Sync + Send,
{
    segmented_scan(device, keys, values, output, Some(initial), &op)
}

pub fn reduce_by_key<D, K, V, Op>(
    device: &D,
    keys: &ReadPortal<K>,
    values: &ReadPortal<V>,
    keys_output: &WritePortal<K>,
    values_output: &WritePortal<V>,
    op: Op,
) -> Result<Id>
where
    D: DeviceAdapter,
    K: Value,
    V: Value,
    Op: Fn(V, V) -> V + Sync + Send,
{
    let n = keys.len();
    ensure_len("reduce_by_key", "values", values.len(), n)?;
    if n == 0 {
        return Ok(0);
    }

    let partial = temp::<D, V>(device, n)?;
    segmented_scan(device, keys, values, &partial, None, &op)?;

    // segment[j] = number of runs started at or before j
    let segment = temp::<D, Id>(device, n)?;
    device.schedule(|j, _| segment.set(j, is_head(keys, j) as Id), n)?;
    let count = scan_inclusive(device, &segment.as_read(), &segment, |a, b| a + b)?;

    ensure_len("reduce_by_key", "keys output", keys_output.len(), count)?;
    ensure_len("reduce_by_key", "values output", values_output.len(), count)?;
    device.schedule(
        |j, _| {
            let is_tail = j == n - 1 || keys.get(j + 1) != keys.get(j);
            if is_tail {
                let slot = segment.get(j) - 1;
                keys_output.set(slot, keys.get(j));
                values_output.set(slot, partial.get(j));
            }
        },
        n,
    )?;
    Ok(count)
}

// ================================================================================================
// Sorting
// ================================================================================================

/// Run a bitonic sorting network over `n` slots.
///
/// `compare_swap(low, high)` must order the pair so that `low` ends up not
/// greater than `high`. Slots at or past `n` behave as +infinity and are
/// never touched.
fn bitonic_network<D, S>(device: &D, n: Id, compare_swap: S) -> Result<()>
where
    D: DeviceAdapter,
    S: Fn(Id, Id) + Sync,
{
    if n < 2 {
        return Ok(());
    }
    let padded = (n as u64).next_power_of_two() as Id;
    let pairs = padded / 2;

    let mut size = 2;
    while size <= padded {
        // crossover: mirror-image pairs inside each block of `size`
        let half = size / 2;
        device.schedule(
            |t, _| {
                let block = t / half;
                let pos = t % half;
                let low = block * size + pos;
                let high = block * size + size - 1 - pos;
                if high < n {
                    compare_swap(low, high);
                }
            },
            pairs,
        )?;

        // merge: half-cleaners of shrinking stride
        let mut stride = half / 2;
        while stride >= 1 {
            device.schedule(
                |t, _| {
                    let block = t / stride;
                    let pos = t % stride;
                    let low = block * 2 * stride + pos;
                    let high = low + stride;
                    if high < n {
                        compare_swap(low, high);
                    }
                },
                pairs,
            )?;
            stride /= 2;
        }
        size *= 2;
    }
    Ok(())
}

pub fn sort<D, T, C>(device: &D, values: &WritePortal<T>, less: C) -> Result<()>
where
    D: DeviceAdapter,
    T: Value,
    C: Fn(T, T) -> bool + Sync + Send,
{
    bitonic_network(device, values.len(), |low, high| {
        let (a, b) = (values.get(low), values.get(high));
        if less(b, a) {
            values.set(low, b);
            values.set(high, a);
        }
    })
}

pub fn sort_by_key<D, K, V, C>(device: &D, keys: &WritePortal<K>, values: &WritePortal<V>, less: C) -> Result<()>
where
    D: DeviceAdapter,
    K: Value,
    V: Value,
    C: Fn(K, K) -> bool + Sync + Send,
{
    let n = keys.len();
    ensure_len("sort_by_key", "values", values.len(), n)?;
    ensure_distinct_storage(keys, values)?;
    bitonic_network(device, n, |low, high| {
        let (a, b) = (keys.get(low), keys.get(high));
        if less(b, a) {
            keys.set(low, b);
            keys.set(high, a);
            let (va, vb) = (values.get(low), values.get(high));
            values.set(low, vb);
            values.set(high, va);
        }
    })
}

/// `sort_by_key` needs keys and values in separate allocations.
pub fn ensure_distinct_storage<K: Value, V: Value>(keys: &WritePortal<K>, values: &WritePortal<V>) -> Result<()> {
    if same_storage(keys, values) {
        return Err(DeviceError::bad_value("sort_by_key: keys and values share storage"));
    }
    Ok(())
}

/// Whether two portals of possibly different element types share one allocation.
pub fn same_storage<K: Value, V: Value>(keys: &WritePortal<K>, values: &WritePortal<V>) -> bool {
    Arc::as_ptr(keys.storage()) as *const u8 == Arc::as_ptr(values.storage()) as *const u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SerialAdapter;
    use crate::memory::Storage;
    use rand::{Rng, SeedableRng};

    fn read<T: Value>(values: Vec<T>) -> ReadPortal<T> {
        let len = values.len();
        ReadPortal::new(Arc::new(Storage::from_vec(values)), len)
    }

    fn write<T: Value>(len: usize) -> WritePortal<T> {
        WritePortal::new(Arc::new(Storage::host_zeroed(len)), len)
    }

    fn random(len: usize, seed: u64) -> Vec<i64> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1000..1000)).collect()
    }

    // SerialAdapter overrides these; call the general versions directly.
    const DEVICE: SerialAdapter = SerialAdapter;

    #[test]
    fn reduce_spans_several_levels() {
        let data = random(3 * CHUNK as usize * CHUNK as usize / 512 + 17, 1);
        let expected: i64 = data.iter().sum::<i64>() + 5;
        assert_eq!(reduce(&DEVICE, &read(data), 5, |a, b| a + b).unwrap(), expected);
        assert_eq!(reduce(&DEVICE, &read(Vec::<i64>::new()), 9, |a, b| a + b).unwrap(), 9);
    }

    #[test]
    fn scans_match_sequential_across_chunks() {
        let data = random(5 * CHUNK as usize + 3, 2);
        let input = read(data.clone());
        let inclusive = write::<i64>(data.len());
        let exclusive = write::<i64>(data.len());

        let carry_in = scan_inclusive(&DEVICE, &input, &inclusive, |a, b| a + b).unwrap();
        let carry_ex = scan_exclusive(&DEVICE, &input, &exclusive, 10, |a, b| a + b).unwrap();

        let mut running = 0;
        for (i, x) in data.iter().enumerate() {
            assert_eq!(exclusive.get(i as Id), running + 10);
            running += x;
            assert_eq!(inclusive.get(i as Id), running);
        }
        assert_eq!(carry_in, running);
        assert_eq!(carry_ex, running + 10);
    }

    #[test]
    fn non_commutative_scan_keeps_order() {
        // string-free "concatenation": track (first, last) of each range
        let data: Vec<[i32; 2]> = (0..3000).map(|i| [i, i]).collect();
        let input = read(data);
        let out = write::<[i32; 2]>(3000);
        let carry = scan_inclusive(&DEVICE, &input, &out, |a, b| [a[0], b[1]]).unwrap();
        assert_eq!(carry, [0, 2999]);
        assert_eq!(out.get(1500), [0, 1500]);
    }

    #[test]
    fn segmented_scans_restart_per_key_across_chunks() {
        let n = 4 * CHUNK as usize + 9;
        // runs of 700 cross chunk boundaries
        let keys: Vec<i32> = (0..n).map(|i| (i / 700) as i32).collect();
        let values = vec![1_i64; n];
        let inclusive = write::<i64>(n);
        let exclusive = write::<i64>(n);
        scan_inclusive_by_key(&DEVICE, &read(keys.clone()), &read(values.clone()), &inclusive, |a, b| a + b).unwrap();
        scan_exclusive_by_key(&DEVICE, &read(keys), &read(values), &exclusive, 100, |a, b| a + b).unwrap();
        for i in 0..n {
            let pos = (i % 700) as i64;
            assert_eq!(inclusive.get(i as Id), pos + 1, "inclusive at {i}");
            assert_eq!(exclusive.get(i as Id), pos + 100, "exclusive at {i}");
        }
    }

    #[test]
    fn reduce_by_key_sums_runs() {
        let keys = read(vec![0_i32, 0, 4, 4, 4, 1, 0]);
        let values = read(vec![1_i64, 2, 3, 4, 5, 6, 7]);
        let keys_out = write::<i32>(7);
        let values_out = write::<i64>(7);
        let count = reduce_by_key(&DEVICE, &keys, &values, &keys_out, &values_out, |a, b| a + b).unwrap();
        assert_eq!(count, 4);
        assert_eq!(keys_out.to_vec()[..4], [0, 4, 1, 0]);
        assert_eq!(values_out.to_vec()[..4], [3, 12, 6, 7]);
    }

    #[test]
    fn copy_if_and_unique_compact_in_order() {
        let input = read(vec![10_i32, 11, 12, 13, 14]);
        let stencil = read(vec![1_u8, 0, 1, 0, 1]);
        let out = write::<i32>(5);
        assert_eq!(copy_if(&DEVICE, &input, &stencil, &out, |s| s != 0).unwrap(), 3);
        assert_eq!(out.to_vec()[..3], [10, 12, 14]);

        let values = WritePortal::new(Arc::new(Storage::from_vec(vec![1_i32, 1, 2, 2, 2, 3, 1, 1])), 8);
        assert_eq!(unique(&DEVICE, &values, |a, b| a == b).unwrap(), 4);
        assert_eq!(values.to_vec()[..4], [1, 2, 3, 1]);
    }

    #[test]
    fn bitonic_sort_handles_non_power_of_two() {
        for len in [0_usize, 1, 2, 3, 5, 17, 100, 1000, 1025] {
            let data = random(len, len as u64);
            let values = WritePortal::new(Arc::new(Storage::from_vec(data.clone())), len);
            sort(&DEVICE, &values, |a, b| a < b).unwrap();
            let mut expected = data;
            expected.sort();
            assert_eq!(values.to_vec(), expected, "len {len}");
        }
    }

    #[test]
    fn sort_by_key_moves_values_with_keys() {
        let keys = WritePortal::new(Arc::new(Storage::from_vec(vec![3_i32, 1, 2, 0, 4])), 5);
        let values = WritePortal::new(Arc::new(Storage::from_vec(vec![30_u64, 10, 20, 0, 40])), 5);
        sort_by_key(&DEVICE, &keys, &values, |a, b| a > b).unwrap();
        assert_eq!(keys.to_vec(), vec![4, 3, 2, 1, 0]);
        assert_eq!(values.to_vec(), vec![40, 30, 20, 10, 0]);
    }

    #[test]
    fn bounds_follow_insertion_points() {
        let sorted = read(vec![1_i32, 3, 3, 3, 7]);
        let queries = read(vec![0, 3, 4, 8]);
        let lower = write::<Id>(4);
        let upper = write::<Id>(4);
        lower_bounds(&DEVICE, &sorted, &queries, &lower, |a, b| a < b).unwrap();
        upper_bounds(&DEVICE, &sorted, &queries, &upper, |a, b| a < b).unwrap();
        assert_eq!(lower.to_vec(), vec![0, 1, 4, 5]);
        assert_eq!(upper.to_vec(), vec![0, 4, 4, 5]);
    }

    #[test]
    fn sub_range_validation() {
        let input = read(vec![1_i32, 2, 3]);
        let out = write::<i32>(2);
        assert!(copy_sub_range(&DEVICE, &input, 1, 2, &out, 0).is_ok());
        assert_eq!(out.to_vec(), vec![2, 3]);
        assert!(matches!(
            copy_sub_range(&DEVICE, &input, 0, 3, &out, 0),
            Err(DeviceError::BadValue(_))
        ));
        assert!(matches!(
            copy_sub_range(&DEVICE, &input, -1, 1, &out, 0),
            Err(DeviceError::BadValue(_))
        ));
    }
}
