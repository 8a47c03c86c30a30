//! Threaded device adapter
//!
//! Schedules kernels across a rayon thread pool on host memory. Indices are
//! split into work items of at least `grain_size` invocations so that cheap
//! kernels are not dominated by task overhead.
//!
//! Primitives with a natural rayon form (copies, reductions, compaction,
//! sorting, searches) are overridden; the scans use the chunked
//! implementations from [`crate::adapters::general`], whose per-chunk passes
//! already run in parallel through [`ThreadedAdapter::schedule`].

use std::sync::Arc;

use rayon::prelude::*;
use strata_tracing::performance::record_throughput;
use strata_tracing::{perf_span, timed_block};

use crate::adapter::{DeviceAdapter, DeviceAdapterId, Id, Id3, MemorySpace, Value};
use crate::adapters::general::{self, ensure_len};
use crate::adapters::serial::ordering;
use crate::config::{ThreadedConfig, DEFAULT_GRAIN_SIZE};
use crate::error::{catch_execution, DeviceError, Result};
use crate::error_buffer::ErrorMessageBuffer;
use crate::memory::Storage;
use crate::portal::{ReadPortal, WritePortal};

/// Rayon-backed adapter on host memory
#[derive(Clone)]
pub struct ThreadedAdapter {
    /// Dedicated pool; `None` runs on rayon's global pool
    pool: Option<Arc<rayon::ThreadPool>>,
    grain: usize,
}

impl ThreadedAdapter {
    /// Adapter on rayon's global pool with the default grain size
    pub fn new() -> Self {
        Self {
            pool: None,
            grain: DEFAULT_GRAIN_SIZE,
        }
    }

    /// Adapter with its own pool when `config.num_threads` is set.
    pub fn with_config(config: &ThreadedConfig) -> Result<Self> {
        if config.grain_size == 0 {
            return Err(DeviceError::config("threaded.grain_size must be at least 1"));
        }
        let pool = match config.num_threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("strata-worker-{i}"))
                    .build()
                    .map_err(|err| DeviceError::bad_device(format!("threaded pool: {err}")))?;
                tracing::debug!(threads, grain = config.grain_size, "created threaded adapter pool");
                Some(Arc::new(pool))
            }
            None => None,
        };
        Ok(Self {
            pool,
            grain: config.grain_size,
        })
    }

    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    pub fn grain_size(&self) -> usize {
        self.grain
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

impl Default for ThreadedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ThreadedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedAdapter")
            .field("threads", &self.num_threads())
            .field("grain", &self.grain)
            .finish()
    }
}

fn to_len(num_instances: Id) -> Result<usize> {
    usize::try_from(num_instances).map_err(|_| {
        DeviceError::bad_value(format!(
            "cannot schedule a negative number of instances ({num_instances})"
        ))
    })
}

impl DeviceAdapter for ThreadedAdapter {
    fn id(&self) -> DeviceAdapterId {
        DeviceAdapterId::Threaded
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
        let n = to_len(num_instances)?;
        if n == 0 {
            return Ok(());
        }
        let _span = perf_span!("threaded_schedule", n = n as u64, threads = self.num_threads() as u64);
        let errors = ErrorMessageBuffer::new();
        let (launched, duration_us) = timed_block!("threaded_schedule", {
            catch_execution("schedule", || {
                self.install(|| {
                    (0..n)
                        .into_par_iter()
                        .with_min_len(self.grain)
                        .for_each(|i| kernel(i as Id, &errors))
                });
                Ok(())
            })
        });
        launched?;
        record_throughput("threaded_schedule", n as u64, duration_us);
        errors.check()
    }

    fn schedule_3d<F>(&self, kernel: F, range: Id3) -> Result<()>
    where
        F: Fn(Id3, &ErrorMessageBuffer) + Sync,
    {
        let [x, y, z] = [to_len(range[0])?, to_len(range[1])?, to_len(range[2])?];
        let total = x * y * z;
        if total == 0 {
            return Ok(());
        }
        let _span = perf_span!("threaded_schedule_3d", x = x as u64, y = y as u64, z = z as u64);
        let errors = ErrorMessageBuffer::new();
        let (launched, duration_us) = timed_block!("threaded_schedule_3d", {
            catch_execution("schedule_3d", || {
                self.install(|| {
                    (0..total).into_par_iter().with_min_len(self.grain).for_each(|flat| {
                        let index = [(flat % x) as Id, ((flat / x) % y) as Id, (flat / (x * y)) as Id];
                        kernel(index, &errors)
                    })
                });
                Ok(())
            })
        });
        launched?;
        record_throughput("threaded_schedule_3d", total as u64, duration_us);
        errors.check()
    }

    // ============================================================================================
    // Primitives
    // ============================================================================================

    fn copy<T: Value>(&self, input: &ReadPortal<T>, output: &WritePortal<T>) -> Result<()> {
        catch_execution("copy", || {
            ensure_len("copy", "output", output.len(), input.len())?;
            self.install(|| {
                (0..input.len() as usize)
                    .into_par_iter()
                    .with_min_len(self.grain)
                    .for_each(|i| output.set(i as Id, input.get(i as Id)))
            });
            Ok(())
        })
    }

    fn fill<T: Value>(&self, output: &WritePortal<T>, value: T) -> Result<()> {
        catch_execution("fill", || {
            self.install(|| {
                (0..output.len() as usize)
                    .into_par_iter()
                    .with_min_len(self.grain)
                    .for_each(|i| output.set(i as Id, value))
            });
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
            let kept: Vec<T> = self.install(|| {
                (0..input.len() as usize)
                    .into_par_iter()
                    .with_min_len(self.grain)
                    .filter(|&i| predicate(stencil.get(i as Id)))
                    .map(|i| input.get(i as Id))
                    .collect()
            });
            ensure_len("copy_if", "output", output.len(), kept.len() as Id)?;
            for (i, value) in kept.iter().enumerate() {
                output.set(i as Id, *value);
            }
            Ok(kept.len() as Id)
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
            self.install(|| {
                (0..values.len() as usize).into_par_iter().for_each(|i| {
                    let i = i as Id;
                    output.set(i, general::lower_bound_index(sorted, values.get(i), &less))
                })
            });
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
            self.install(|| {
                (0..values.len() as usize).into_par_iter().for_each(|i| {
                    let i = i as Id;
                    output.set(i, general::upper_bound_index(sorted, values.get(i), &less))
                })
            });
            Ok(())
        })
    }

    fn reduce<T, Op>(&self, input: &ReadPortal<T>, initial: T, op: Op) -> Result<T>
    where
        T: Value,
        Op: Fn(T, T) -> T + Sync + Send,
    {
        catch_execution("reduce", || {
            let folded = self.install(|| {
                (0..input.len() as usize)
                    .into_par_iter()
                    .with_min_len(self.grain)
                    .map(|i| input.get(i as Id))
                    .reduce_with(&op)
            });
            Ok(folded.map_or(initial, |value| op(initial, value)))
        })
    }

    fn sort<T, C>(&self, values: &WritePortal<T>, less: C) -> Result<()>
    where
        T: Value,
        C: Fn(T, T) -> bool + Sync + Send,
    {
        catch_execution("sort", || {
            let mut host = values.to_vec();
            self.install(|| {
                host.par_sort_by(|&a, &b| ordering(&less, a, b));
                host.par_iter()
                    .enumerate()
                    .for_each(|(i, &value)| values.set(i as Id, value));
            });
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
            self.install(|| {
                pairs.par_sort_by(|a, b| ordering(&less, a.0, b.0));
                pairs.par_iter().enumerate().for_each(|(i, &(key, value))| {
                    keys.set(i as Id, key);
                    values.set(i as Id, value);
                });
            });
            Ok(())
        })
    }
}
