//! Accelerator device adapter
//!
//! Models a discrete device with its own memory space and a block/grid
//! execution model:
//!
//! ```text
//! AcceleratorAdapter
//! ├── AcceleratorContext  - device id, config, error buffers
//! ├── MemoryLedger        - device allocations + H2D/D2H accounting
//! └── Block executors     - rayon pool; one task per block
//! ```
//!
//! A 1-D schedule of `n` instances runs in blocks of `block_size` threads.
//! When the grid would exceed `max_grid[0]` blocks, it is issued as several
//! dispatches of exactly `max_grid[0]` blocks each, shifted by
//! `block_size * max_grid[0]` indices; threads past `n` are masked. A 3-D
//! schedule picks its block shape from the extent (see
//! [`BlockDim::for_extent`]) and tiles each grid axis that exceeds its limit.
//!
//! All primitives use the implementations in [`crate::adapters::general`],
//! so everything that runs here goes through the block scheduler.

mod context;

pub use context::{AcceleratorContext, AcceleratorStats};

use std::sync::Arc;

use rayon::prelude::*;
use strata_tracing::performance::record_throughput;
use strata_tracing::{perf_event, perf_span, timed_block};

use crate::adapter::{BlockDim, DeviceAdapter, DeviceAdapterId, GridDim, Id, Id3, LaunchConfig, MemorySpace, Value};
use crate::config::AcceleratorConfig;
use crate::error::{catch_execution, DeviceError, Result};
use crate::error_buffer::ErrorMessageBuffer;
use crate::memory::Storage;

/// Handle to an accelerator context
#[derive(Debug, Clone)]
pub struct AcceleratorAdapter {
    ctx: Arc<AcceleratorContext>,
}

impl AcceleratorAdapter {
    /// The process-wide accelerator
    pub fn new() -> Self {
        Self {
            ctx: AcceleratorContext::global(),
        }
    }

    /// A separate accelerator with its own memory space and limits.
    pub fn with_config(config: AcceleratorConfig) -> Result<Self> {
        Ok(Self {
            ctx: Arc::new(AcceleratorContext::new(config)?),
        })
    }

    pub fn context(&self) -> &Arc<AcceleratorContext> {
        &self.ctx
    }

    pub fn stats(&self) -> AcceleratorStats {
        self.ctx.stats()
    }
}

impl Default for AcceleratorAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `blocks` along one axis into `(first_block, count)` tiles of at most `max`.
fn axis_tiles(blocks: u32, max: u32) -> Vec<(u32, u32)> {
    let max = max.max(1);
    (0..blocks)
        .step_by(max as usize)
        .map(|start| (start, max.min(blocks - start)))
        .collect()
}

fn non_negative(value: Id, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| DeviceError::bad_value(format!("cannot schedule a negative {what} ({value})")))
}

impl DeviceAdapter for AcceleratorAdapter {
    fn id(&self) -> DeviceAdapterId {
        DeviceAdapterId::Accelerator
    }

    fn is_available(&self) -> bool {
        self.ctx.is_available()
    }

    fn memory_space(&self) -> MemorySpace {
        MemorySpace::Device(self.ctx.device_id())
    }

    fn allocate<T: Value>(&self, len: usize) -> Result<Arc<Storage<T>>> {
        self.ctx.ensure_available()?;
        let storage = Storage::zeroed_in(len, self.memory_space(), Arc::clone(self.ctx.ledger()))?;
        Ok(Arc::new(storage))
    }

    fn schedule<F>(&self, kernel: F, num_instances: Id) -> Result<()>
    where
        F: Fn(Id, &ErrorMessageBuffer) + Sync,
    {
        self.ctx.ensure_available()?;
        let n = non_negative(num_instances, "number of instances")?;
        if n == 0 {
            return Ok(());
        }

        let config = self.ctx.config();
        let block = config.block_size as u64;
        let dispatches = LaunchConfig::split_linear(n, config.block_size, config.max_grid[0]);
        let _span = perf_span!(
            "accelerator_schedule",
            n = n,
            block = block,
            dispatches = dispatches.len() as u64
        );

        self.ctx.with_error_buffer(|errors| {
            let (launched, duration_us) = timed_block!("accelerator_schedule", {
                catch_execution("schedule", || {
                    for &(offset, blocks) in &dispatches {
                        if errors.is_raised() {
                            break;
                        }
                        perf_event!("dispatch", offset = offset, blocks = blocks as u64);
                        self.ctx.install(|| {
                            (0..blocks).into_par_iter().for_each(|b| {
                                let base = offset + b as u64 * block;
                                for thread in 0..block {
                                    let index = base + thread;
                                    if index < n {
                                        kernel(index as Id, errors);
                                    }
                                }
                            })
                        });
                    }
                    Ok(())
                })
            });
            launched?;
            record_throughput("accelerator_schedule", n, duration_us);
            self.ctx.count_launch(dispatches.len() as u64);
            errors.check()
        })
    }

    fn schedule_3d<F>(&self, kernel: F, range: Id3) -> Result<()>
    where
        F: Fn(Id3, &ErrorMessageBuffer) + Sync,
    {
        self.ctx.ensure_available()?;
        for axis in range {
            non_negative(axis, "extent")?;
        }
        if range.contains(&0) {
            return Ok(());
        }

        let launch = LaunchConfig::for_extent(range)?;
        let BlockDim { x: bx, y: by, z: bz } = launch.block;
        let max = self.ctx.config().max_grid;
        let tiles_x = axis_tiles(launch.grid.x, max[0]);
        let tiles_y = axis_tiles(launch.grid.y, max[1]);
        let tiles_z = axis_tiles(launch.grid.z, max[2]);
        let total_dispatches = (tiles_x.len() * tiles_y.len() * tiles_z.len()) as u64;
        let _span = perf_span!(
            "accelerator_schedule_3d",
            launch = tracing::field::display(launch),
            dispatches = total_dispatches
        );

        self.ctx.with_error_buffer(|errors| {
            let run_tile = |origin: [u32; 3], grid: GridDim| {
                let blocks = grid.total_blocks();
                (0..blocks).into_par_iter().for_each(|flat| {
                    let block_x = origin[0] as u64 + flat % grid.x as u64;
                    let block_y = origin[1] as u64 + (flat / grid.x as u64) % grid.y as u64;
                    let block_z = origin[2] as u64 + flat / (grid.x as u64 * grid.y as u64);
                    for tz in 0..bz as u64 {
                        for ty in 0..by as u64 {
                            for tx in 0..bx as u64 {
                                let index = [
                                    (block_x * bx as u64 + tx) as Id,
                                    (block_y * by as u64 + ty) as Id,
                                    (block_z * bz as u64 + tz) as Id,
                                ];
                                if index[0] < range[0] && index[1] < range[1] && index[2] < range[2] {
                                    kernel(index, errors);
                                }
                            }
                        }
                    }
                })
            };

            let (launched, duration_us) = timed_block!("accelerator_schedule_3d", {
                catch_execution("schedule_3d", || {
                    for &(oz, gz) in &tiles_z {
                        for &(oy, gy) in &tiles_y {
                            for &(ox, gx) in &tiles_x {
                                if errors.is_raised() {
                                    return Ok(());
                                }
                                let grid = GridDim::new(gx, gy, gz);
                                perf_event!(
                                    "dispatch_3d",
                                    origin = tracing::field::debug([ox, oy, oz]),
                                    grid = tracing::field::display(grid)
                                );
                                self.ctx.install(|| run_tile([ox, oy, oz], grid));
                            }
                        }
                    }
                    Ok(())
                })
            });
            launched?;
            record_throughput("accelerator_schedule_3d", (range[0] * range[1] * range[2]) as u64, duration_us);
            self.ctx.count_launch(total_dispatches);
            errors.check()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::TransferDirection;
    use crate::memory::transfer;
    use crate::portal::WritePortal;

    fn device(max_grid: [u32; 3]) -> AcceleratorAdapter {
        AcceleratorAdapter::with_config(AcceleratorConfig {
            block_size: 4,
            max_grid,
            compute_units: Some(2),
            ..AcceleratorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn axis_tiles_cover_exactly() {
        assert_eq!(axis_tiles(5, 2), vec![(0, 2), (2, 2), (4, 1)]);
        assert_eq!(axis_tiles(3, 8), vec![(0, 3)]);
        assert!(axis_tiles(0, 8).is_empty());
    }

    #[test]
    fn oversized_grid_is_split_into_full_width_dispatches() {
        let accel = device([3, 2, 2]);
        let n = 50;
        let out = WritePortal::new(accel.allocate::<i64>(n as usize).unwrap(), n as usize);
        accel.schedule(|i, _| out.set(i, out.get(i) + i + 1), n).unwrap();
        assert_eq!(out.to_vec(), (1..=n).collect::<Vec<_>>());
        // 13 blocks of 4 over a 3-block limit: ceil(50 / 12) dispatches
        let stats = accel.stats();
        assert_eq!(stats.launches, 1);
        assert_eq!(stats.dispatches, 5);
    }

    #[test]
    fn small_grid_uses_one_dispatch() {
        let accel = device([100, 2, 2]);
        accel.schedule(|_, _| {}, 10).unwrap();
        assert_eq!(accel.stats().dispatches, 1);
    }

    #[test]
    fn schedule_3d_masks_and_tiles() {
        let accel = device([1, 1, 1]);
        let extent = [70, 3, 5];
        let total = (extent[0] * extent[1] * extent[2]) as usize;
        let hits = WritePortal::new(accel.allocate::<u32>(total).unwrap(), total);
        accel
            .schedule_3d(
                |[i, j, k], _| {
                    let flat = i + extent[0] * (j + extent[1] * k);
                    hits.set(flat, hits.get(flat) + 1);
                },
                extent,
            )
            .unwrap();
        assert!(hits.to_vec().iter().all(|&h| h == 1));
        // (64, 2, 1) blocks -> grid (2, 2, 5), one dispatch per block
        assert_eq!(accel.stats().dispatches, 20);
    }

    #[test]
    fn kernel_errors_surface_after_join() {
        let accel = device([2, 2, 2]);
        let result = accel.schedule(
            |i, errors| {
                if i == 17 {
                    errors.raise("instance 17 failed");
                }
            },
            40,
        );
        assert_eq!(result, Err(DeviceError::Execution("instance 17 failed".into())));
        // the buffer is cleared for the next launch
        assert!(accel.schedule(|_, _| {}, 40).is_ok());
    }

    #[test]
    fn kernels_can_launch_on_their_own_device() {
        let accel = device([2, 2, 2]);
        let out = WritePortal::new(accel.allocate::<i64>(8).unwrap(), 8);
        accel
            .schedule(
                |i, errors| {
                    let inner = accel.schedule(|j, _| out.set(i * 2 + j, i * 10 + j), 2);
                    if let Err(err) = inner {
                        errors.raise(err.to_string());
                    }
                },
                4,
            )
            .unwrap();
        assert_eq!(out.to_vec(), vec![0, 1, 10, 11, 20, 21, 30, 31]);

        let result = accel.schedule(
            |i, errors| {
                let inner = accel.schedule(
                    |j, inner_errors| {
                        if i == 3 && j == 1 {
                            inner_errors.raise("nested launch failed");
                        }
                    },
                    2,
                );
                if let Err(err) = inner {
                    errors.raise(err.to_string());
                }
            },
            4,
        );
        assert!(matches!(result, Err(DeviceError::Execution(msg)) if msg.contains("nested launch failed")));
    }

    #[test]
    fn memory_is_device_resident_and_accounted() {
        let accel = device([8, 8, 8]);
        let host = Storage::from_vec(vec![1.5_f32, 2.5, 3.5]);
        let on_device = accel.upload(&host, 3).unwrap();
        assert_eq!(on_device.space(), accel.memory_space());
        assert!(!on_device.space().is_host());

        let back = Storage::<f32>::host_zeroed(3);
        transfer(&on_device, &back, 3, TransferDirection::DeviceToHost).unwrap();
        assert_eq!(back.to_vec(3), vec![1.5, 2.5, 3.5]);

        let memory = accel.stats().memory;
        assert_eq!(memory.bytes_in_use, 12);
        assert_eq!(memory.host_to_device_bytes, 12);
        assert_eq!(memory.device_to_host_bytes, 12);
    }

    #[test]
    fn capacity_limits_allocation() {
        let accel = AcceleratorAdapter::with_config(AcceleratorConfig {
            memory_capacity_bytes: Some(64),
            ..AcceleratorConfig::default()
        })
        .unwrap();
        assert!(accel.allocate::<u64>(8).is_ok());
        assert!(matches!(
            accel.allocate::<u64>(9),
            Err(DeviceError::OutOfMemory { requested: 72, .. })
        ));
    }

    #[test]
    fn disabled_accelerator_refuses_work() {
        let accel = AcceleratorAdapter::with_config(AcceleratorConfig {
            enabled: false,
            ..AcceleratorConfig::default()
        })
        .unwrap();
        assert!(!accel.is_available());
        assert!(matches!(accel.schedule(|_, _| {}, 1), Err(DeviceError::BadDevice(_))));
        assert!(matches!(accel.allocate::<u8>(1), Err(DeviceError::BadDevice(_))));
    }

    #[test]
    fn primitives_run_through_the_block_scheduler() {
        let accel = device([2, 2, 2]);
        let n = 3000_usize;
        let input = WritePortal::new(accel.allocate::<i64>(n).unwrap(), n);
        accel.schedule(|i, _| input.set(i, i), n as Id).unwrap();
        let sum = accel.reduce(&input.as_read(), 0, |a, b| a + b).unwrap();
        assert_eq!(sum, (0..n as i64).sum::<i64>());
        assert!(accel.stats().dispatches > accel.stats().launches);
    }
}
