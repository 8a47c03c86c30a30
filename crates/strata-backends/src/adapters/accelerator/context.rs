//! Per-device state of the accelerator: memory ledger, block executors and
//! the error buffers handed to launches.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::{AcceleratorConfig, RuntimeConfig};
use crate::error::{DeviceError, Result};
use crate::error_buffer::ErrorMessageBuffer;
use crate::memory::{MemoryLedger, MemoryStats};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0);

/// Launch and memory counters of one accelerator context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceleratorStats {
    /// Schedule calls that reached the device
    pub launches: u64,
    /// Grid dispatches issued; larger than `launches` when grids were split
    pub dispatches: u64,
    pub memory: MemoryStats,
}

pub struct AcceleratorContext {
    config: AcceleratorConfig,
    device_id: u64,
    /// Idle error buffers; the lock is only taken to lease or return one
    errors: Mutex<Vec<Box<ErrorMessageBuffer>>>,
    ledger: Arc<MemoryLedger>,
    /// Block executors; `None` when the device could not be brought up
    pool: Option<rayon::ThreadPool>,
    launches: AtomicU64,
    dispatches: AtomicU64,
}

impl AcceleratorContext {
    pub fn new(config: AcceleratorConfig) -> Result<Self> {
        config.validate()?;
        let device_id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);

        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(move |i| format!("strata-accel{device_id}-{i}"));
        if let Some(units) = config.compute_units {
            builder = builder.num_threads(units);
        }
        let pool = builder
            .build()
            .map_err(|err| DeviceError::bad_device(format!("accelerator {device_id}: {err}")))?;

        tracing::debug!(
            device_id,
            enabled = config.enabled,
            block_size = config.block_size,
            max_grid = ?config.max_grid,
            compute_units = pool.current_num_threads(),
            "accelerator context created"
        );

        Ok(Self {
            ledger: Arc::new(MemoryLedger::new(config.memory_capacity_bytes)),
            config,
            device_id,
            errors: Mutex::new(Vec::new()),
            pool: Some(pool),
            launches: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
        })
    }

    /// A context that reports itself unavailable.
    fn unavailable(mut config: AcceleratorConfig) -> Self {
        config.enabled = false;
        Self {
            ledger: Arc::new(MemoryLedger::new(config.memory_capacity_bytes)),
            config,
            device_id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            errors: Mutex::new(Vec::new()),
            pool: None,
            launches: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
        }
    }

    /// The process-wide context, configured from the environment on first use.
    ///
    /// A malformed environment falls back to the default configuration; a
    /// device that cannot start is kept but reports itself unavailable.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<AcceleratorContext>> = OnceLock::new();
        let context = GLOBAL.get_or_init(|| {
            let config = match RuntimeConfig::from_env() {
                Ok(runtime) => runtime.accelerator,
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring accelerator environment overrides");
                    AcceleratorConfig::default()
                }
            };
            let context = match Self::new(config.clone()) {
                Ok(context) => context,
                Err(err) => {
                    tracing::warn!(error = %err, "accelerator unavailable");
                    Self::unavailable(config)
                }
            };
            Arc::new(context)
        });
        Arc::clone(context)
    }

    pub fn config(&self) -> &AcceleratorConfig {
        &self.config
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    pub fn is_available(&self) -> bool {
        self.config.enabled && self.pool.is_some()
    }

    pub(super) fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(DeviceError::bad_device(format!("accelerator {} is not available", self.device_id)))
        }
    }

    /// Run `op` on the block executors.
    pub(super) fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Run `launch` with a cleared error buffer leased from the device.
    ///
    /// Concurrent or nested launches each get their own buffer.
    pub(super) fn with_error_buffer<R>(&self, launch: impl FnOnce(&ErrorMessageBuffer) -> R) -> R {
        let mut buffer = self
            .errors
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(ErrorMessageBuffer::new()));
        buffer.clear();
        let result = launch(&buffer);
        self.errors.lock().push(buffer);
        result
    }

    pub(super) fn count_launch(&self, dispatches: u64) {
        self.launches.fetch_add(1, Ordering::Relaxed);
        self.dispatches.fetch_add(dispatches, Ordering::Relaxed);
    }

    pub fn stats(&self) -> AcceleratorStats {
        AcceleratorStats {
            launches: self.launches.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            memory: self.ledger.stats(),
        }
    }
}

impl fmt::Debug for AcceleratorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorContext")
            .field("device_id", &self.device_id)
            .field("available", &self.is_available())
            .field("config", &self.config)
            .finish()
    }
}
