//! Runtime configuration for the device adapters.
//!
//! Configuration is plain serde data so it can be loaded from JSON, and every
//! field can be overridden through `STRATA_*` environment variables:
//!
//! | variable | field |
//! |---|---|
//! | `STRATA_DEVICE` | `device` (`serial`, `threaded`, `accelerator`) |
//! | `STRATA_NUM_THREADS` | `threaded.num_threads` |
//! | `STRATA_GRAIN_SIZE` | `threaded.grain_size` |
//! | `STRATA_ACCEL_ENABLED` | `accelerator.enabled` |
//! | `STRATA_ACCEL_BLOCK_SIZE` | `accelerator.block_size` |
//! | `STRATA_ACCEL_MAX_GRID_X` | `accelerator.max_grid[0]` |
//! | `STRATA_ACCEL_COMPUTE_UNITS` | `accelerator.compute_units` |
//! | `STRATA_ACCEL_MEMORY_BYTES` | `accelerator.memory_capacity_bytes` |

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::adapter::DeviceAdapterId;
use crate::error::{DeviceError, Result};

/// Threads per block for 1-D accelerator launches
pub const DEFAULT_BLOCK_SIZE: u32 = 128;

/// Largest X grid of current accelerators (`2^31 - 1`)
pub const DEFAULT_MAX_GRID_X: u32 = i32::MAX as u32;

/// Y/Z grid limit, also the X limit of older accelerators
pub const LEGACY_MAX_GRID: u32 = 65_535;

/// Indices handed to one rayon task at minimum
pub const DEFAULT_GRAIN_SIZE: usize = 1024;

/// Top-level runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Force runtime dispatch onto one adapter instead of trying by priority
    pub device: Option<DeviceAdapterId>,
    pub threaded: ThreadedConfig,
    pub accelerator: AcceleratorConfig,
}

/// Settings of the threaded adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadedConfig {
    /// Worker count; `None` shares rayon's global pool
    pub num_threads: Option<usize>,
    pub grain_size: usize,
}

impl Default for ThreadedConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            grain_size: DEFAULT_GRAIN_SIZE,
        }
    }
}

/// Properties of the simulated accelerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    pub enabled: bool,
    /// Threads per block for 1-D schedules
    pub block_size: u32,
    /// Maximum blocks per dispatch along each axis
    pub max_grid: [u32; 3],
    /// Parallel block executors; `None` uses the available parallelism
    pub compute_units: Option<usize>,
    /// Device memory capacity; `None` is unbounded
    pub memory_capacity_bytes: Option<usize>,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_size: DEFAULT_BLOCK_SIZE,
            max_grid: [DEFAULT_MAX_GRID_X, LEGACY_MAX_GRID, LEGACY_MAX_GRID],
            compute_units: None,
            memory_capacity_bytes: None,
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|err| DeviceError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `STRATA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| DeviceError::config(err.to_string()))
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(device) = env_parse::<DeviceAdapterId>("STRATA_DEVICE")? {
            self.device = Some(device);
        }
        if let Some(threads) = env_parse::<usize>("STRATA_NUM_THREADS")? {
            self.threaded.num_threads = Some(threads);
        }
        if let Some(grain) = env_parse::<usize>("STRATA_GRAIN_SIZE")? {
            self.threaded.grain_size = grain;
        }
        if let Some(enabled) = env_parse::<bool>("STRATA_ACCEL_ENABLED")? {
            self.accelerator.enabled = enabled;
        }
        if let Some(block) = env_parse::<u32>("STRATA_ACCEL_BLOCK_SIZE")? {
            self.accelerator.block_size = block;
        }
        if let Some(max_x) = env_parse::<u32>("STRATA_ACCEL_MAX_GRID_X")? {
            self.accelerator.max_grid[0] = max_x;
        }
        if let Some(units) = env_parse::<usize>("STRATA_ACCEL_COMPUTE_UNITS")? {
            self.accelerator.compute_units = Some(units);
        }
        if let Some(bytes) = env_parse::<usize>("STRATA_ACCEL_MEMORY_BYTES")? {
            self.accelerator.memory_capacity_bytes = Some(bytes);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.threaded.num_threads == Some(0) {
            return Err(DeviceError::config("threaded.num_threads must be at least 1"));
        }
        if self.threaded.grain_size == 0 {
            return Err(DeviceError::config("threaded.grain_size must be at least 1"));
        }
        self.accelerator.validate()
    }
}

impl AcceleratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > 1024 {
            return Err(DeviceError::config(format!(
                "accelerator.block_size must be in 1..=1024, got {}",
                self.block_size
            )));
        }
        if self.max_grid.contains(&0) {
            return Err(DeviceError::config(format!(
                "accelerator.max_grid must be non-zero on every axis, got {:?}",
                self.max_grid
            )));
        }
        if self.compute_units == Some(0) {
            return Err(DeviceError::config("accelerator.compute_units must be at least 1"));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| DeviceError::config(format!("{key}={raw:?} could not be parsed"))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 8] = [
        "STRATA_DEVICE",
        "STRATA_NUM_THREADS",
        "STRATA_GRAIN_SIZE",
        "STRATA_ACCEL_ENABLED",
        "STRATA_ACCEL_BLOCK_SIZE",
        "STRATA_ACCEL_MAX_GRID_X",
        "STRATA_ACCEL_COMPUTE_UNITS",
        "STRATA_ACCEL_MEMORY_BYTES",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_accelerator_limits() {
        let config = RuntimeConfig::default();
        assert_eq!(config.accelerator.block_size, 128);
        assert_eq!(config.accelerator.max_grid, [2_147_483_647, 65_535, 65_535]);
        assert!(config.device.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_fills_missing_fields() {
        let config = RuntimeConfig::from_json_str(
            r#"{ "device": "threaded", "accelerator": { "max_grid": [4, 2, 2] } }"#,
        )
        .unwrap();
        assert_eq!(config.device, Some(DeviceAdapterId::Threaded));
        assert_eq!(config.accelerator.max_grid, [4, 2, 2]);
        assert_eq!(config.accelerator.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.threaded.grain_size, DEFAULT_GRAIN_SIZE);
    }

    #[test]
    fn json_roundtrip_preserves_values() {
        let mut config = RuntimeConfig::default();
        config.accelerator.memory_capacity_bytes = Some(1 << 20);
        let json = config.to_json_string().unwrap();
        assert_eq!(RuntimeConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(RuntimeConfig::from_json_str(r#"{ "accelerator": { "block_size": 0 } }"#).is_err());
        assert!(RuntimeConfig::from_json_str(r#"{ "accelerator": { "max_grid": [0, 1, 1] } }"#).is_err());
        assert!(RuntimeConfig::from_json_str(r#"{ "threaded": { "num_threads": 0 } }"#).is_err());
        assert!(RuntimeConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("STRATA_DEVICE", "serial");
        env::set_var("STRATA_NUM_THREADS", "3");
        env::set_var("STRATA_ACCEL_MAX_GRID_X", "65535");
        env::set_var("STRATA_ACCEL_ENABLED", "false");

        let config = RuntimeConfig::from_env();
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.device, Some(DeviceAdapterId::Serial));
        assert_eq!(config.threaded.num_threads, Some(3));
        assert_eq!(config.accelerator.max_grid[0], LEGACY_MAX_GRID);
        assert!(!config.accelerator.enabled);
    }

    #[test]
    fn malformed_env_is_a_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("STRATA_GRAIN_SIZE", "lots");

        let result = RuntimeConfig::from_env();
        clear_env();

        assert!(matches!(result, Err(DeviceError::Config(_))));
    }
}
