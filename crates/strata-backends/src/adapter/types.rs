//! Index, device and launch geometry types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Signed index and size type used throughout the runtime
pub type Id = i64;

/// Small signed integer used for per-point counts
pub type IdComponent = i32;

/// A 3-D index or extent, ordered `[x, y, z]`
pub type Id3 = [Id; 3];

/// Element types that can live in device arrays.
///
/// `Pod` gives a well-defined all-zero value and byte copies between memory
/// spaces.
pub trait Value: bytemuck::Pod + Default + PartialEq + fmt::Debug + Send + Sync {}

impl<T> Value for T where T: bytemuck::Pod + Default + PartialEq + fmt::Debug + Send + Sync {}

/// Identifies one of the supported device adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAdapterId {
    /// Single thread, plain loops
    Serial,
    /// Shared-memory CPU parallelism
    Threaded,
    /// Discrete accelerator with its own memory space
    Accelerator,
}

impl DeviceAdapterId {
    /// Every adapter, in runtime selection priority order
    pub const PRIORITY: [DeviceAdapterId; 3] = [Self::Accelerator, Self::Threaded, Self::Serial];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Threaded => "threaded",
            Self::Accelerator => "accelerator",
        }
    }
}

impl fmt::Display for DeviceAdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceAdapterId {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "threaded" | "openmp" | "tbb" => Ok(Self::Threaded),
            "accelerator" | "cuda" | "gpu" => Ok(Self::Accelerator),
            other => Err(DeviceError::bad_device(format!("unknown device adapter '{other}'"))),
        }
    }
}

/// Where a buffer physically lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    /// Ordinary host memory, directly usable by the control side
    Host,
    /// Memory of the accelerator context with the given id
    Device(u64),
}

impl MemorySpace {
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Host)
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Device(id) => write!(f, "device{id}"),
        }
    }
}

/// Direction of a copy between memory spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl TransferDirection {
    pub const fn label(self) -> &'static str {
        match self {
            Self::HostToDevice => "H2D",
            Self::DeviceToHost => "D2H",
        }
    }
}

/// Grid dimensions (number of blocks per axis)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GridDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_blocks(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl fmt::Display for GridDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Block dimensions (threads per block per axis)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_threads(&self) -> u32 {
        self.x * self.y * self.z
    }

    /// Block shape for a 3-D schedule over `extent`.
    ///
    /// Accesses are assumed to favour the X axis, so blocks are wide in X.
    /// Extents thin in X (at most 128) but larger along Y or Z get a cubic
    /// block instead.
    pub fn for_extent(extent: Id3) -> Self {
        let [x, y, z] = extent;
        if x <= 128 && (x < y || x < z) {
            Self::new(16, 4, 4)
        } else {
            Self::new(64, 2, 1)
        }
    }
}

impl fmt::Display for BlockDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Launch geometry for one scheduled kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: GridDim,
    pub block: BlockDim,
}

impl LaunchConfig {
    pub const fn new(grid: GridDim, block: BlockDim) -> Self {
        Self { grid, block }
    }

    /// 1-D launch covering `total` indices with `block_size` threads per block.
    ///
    /// The grid is not clamped to any device limit; see
    /// [`LaunchConfig::split_linear`] for that.
    pub fn linear(total: u64, block_size: u32) -> Result<Self, DeviceError> {
        let blocks = total.div_ceil(block_size.max(1) as u64);
        let x = u32::try_from(blocks).map_err(|_| {
            DeviceError::InvalidLaunchConfig(format!("{total} indices need {blocks} blocks of {block_size}"))
        })?;
        Ok(Self::new(GridDim::linear(x), BlockDim::linear(block_size)))
    }

    /// 3-D launch covering `extent` with the block shape from [`BlockDim::for_extent`].
    pub fn for_extent(extent: Id3) -> Result<Self, DeviceError> {
        let block = BlockDim::for_extent(extent);
        let axis = |len: Id, b: u32| -> Result<u32, DeviceError> {
            let blocks = (len.max(0) as u64).div_ceil(b as u64);
            u32::try_from(blocks)
                .map_err(|_| DeviceError::InvalidLaunchConfig(format!("extent {extent:?} exceeds grid range")))
        };
        let grid = GridDim::new(axis(extent[0], block.x)?, axis(extent[1], block.y)?, axis(extent[2], block.z)?);
        Ok(Self::new(grid, block))
    }

    /// Split a 1-D launch into dispatches of at most `max_blocks` blocks.
    ///
    /// Returns `(first_global_index, blocks)` per dispatch. A single dispatch
    /// is used while the grid stays below `max_blocks`; otherwise every
    /// dispatch uses the full `max_blocks` width and the offset advances by
    /// `block_size * max_blocks`.
    pub fn split_linear(total: u64, block_size: u32, max_blocks: u32) -> Vec<(u64, u32)> {
        if total == 0 {
            return Vec::new();
        }
        let block = block_size.max(1) as u64;
        let max_blocks = max_blocks.max(1);
        let total_blocks = total.div_ceil(block);
        if total_blocks < max_blocks as u64 {
            return vec![(0, total_blocks as u32)];
        }
        let stride = block * max_blocks as u64;
        (0..total.div_ceil(stride))
            .map(|k| (k * stride, max_blocks))
            .collect()
    }

    pub const fn total_blocks(&self) -> u64 {
        self.grid.total_blocks()
    }

    pub const fn total_threads(&self) -> u64 {
        self.grid.total_blocks() * self.block.total_threads() as u64
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid={}, block={}", self.grid, self.block)
    }
}
