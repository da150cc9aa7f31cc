//! Core data types for pyramid export

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default process memory ceiling assumed when the caller does not configure one (2 GiB).
pub const DEFAULT_MEMORY_BUDGET: u64 = 2 * 1024 * 1024 * 1024;

/// Scalar types supported by the chunk store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScalarType {
    /// Unsigned 8-bit integer
    U8 = 0,
    /// Unsigned 16-bit integer
    U16 = 1,
    /// Unsigned 32-bit integer
    U32 = 2,
}

impl ScalarType {
    /// Size in bytes of this scalar type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ScalarType::U8 => 1,
            ScalarType::U16 => 2,
            ScalarType::U32 => 4,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Physical size of one voxel along each axis, plus the unit it is expressed in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelCalibration {
    /// Voxel size along [x, y, z]
    pub size: [f64; 3],
    /// Unit of measurement (e.g., "um", "nm", "mm")
    pub unit: String,
}

impl VoxelCalibration {
    pub fn new(size: [f64; 3], unit: impl Into<String>) -> Self {
        Self {
            size,
            unit: unit.into(),
        }
    }

    /// Isotropic calibration with the same voxel size on all axes
    pub fn isotropic(size: f64, unit: impl Into<String>) -> Self {
        Self::new([size, size, size], unit)
    }

    /// Diagonal affine placement transform derived from the voxel size (3 rows x 4 columns)
    pub fn affine_transform(&self) -> [[f64; 4]; 3] {
        [
            [self.size[0], 0.0, 0.0, 0.0],
            [0.0, self.size[1], 0.0, 0.0],
            [0.0, 0.0, self.size[2], 0.0],
        ]
    }
}

/// Value range of the source data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// How source sample values are mapped onto the output scalar range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ValueRangeMode {
    /// Write source values unchanged
    TakeFromSource,
    /// Scan the source volume for its actual min/max, then rescale to the full output range
    Compute,
    /// Rescale the given range to the full output range
    Explicit { min: f64, max: f64 },
}

/// Downsampling kernel used for levels 1..N
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownsampleMode {
    /// Each output voxel is the mean of its source window (minimizes aliasing)
    Mean,
    /// Window-origin decimation, preserves exact sample values (label data)
    Nearest,
}

/// Identity of one channel in the companion metadata document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: u32,
    pub name: String,
}

impl ChannelDescriptor {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Full parameter set for one export call. Immutable once the export starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Per-level downsampling factors relative to the original resolution; level 0 is `[1, 1, 1]`
    pub resolutions: Vec<[u32; 3]>,
    /// Per-level chunk shape as [x, y, z]
    pub subdivisions: Vec<[usize; 3]>,
    /// Deflate-compress chunk payloads
    pub compression: bool,
    /// Value-range remapping mode
    pub value_range: ValueRangeMode,
    /// Downsampling kernel for levels 1..N
    pub downsample: DownsampleMode,
    /// Split the (timepoint x channel) space across multiple store files
    pub split: bool,
    /// Timepoints per partition file; 0 disables splitting along timepoints
    pub timepoints_per_partition: usize,
    /// Channels (setups) per partition file; 0 disables splitting along channels
    pub setups_per_partition: usize,
    /// Where the companion metadata document is written
    pub output_metadata_path: PathBuf,
    /// Base path of the chunk store; partition files derive their names from its stem
    pub output_store_path: PathBuf,
    /// Optional channel names; channels without a name get "channel {id}"
    pub channel_names: Vec<String>,
    /// Process memory ceiling used by the loopback heuristic and eviction monitor
    pub memory_budget_bytes: u64,
}

impl ExportConfig {
    pub fn new(
        output_metadata_path: impl Into<PathBuf>,
        output_store_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resolutions: Vec::new(),
            subdivisions: Vec::new(),
            compression: false,
            value_range: ValueRangeMode::TakeFromSource,
            downsample: DownsampleMode::Mean,
            split: false,
            timepoints_per_partition: 0,
            setups_per_partition: 0,
            output_metadata_path: output_metadata_path.into(),
            output_store_path: output_store_path.into(),
            channel_names: Vec::new(),
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
        }
    }

    /// Set the resolution/chunk schedule
    pub fn with_schedule(mut self, resolutions: Vec<[u32; 3]>, subdivisions: Vec<[usize; 3]>) -> Self {
        self.resolutions = resolutions;
        self.subdivisions = subdivisions;
        self
    }

    /// Enable or disable chunk compression
    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Set the value-range remapping mode
    pub fn with_value_range(mut self, mode: ValueRangeMode) -> Self {
        self.value_range = mode;
        self
    }

    /// Set the downsampling kernel
    pub fn with_downsample(mut self, mode: DownsampleMode) -> Self {
        self.downsample = mode;
        self
    }

    /// Split the store into partition files of the given grid cell size
    pub fn with_split(mut self, timepoints_per_partition: usize, setups_per_partition: usize) -> Self {
        self.split = true;
        self.timepoints_per_partition = timepoints_per_partition;
        self.setups_per_partition = setups_per_partition;
        self
    }

    /// Set the memory ceiling for the loopback heuristic and eviction monitor
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    /// Set channel names for the companion metadata document
    pub fn with_channel_names(mut self, names: Vec<String>) -> Self {
        self.channel_names = names;
        self
    }

    /// Name for channel `id`, falling back to "channel {id}"
    pub fn channel_name(&self, id: u32) -> String {
        self.channel_names
            .get(id as usize)
            .cloned()
            .unwrap_or_else(|| format!("channel {}", id))
    }
}
