//! mipvox - multi-resolution pyramid export engine
//!
//! Converts in-memory or lazily-decoded 3D pixel volumes (multiple channels,
//! multiple timepoints) into an on-disk chunked, multi-resolution array store,
//! plus a companion metadata document recording voxel calibration, channel
//! identity, and how the store is split across physical files.
//!
//! # Features
//!
//! - Mipmap schedule planning from voxel calibration (anisotropy-aware)
//! - Per-level choice between resampling the original volume and looping back
//!   over the previous level's output, under a live memory budget
//! - Bounded worker pool with a per-plane barrier; byte-deterministic output
//! - Optional splitting of the (timepoint x channel) space across partition
//!   files tied together by a link document
//! - Deflate/Zstd chunk compression with per-chunk CRC32 integrity
//!
//! # Example
//!
//! ```rust,ignore
//! use mipvox::{ExportConfig, Exporter, InMemoryVolume, NullProgress, SourceVolumes, VoxelCalibration};
//! use std::sync::Arc;
//!
//! # async fn example() -> mipvox::Result<()> {
//! let mut sources: SourceVolumes<u16> = SourceVolumes::new();
//! sources.insert(0, 0, Arc::new(InMemoryVolume::constant([256, 256, 64], 0)));
//!
//! let config = ExportConfig::new("dataset.json", "dataset")
//!     .with_schedule(vec![[1, 1, 1], [2, 2, 1]], vec![[64, 64, 32], [32, 32, 32]])
//!     .with_compression(true);
//! let calibration = VoxelCalibration::new([0.5, 0.5, 2.0], "um");
//! Exporter::run(&sources, &calibration, &config, &NullProgress).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod compression;
pub mod error;
pub mod export;
pub mod loopback;
pub mod memory;
pub mod metadata;
pub mod partition;
pub mod planner;
pub mod progress;
pub mod store;
pub mod types;
pub mod utils;
pub mod volume;

// Re-exports
pub use builder::PyramidBuilder;
pub use compression::{CompressionMethod, Compressor};
pub use error::{ExportError, Result};
pub use export::{Exporter, ExportSummary};
pub use loopback::use_loopback;
pub use memory::CacheEvictionMonitor;
pub use metadata::{DatasetMetadata, MetadataWriter, StorePointer};
pub use partition::{Partition, PartitionLinkDocument, Partitioner};
pub use planner::{MipmapLevel, MipmapPlanner, MipmapSchedule};
pub use progress::{NullProgress, ProgressEvent, ProgressSink};
pub use store::{ChunkKey, ChunkStoreReader, ChunkStoreWriter, StoreSummary};
pub use types::{
    ChannelDescriptor, DownsampleMode, ExportConfig, ScalarType, ValueRange, ValueRangeMode,
    VoxelCalibration,
};
pub use volume::{
    ClearableCache, InMemoryVolume, LazyVolume, PixelVolume, SourceVolumes, VolumeScalar,
};

/// Version of the export engine
pub const MIPVOX_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!MIPVOX_VERSION.is_empty());
    }
}
