//! Top-level export orchestration
//!
//! Validates the schedule before anything touches disk, plans partitions,
//! runs the builder once per partition file with one shared worker pool, then
//! writes the link document (when splitting) and the companion metadata
//! document. Failures after validation leave already-written output on disk;
//! callers needing atomicity export to a temporary location and rename.

use crate::builder::PyramidBuilder;
use crate::compression::CompressionMethod;
use crate::error::{ExportError, Result};
use crate::memory::CacheEvictionMonitor;
use crate::metadata::{DatasetMetadata, MetadataWriter, StorePointer};
use crate::partition::Partitioner;
use crate::planner::MipmapSchedule;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::store::{ChunkStoreWriter, StoreSummary};
use crate::types::{ChannelDescriptor, ExportConfig, VoxelCalibration};
use crate::utils::format_bytes;
use crate::volume::{SourceVolumes, VolumeScalar};
use log::info;
use std::path::{Path, PathBuf};

/// What one finished export produced
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub partitions: Vec<StoreSummary>,
    pub metadata_path: PathBuf,
    pub link_path: Option<PathBuf>,
}

impl ExportSummary {
    pub fn chunk_count(&self) -> usize {
        self.partitions.iter().map(|p| p.chunk_count).sum()
    }

    pub fn bytes_written(&self) -> u64 {
        self.partitions.iter().map(|p| p.bytes_written).sum()
    }
}

/// Runs one complete export
pub struct Exporter;

impl Exporter {
    /// Export with a monitor built from the config's memory budget
    pub async fn run<T: VolumeScalar>(
        sources: &SourceVolumes<T>,
        calibration: &VoxelCalibration,
        config: &ExportConfig,
        progress: &dyn ProgressSink,
    ) -> Result<ExportSummary> {
        let monitor = CacheEvictionMonitor::new(config.memory_budget_bytes);
        Self::run_with_monitor(sources, calibration, config, &monitor, progress).await
    }

    /// Export with a caller-supplied eviction monitor (custom memory accounting)
    pub async fn run_with_monitor<T: VolumeScalar>(
        sources: &SourceVolumes<T>,
        calibration: &VoxelCalibration,
        config: &ExportConfig,
        monitor: &CacheEvictionMonitor,
        progress: &dyn ProgressSink,
    ) -> Result<ExportSummary> {
        // validation first; nothing is written when the schedule is rejected
        let schedule = MipmapSchedule::from_parts(&config.resolutions, &config.subdivisions)?;
        if sources.is_empty() {
            return Err(ExportError::InvalidFormat(
                "no source volumes registered".to_string(),
            ));
        }
        let timepoints = sources.timepoint_count();
        let channels = sources.channel_count();

        let store_dir = config
            .output_store_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .to_path_buf();
        let base_name = config
            .output_store_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                ExportError::InvalidFormat("output store path has no file name".to_string())
            })?;

        let (tpp, cpp) = if config.split {
            (
                config.timepoints_per_partition,
                config.setups_per_partition,
            )
        } else {
            (0, 0)
        };
        let partitions = Partitioner::plan(timepoints, channels, tpp, cpp, base_name);
        Partitioner::verify(&partitions, timepoints, channels)?;

        let method = if config.compression {
            CompressionMethod::Deflate
        } else {
            CompressionMethod::None
        };
        let builder = PyramidBuilder::new(&schedule, config, monitor);
        info!(
            "exporting {} timepoints x {} channels into {} partition(s), {} workers",
            timepoints,
            channels,
            partitions.len(),
            builder.worker_count()
        );

        let total = partitions.len();
        let mut summaries = Vec::with_capacity(total);
        for (index, partition) in partitions.iter().enumerate() {
            let mut writer = ChunkStoreWriter::create(store_dir.join(&partition.file), method).await?;
            builder
                .build(
                    sources,
                    &mut writer,
                    partition.timepoint_range(),
                    partition.channel_range(),
                    progress,
                )
                .await?;
            let summary = writer.finalize().await?;
            info!(
                "finished partition {}: {} chunks, {}",
                partition.name,
                summary.chunk_count,
                format_bytes(summary.bytes_written)
            );
            progress.report(ProgressEvent::PartitionComplete { index, total });
            summaries.push(summary);
        }

        let link_path = if config.split {
            let path = store_dir.join(format!("{}.partitions.json", base_name));
            Partitioner::write_link_document(&partitions, &path).await?;
            Some(path)
        } else {
            None
        };

        let store = match &link_path {
            Some(path) => StorePointer::Partitioned {
                link: path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            None => StorePointer::Single {
                path: partitions[0].file.clone(),
            },
        };
        let descriptors: Vec<ChannelDescriptor> = (0..channels)
            .map(|c| ChannelDescriptor::new(c as u32, config.channel_name(c as u32)))
            .collect();
        let document = DatasetMetadata::new(
            calibration.clone(),
            T::TYPE,
            config.downsample,
            config.value_range,
            timepoints,
            &descriptors,
            &schedule,
            store,
        );
        MetadataWriter::write(&document, &config.output_metadata_path).await?;

        Ok(ExportSummary {
            partitions: summaries,
            metadata_path: config.output_metadata_path.clone(),
            link_path,
        })
    }
}
