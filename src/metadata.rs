//! Companion metadata document
//!
//! The small side file a viewer reads to interpret the chunk store: voxel
//! calibration, per-channel placement transforms and identity, the schedule,
//! and a pointer to the store (one file, or a partition link document).

use crate::error::{ExportError, Result};
use crate::planner::MipmapSchedule;
use crate::types::{ChannelDescriptor, DownsampleMode, ScalarType, ValueRangeMode, VoxelCalibration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

/// Current metadata document format version
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// Where the chunk data lives, relative to the metadata document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorePointer {
    /// One container file holds the whole dataset
    Single { path: String },
    /// The dataset is split; follow the partition link document
    Partitioned { link: String },
}

/// Identity and placement of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub id: u32,
    pub name: String,
    /// Affine placement transform, 3 rows x 4 columns
    pub transform: [[f64; 4]; 3],
}

/// The companion document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub format_version: u32,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub calibration: VoxelCalibration,
    pub scalar_type: ScalarType,
    pub downsample_mode: DownsampleMode,
    pub value_range: ValueRangeMode,
    pub timepoints: usize,
    pub channels: Vec<ChannelMetadata>,
    pub resolutions: Vec<[u32; 3]>,
    pub subdivisions: Vec<[usize; 3]>,
    pub store: StorePointer,
}

impl DatasetMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        calibration: VoxelCalibration,
        scalar_type: ScalarType,
        downsample_mode: DownsampleMode,
        value_range: ValueRangeMode,
        timepoints: usize,
        channels: &[ChannelDescriptor],
        schedule: &MipmapSchedule,
        store: StorePointer,
    ) -> Self {
        let transform = calibration.affine_transform();
        Self {
            format_version: METADATA_FORMAT_VERSION,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            channels: channels
                .iter()
                .map(|c| ChannelMetadata {
                    id: c.id,
                    name: c.name.clone(),
                    transform,
                })
                .collect(),
            calibration,
            scalar_type,
            downsample_mode,
            value_range,
            timepoints,
            resolutions: schedule.resolutions(),
            subdivisions: schedule.subdivisions(),
            store,
        }
    }
}

/// Writes and reads the companion document
pub struct MetadataWriter;

impl MetadataWriter {
    /// Write the document. Failure does not roll back already-written chunk
    /// data; the caller retries the metadata write alone.
    pub async fn write(document: &DatasetMetadata, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec_pretty(document)
            .map_err(|e| ExportError::MetadataWrite(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ExportError::MetadataWrite(e.to_string()))?;
        }
        fs::write(path.as_ref(), &json)
            .await
            .map_err(|e| ExportError::MetadataWrite(e.to_string()))?;
        Ok(())
    }

    pub async fn read(path: impl AsRef<Path>) -> Result<DatasetMetadata> {
        let bytes = fs::read(path.as_ref()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_document(store: StorePointer) -> DatasetMetadata {
        let schedule = MipmapSchedule::from_parts(
            &[[1, 1, 1], [2, 2, 1]],
            &[[32, 32, 8], [16, 16, 8]],
        )
        .unwrap();
        DatasetMetadata::new(
            VoxelCalibration::new([0.5, 0.5, 2.0], "um"),
            ScalarType::U16,
            DownsampleMode::Mean,
            ValueRangeMode::TakeFromSource,
            3,
            &[
                ChannelDescriptor::new(0, "dapi"),
                ChannelDescriptor::new(1, "gfp"),
            ],
            &schedule,
            store,
        )
    }

    #[test]
    fn test_channel_transforms_derive_from_calibration() {
        let doc = sample_document(StorePointer::Single {
            path: "ds.mvx".to_string(),
        });
        assert_eq!(doc.channels.len(), 2);
        for channel in &doc.channels {
            assert_eq!(channel.transform[0][0], 0.5);
            assert_eq!(channel.transform[1][1], 0.5);
            assert_eq!(channel.transform[2][2], 2.0);
        }
        assert_eq!(doc.resolutions, vec![[1, 1, 1], [2, 2, 1]]);
    }

    #[tokio::test]
    async fn test_document_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dataset.json");
        let doc = sample_document(StorePointer::Partitioned {
            link: "ds.partitions.json".to_string(),
        });
        MetadataWriter::write(&doc, &path).await.unwrap();

        let back = MetadataWriter::read(&path).await.unwrap();
        assert_eq!(back.id, doc.id);
        assert_eq!(back.timepoints, 3);
        assert_eq!(back.calibration, doc.calibration);
        assert_eq!(
            back.store,
            StorePointer::Partitioned {
                link: "ds.partitions.json".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_metadata_error() {
        let dir = TempDir::new().unwrap();
        let doc = sample_document(StorePointer::Single {
            path: "ds.mvx".to_string(),
        });
        // a directory at the target path makes the write fail
        let path = dir.path().join("occupied");
        fs::create_dir_all(&path).await.unwrap();
        let err = MetadataWriter::write(&doc, &path).await;
        assert!(matches!(err, Err(ExportError::MetadataWrite(_))));
    }
}
