//! Splitting the (timepoint x channel) space across physical store files
//!
//! Partition names derive deterministically from the store base name and the
//! partition's grid coordinates, so re-planning with the same inputs
//! reproduces identical file names (idempotent re-export). The link document
//! lets a reader reconstruct the logical dataset without touching chunk data.

use crate::error::{ExportError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Current link document format version
pub const LINK_FORMAT_VERSION: u32 = 1;

/// A contiguous sub-range of the (timepoint, channel) grid bound to one store file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    /// Store file name, relative to the link document
    pub file: String,
    /// Covered timepoints as a half-open range [lo, hi)
    pub timepoints: [usize; 2],
    /// Covered channels as a half-open range [lo, hi)
    pub channels: [usize; 2],
}

impl Partition {
    pub fn timepoint_range(&self) -> std::ops::Range<usize> {
        self.timepoints[0]..self.timepoints[1]
    }

    pub fn channel_range(&self) -> std::ops::Range<usize> {
        self.channels[0]..self.channels[1]
    }

    pub fn contains(&self, timepoint: usize, channel: usize) -> bool {
        self.timepoint_range().contains(&timepoint) && self.channel_range().contains(&channel)
    }
}

/// Document tying the partition files of one dataset together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionLinkDocument {
    pub format_version: u32,
    pub partitions: Vec<Partition>,
}

impl PartitionLinkDocument {
    pub async fn read(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Partition holding the given grid cell
    pub fn find(&self, timepoint: usize, channel: usize) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.contains(timepoint, channel))
    }
}

/// Plans the partition grid and writes the link document
pub struct Partitioner;

impl Partitioner {
    /// Tile the grid into partitions of at most `timepoints_per_partition` x
    /// `channels_per_partition` cells, row-major with timepoints outermost.
    /// A non-positive size on either axis yields a single partition covering
    /// everything.
    pub fn plan(
        timepoints: usize,
        channels: usize,
        timepoints_per_partition: usize,
        channels_per_partition: usize,
        base_name: &str,
    ) -> Vec<Partition> {
        if timepoints_per_partition == 0 || channels_per_partition == 0 {
            return vec![Partition {
                name: base_name.to_string(),
                file: format!("{}.mvx", base_name),
                timepoints: [0, timepoints],
                channels: [0, channels],
            }];
        }

        let mut partitions = Vec::new();
        let t_cells = timepoints.div_ceil(timepoints_per_partition);
        let c_cells = channels.div_ceil(channels_per_partition);
        for ti in 0..t_cells {
            for ci in 0..c_cells {
                let t_lo = ti * timepoints_per_partition;
                let c_lo = ci * channels_per_partition;
                let name = format!("{}-t{}-c{}", base_name, ti, ci);
                partitions.push(Partition {
                    file: format!("{}.mvx", name),
                    name,
                    timepoints: [t_lo, (t_lo + timepoints_per_partition).min(timepoints)],
                    channels: [c_lo, (c_lo + channels_per_partition).min(channels)],
                });
            }
        }
        partitions
    }

    /// Check the coverage invariant: partitions are pairwise disjoint and
    /// their union is exactly the full grid. A violation is an internal
    /// planning bug, surfaced as [`ExportError::PartitionPlan`].
    pub fn verify(partitions: &[Partition], timepoints: usize, channels: usize) -> Result<()> {
        let mut covered = vec![0u32; timepoints * channels];
        for partition in partitions {
            for t in partition.timepoint_range() {
                for c in partition.channel_range() {
                    if t >= timepoints || c >= channels {
                        return Err(ExportError::PartitionPlan(format!(
                            "partition {} covers ({}, {}) outside the {}x{} grid",
                            partition.name, t, c, timepoints, channels
                        )));
                    }
                    covered[t * channels + c] += 1;
                }
            }
        }
        for (cell, &count) in covered.iter().enumerate() {
            if count != 1 {
                return Err(ExportError::PartitionPlan(format!(
                    "grid cell (timepoint {}, channel {}) covered {} times",
                    cell / channels,
                    cell % channels,
                    count
                )));
            }
        }
        Ok(())
    }

    /// Write the link document next to the partition files
    pub async fn write_link_document(
        partitions: &[Partition],
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let doc = PartitionLinkDocument {
            format_version: LINK_FORMAT_VERSION,
            partitions: partitions.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path.as_ref(), &json).await?;
        Ok(())
    }
}
