//! Mipmap schedule planning and validation
//!
//! A schedule is an ordered list of `(downsampling factors, chunk shape)`
//! pairs, level 0 at native resolution. [`MipmapPlanner::propose`] derives one
//! from the volume size and voxel calibration; user-supplied schedules go
//! through the same validation via [`MipmapSchedule::from_parts`].

use crate::error::{ExportError, Result};
use crate::types::VoxelCalibration;
use serde::{Deserialize, Serialize};

/// One resolution tier of the pyramid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MipmapLevel {
    /// Downsampling factors relative to the original resolution, per axis [x, y, z]
    pub factors: [u32; 3],
    /// Chunk shape as [x, y, z]
    pub chunk_shape: [usize; 3],
}

/// Validated resolution/chunk schedule, shared read-only by all channels and timepoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MipmapSchedule {
    levels: Vec<MipmapLevel>,
}

impl MipmapSchedule {
    /// Build a schedule from parallel factor and chunk-shape lists, validating both
    pub fn from_parts(resolutions: &[[u32; 3]], subdivisions: &[[usize; 3]]) -> Result<Self> {
        MipmapPlanner::validate(resolutions, subdivisions)?;
        let levels = resolutions
            .iter()
            .zip(subdivisions.iter())
            .map(|(&factors, &chunk_shape)| MipmapLevel {
                factors,
                chunk_shape,
            })
            .collect();
        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[MipmapLevel] {
        &self.levels
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, index: usize) -> &MipmapLevel {
        &self.levels[index]
    }

    pub fn resolutions(&self) -> Vec<[u32; 3]> {
        self.levels.iter().map(|l| l.factors).collect()
    }

    pub fn subdivisions(&self) -> Vec<[usize; 3]> {
        self.levels.iter().map(|l| l.chunk_shape).collect()
    }

    /// Extent of a level given the base volume extent ([x, y, z])
    pub fn level_extent(&self, base: [usize; 3], level: usize) -> [usize; 3] {
        let factors = self.levels[level].factors;
        [
            base[0].div_ceil(factors[0] as usize).max(1),
            base[1].div_ceil(factors[1] as usize).max(1),
            base[2].div_ceil(factors[2] as usize).max(1),
        ]
    }
}

/// Number of blocks per axis for `extent` tiled by `chunk_shape`
pub fn block_count(extent: [usize; 3], chunk_shape: [usize; 3]) -> [usize; 3] {
    [
        extent[0].div_ceil(chunk_shape[0]),
        extent[1].div_ceil(chunk_shape[1]),
        extent[2].div_ceil(chunk_shape[2]),
    ]
}

/// Voxel range of one block within a level, clipped to the level extent.
/// Returns `(min, shape)` in level voxel coordinates ([x, y, z]).
pub fn block_extent(
    extent: [usize; 3],
    chunk_shape: [usize; 3],
    block: [u32; 3],
) -> ([usize; 3], [usize; 3]) {
    let mut min = [0usize; 3];
    let mut shape = [0usize; 3];
    for a in 0..3 {
        min[a] = block[a] as usize * chunk_shape[a];
        shape[a] = chunk_shape[a].min(extent[a].saturating_sub(min[a]));
    }
    (min, shape)
}

/// Proposes resolution/chunk schedules and validates user-supplied ones
pub struct MipmapPlanner;

impl MipmapPlanner {
    /// Propose a schedule for `volume_size` ([x, y, z] voxels).
    ///
    /// Starting at native resolution, each new level doubles the factor of
    /// every axis whose current physical voxel extent is within 2x of the
    /// finest axis, so isotropic volumes coarsen uniformly and anisotropic
    /// volumes coarsen their fine axes first. Chunk shapes approximate a cube
    /// of `target_block_elements` voxels; planning stops once the downsampled
    /// element count falls below that target.
    pub fn propose(
        volume_size: [usize; 3],
        calibration: &VoxelCalibration,
        target_block_elements: usize,
    ) -> MipmapSchedule {
        let target = target_block_elements.max(1);
        let mut levels = Vec::new();
        let mut factors = [1u32; 3];

        loop {
            let extent = downsampled_extent(volume_size, factors);
            levels.push(MipmapLevel {
                factors,
                chunk_shape: chunk_shape_for(extent, target),
            });

            let elements: usize = extent.iter().product();
            if elements <= target {
                break;
            }

            // Physical voxel extent per axis at the current factors; exhausted
            // axes (a single remaining voxel) no longer participate.
            let voxel = move |a: usize| calibration.size[a] * factors[a] as f64;
            let finest = (0..3)
                .filter(|&a| extent[a] > 1)
                .map(voxel)
                .fold(f64::INFINITY, f64::min);
            for a in 0..3 {
                if extent[a] > 1 && voxel(a) < 2.0 * finest {
                    factors[a] *= 2;
                }
            }
        }

        MipmapSchedule { levels }
    }

    /// Validate parallel factor and chunk-shape lists
    pub fn validate(resolutions: &[[u32; 3]], subdivisions: &[[usize; 3]]) -> Result<()> {
        if resolutions.is_empty() || subdivisions.is_empty() {
            return Err(ExportError::InvalidSchedule(
                "resolutions and subdivisions must be non-empty".to_string(),
            ));
        }
        if resolutions.len() != subdivisions.len() {
            return Err(ExportError::InvalidSchedule(format!(
                "level count mismatch: {} resolutions vs {} subdivisions",
                resolutions.len(),
                subdivisions.len()
            )));
        }
        if resolutions[0] != [1, 1, 1] {
            return Err(ExportError::InvalidSchedule(format!(
                "level 0 must be at native resolution [1, 1, 1], got {:?}",
                resolutions[0]
            )));
        }
        for (level, factors) in resolutions.iter().enumerate() {
            if factors.iter().any(|&f| f == 0) {
                return Err(ExportError::InvalidSchedule(format!(
                    "level {} has a zero downsampling factor: {:?}",
                    level, factors
                )));
            }
        }
        for (level, shape) in subdivisions.iter().enumerate() {
            if shape.iter().any(|&d| d == 0) {
                return Err(ExportError::InvalidSchedule(format!(
                    "level {} has a non-positive chunk dimension: {:?}",
                    level, shape
                )));
            }
        }
        for level in 1..resolutions.len() {
            for a in 0..3 {
                if resolutions[level][a] < resolutions[level - 1][a] {
                    return Err(ExportError::InvalidSchedule(format!(
                        "factors must be non-decreasing per axis; level {} axis {} shrinks",
                        level, a
                    )));
                }
            }
        }
        Ok(())
    }
}

fn downsampled_extent(base: [usize; 3], factors: [u32; 3]) -> [usize; 3] {
    [
        base[0].div_ceil(factors[0] as usize).max(1),
        base[1].div_ceil(factors[1] as usize).max(1),
        base[2].div_ceil(factors[2] as usize).max(1),
    ]
}

fn chunk_shape_for(extent: [usize; 3], target_block_elements: usize) -> [usize; 3] {
    let edge = ((target_block_elements as f64).cbrt().round() as usize).max(1);
    [
        edge.min(extent[0]).max(1),
        edge.min(extent[1]).max(1),
        edge.min(extent[2]).max(1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_propose_isotropic_scales_uniformly() {
        let cal = VoxelCalibration::isotropic(1.0, "um");
        let schedule = MipmapPlanner::propose([256, 256, 256], &cal, 32 * 32 * 32);
        assert!(schedule.num_levels() > 1);
        assert_eq!(schedule.level(0).factors, [1, 1, 1]);
        for level in schedule.levels() {
            assert_eq!(level.factors[0], level.factors[1]);
            assert_eq!(level.factors[1], level.factors[2]);
        }
        let last = schedule.level(schedule.num_levels() - 1);
        let extent = schedule.level_extent([256, 256, 256], schedule.num_levels() - 1);
        assert!(extent.iter().product::<usize>() <= 32 * 32 * 32);
        assert!(last.chunk_shape.iter().all(|&d| d > 0));
    }

    #[test]
    fn test_propose_anisotropic_coarsens_fine_axes_first() {
        // z voxels are 4x taller; x/y must coarsen twice before z joins
        let cal = VoxelCalibration::new([1.0, 1.0, 4.0], "um");
        let schedule = MipmapPlanner::propose([512, 512, 128], &cal, 32 * 32 * 32);
        assert_eq!(schedule.level(1).factors, [2, 2, 1]);
        assert_eq!(schedule.level(2).factors, [4, 4, 1]);
        assert_eq!(schedule.level(3).factors, [8, 8, 2]);
    }

    #[test]
    fn test_propose_validates() {
        let cal = VoxelCalibration::isotropic(0.5, "um");
        let schedule = MipmapPlanner::propose([100, 80, 50], &cal, 16 * 16 * 16);
        assert!(
            MipmapPlanner::validate(&schedule.resolutions(), &schedule.subdivisions()).is_ok()
        );
    }

    #[test]
    fn test_propose_thin_volume_terminates() {
        let cal = VoxelCalibration::isotropic(1.0, "um");
        let schedule = MipmapPlanner::propose([4096, 4096, 1], &cal, 64 * 64);
        let last = schedule.num_levels() - 1;
        let extent = schedule.level_extent([4096, 4096, 1], last);
        assert!(extent.iter().product::<usize>() <= 64 * 64);
        // the exhausted z axis never coarsens
        assert!(schedule.levels().iter().all(|l| l.factors[2] == 1));
    }

    #[test]
    fn test_validate_rejects_length_mismatch() {
        let err = MipmapPlanner::validate(&[[1, 1, 1], [2, 2, 2]], &[[16, 16, 16]]);
        assert!(matches!(err, Err(ExportError::InvalidSchedule(_))));
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(MipmapPlanner::validate(&[], &[]).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_dimension() {
        let err = MipmapPlanner::validate(&[[1, 1, 1]], &[[16, 0, 16]]);
        assert!(matches!(err, Err(ExportError::InvalidSchedule(_))));
    }

    #[test]
    fn test_validate_rejects_zero_factor() {
        assert!(MipmapPlanner::validate(&[[1, 1, 1], [2, 0, 2]], &[[8, 8, 8], [8, 8, 8]]).is_err());
    }

    #[test]
    fn test_validate_rejects_shrinking_factors() {
        assert!(MipmapPlanner::validate(
            &[[1, 1, 1], [4, 4, 4], [2, 2, 2]],
            &[[8, 8, 8], [8, 8, 8], [8, 8, 8]]
        )
        .is_err());
    }

    #[test]
    fn test_validate_rejects_non_native_level_zero() {
        assert!(MipmapPlanner::validate(&[[2, 2, 2]], &[[8, 8, 8]]).is_err());
    }

    #[test]
    fn test_block_grid_math() {
        let schedule =
            MipmapSchedule::from_parts(&[[1, 1, 1], [2, 2, 1]], &[[32, 32, 8], [16, 16, 8]])
                .unwrap();
        assert_eq!(schedule.level_extent([64, 64, 8], 1), [32, 32, 8]);
        assert_eq!(block_count([64, 64, 8], [32, 32, 8]), [2, 2, 1]);
        assert_eq!(block_count([65, 64, 8], [32, 32, 8]), [3, 2, 1]);

        let (min, shape) = block_extent([65, 64, 8], [32, 32, 8], [2, 0, 0]);
        assert_eq!(min, [64, 0, 0]);
        assert_eq!(shape, [1, 32, 8]);
    }
}
