//! Core pyramid construction engine
//!
//! For every (timepoint, channel) pair the builder writes level 0 verbatim
//! (with optional value-range remapping) and levels 1..N by block-wise
//! downsampling, choosing per level between the original volume and the
//! previous level's already-written output (loopback). Blocks of one plane are
//! fanned out over a bounded blocking-worker pool; the plane barrier keeps
//! peak memory proportional to one plane of tasks and gives the eviction
//! monitor a quiesce point. A level is fully flushed before the next level
//! starts, because the next level may read it back.

use crate::error::{ExportError, Result};
use crate::loopback::use_loopback;
use crate::memory::CacheEvictionMonitor;
use crate::planner::{block_count, block_extent, MipmapSchedule};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::store::{assemble_region, overlapping_blocks, ChunkKey, ChunkStoreWriter};
use crate::types::{DownsampleMode, ExportConfig, ValueRange, ValueRangeMode};
use crate::volume::{array_from_le_bytes, array_to_le_bytes, PixelVolume, SourceVolumes, VolumeScalar};
use futures::future::try_join_all;
use log::{debug, info};
use ndarray::Array3;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task;

/// Linear sample remap, applied before any averaging so the direct and
/// loopback paths agree on already-remapped values
#[derive(Debug, Clone, Copy)]
struct Remap {
    scale: f64,
    offset: f64,
}

impl Remap {
    fn identity() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
        }
    }

    /// Rescale `range` onto [0, T::MAX]; a degenerate range maps everything to 0
    fn linear<T: VolumeScalar>(range: ValueRange) -> Self {
        if !range.is_valid() || range.max <= range.min {
            return Self {
                scale: 0.0,
                offset: 0.0,
            };
        }
        let scale = T::max_value().to_f64() / (range.max - range.min);
        Self {
            scale,
            offset: -range.min * scale,
        }
    }

    fn map(self, v: f64) -> f64 {
        v * self.scale + self.offset
    }
}

/// Where a level's blocks are resampled from
#[derive(Debug, Clone, Copy)]
enum LevelSource {
    /// Read the original volume, downsampling by the level's absolute factors
    Original { factors: [u32; 3] },
    /// Read the previous level's output, downsampling by the relative factors
    Loopback { rel: [u32; 3] },
}

/// Downsample one source region into an output block. `rel` is the per-axis
/// window size; clipped windows at the source edge average fewer samples.
fn downsample_block<T: VolumeScalar>(
    src: &Array3<T>,
    rel: [u32; 3],
    out_shape: [usize; 3],
    mode: DownsampleMode,
    remap: Remap,
) -> Array3<T> {
    let (sz, sy, sx) = src.dim();
    let (fx, fy, fz) = (rel[0] as usize, rel[1] as usize, rel[2] as usize);
    Array3::from_shape_fn((out_shape[2], out_shape[1], out_shape[0]), |(z, y, x)| {
        let (x0, y0, z0) = (x * fx, y * fy, z * fz);
        match mode {
            DownsampleMode::Nearest => T::from_f64_clamped(remap.map(src[[z0, y0, x0]].to_f64())),
            DownsampleMode::Mean => {
                let (x1, y1, z1) = ((x0 + fx).min(sx), (y0 + fy).min(sy), (z0 + fz).min(sz));
                let mut sum = 0.0;
                let mut count = 0usize;
                for zz in z0..z1 {
                    for yy in y0..y1 {
                        for xx in x0..x1 {
                            sum += remap.map(src[[zz, yy, xx]].to_f64());
                            count += 1;
                        }
                    }
                }
                T::from_f64_clamped(sum / count as f64)
            }
        }
    })
}

/// Pixel data handed to one block task
enum TaskInput<T: VolumeScalar> {
    /// Read this region of the original volume inside the worker
    Volume { min: [usize; 3], shape: [usize; 3] },
    /// Pre-assembled region of the previous level's output
    Region(Array3<T>),
}

/// The core engine: builds the full pyramid for a range of the
/// (timepoint x channel) grid into one chunk-store file
pub struct PyramidBuilder<'a> {
    schedule: &'a MipmapSchedule,
    config: &'a ExportConfig,
    monitor: &'a CacheEvictionMonitor,
    semaphore: Arc<Semaphore>,
    workers: usize,
}

impl<'a> PyramidBuilder<'a> {
    /// Worker pool is sized to available parallelism minus one, minimum 1
    pub fn new(
        schedule: &'a MipmapSchedule,
        config: &'a ExportConfig,
        monitor: &'a CacheEvictionMonitor,
    ) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .saturating_sub(1)
            .max(1);
        Self {
            schedule,
            config,
            monitor,
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Build pyramids for every (timepoint, channel) in the given sub-grid,
    /// row-major with timepoints outermost
    pub async fn build<T: VolumeScalar>(
        &self,
        sources: &SourceVolumes<T>,
        writer: &mut ChunkStoreWriter,
        timepoints: Range<usize>,
        channels: Range<usize>,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        for timepoint in timepoints {
            for channel in channels.clone() {
                let volume = sources.get(timepoint, channel)?.clone();
                self.build_one(volume, writer, timepoint, channel, progress)
                    .await?;
            }
        }
        Ok(())
    }

    async fn build_one<T: VolumeScalar>(
        &self,
        volume: Arc<dyn PixelVolume<T>>,
        writer: &mut ChunkStoreWriter,
        timepoint: usize,
        channel: usize,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let base = volume.extent();
        let remap = self.resolve_remap(&volume).await?;
        info!(
            "building pyramid for timepoint {}, channel {}: extent {:?}, {} levels",
            timepoint,
            channel,
            base,
            self.schedule.num_levels()
        );

        for level in 0..self.schedule.num_levels() {
            self.build_level(&volume, writer, timepoint, channel, level, base, remap, progress)
                .await?;
            // level barrier: the next level may read this one back
            writer.flush().await?;
            progress.report(ProgressEvent::LevelComplete {
                timepoint,
                channel,
                level,
            });
        }
        Ok(())
    }

    /// Pick the source for a level. Loopback needs integer per-axis factors
    /// relative to the previous level; otherwise the original is read.
    fn level_source<T: VolumeScalar>(
        &self,
        level: usize,
        volume: &Arc<dyn PixelVolume<T>>,
    ) -> LevelSource {
        let factors = self.schedule.level(level).factors;
        if level == 0 {
            return LevelSource::Original { factors };
        }
        let prev = self.schedule.level(level - 1).factors;
        if (0..3).any(|a| factors[a] % prev[a] != 0) {
            return LevelSource::Original { factors };
        }
        let rel = [
            factors[0] / prev[0],
            factors[1] / prev[1],
            factors[2] / prev[2],
        ];
        let lazy_plane = volume.cache().map(|_| volume.plane_size_bytes());
        if use_loopback(
            level,
            factors,
            rel,
            self.schedule.level(level).chunk_shape,
            lazy_plane,
            self.config.memory_budget_bytes,
        ) {
            LevelSource::Loopback { rel }
        } else {
            LevelSource::Original { factors }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_level<T: VolumeScalar>(
        &self,
        volume: &Arc<dyn PixelVolume<T>>,
        writer: &mut ChunkStoreWriter,
        timepoint: usize,
        channel: usize,
        level: usize,
        base: [usize; 3],
        remap: Remap,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let chunk_shape = self.schedule.level(level).chunk_shape;
        let extent = self.schedule.level_extent(base, level);
        let blocks = block_count(extent, chunk_shape);
        let source = self.level_source(level, volume);
        // level 0 is a verbatim copy; the kernel only matters when rel > 1
        let mode = if level == 0 {
            DownsampleMode::Nearest
        } else {
            self.config.downsample
        };
        debug!(
            "level {} for timepoint {}, channel {}: extent {:?}, {:?} blocks, source {:?}",
            level, timepoint, channel, extent, blocks, source
        );

        let prev_extent = if level > 0 {
            self.schedule.level_extent(base, level - 1)
        } else {
            extent
        };
        let prev_chunk_shape = if level > 0 {
            self.schedule.level(level - 1).chunk_shape
        } else {
            chunk_shape
        };

        for bz in 0..blocks[2] {
            self.monitor.begin_plane();
            // previous-level chunks decoded for this plane; neighbors share them
            let mut prev_cache: HashMap<[u32; 3], Array3<T>> = HashMap::new();
            let mut tasks = Vec::with_capacity(blocks[0] * blocks[1]);

            for by in 0..blocks[1] {
                for bx in 0..blocks[0] {
                    let block = [bx as u32, by as u32, bz as u32];
                    let (bmin, bshape) = block_extent(extent, chunk_shape, block);
                    let (rel, input) = match source {
                        LevelSource::Original { factors } => {
                            let mut min = [0usize; 3];
                            let mut shape = [0usize; 3];
                            for a in 0..3 {
                                min[a] = bmin[a] * factors[a] as usize;
                                shape[a] =
                                    (bshape[a] * factors[a] as usize).min(base[a] - min[a]);
                            }
                            (factors, TaskInput::Volume { min, shape })
                        }
                        LevelSource::Loopback { rel } => {
                            let mut min = [0usize; 3];
                            let mut shape = [0usize; 3];
                            for a in 0..3 {
                                min[a] = bmin[a] * rel[a] as usize;
                                shape[a] =
                                    (bshape[a] * rel[a] as usize).min(prev_extent[a] - min[a]);
                            }
                            let region = self
                                .fetch_previous_region(
                                    writer,
                                    timepoint,
                                    channel,
                                    level - 1,
                                    prev_extent,
                                    prev_chunk_shape,
                                    min,
                                    shape,
                                    &mut prev_cache,
                                )
                                .await
                                .map_err(|e| build_error(timepoint, channel, level, block, e))?;
                            (rel, TaskInput::Region(region))
                        }
                    };
                    // loopback sources were remapped when level 0 was written
                    let task_remap = match source {
                        LevelSource::Original { .. } => remap,
                        LevelSource::Loopback { .. } => Remap::identity(),
                    };
                    tasks.push(self.spawn_block_task(
                        volume.clone(),
                        ChunkKey {
                            timepoint: timepoint as u32,
                            channel: channel as u32,
                            level: level as u32,
                            block,
                        },
                        input,
                        rel,
                        bshape,
                        mode,
                        task_remap,
                    ));
                }
            }

            // plane barrier: collect every block of this plane, then append in
            // deterministic row-major order
            let completed = try_join_all(tasks).await?;
            for (key, payload) in completed {
                writer
                    .put_chunk(key, &payload)
                    .await
                    .map_err(|e| build_error(timepoint, channel, level, key.block, e))?;
            }

            self.monitor.maybe_evict(volume.as_ref());
            progress.report(ProgressEvent::PlaneComplete {
                timepoint,
                channel,
                level,
                plane: bz,
                blocks: blocks[0] * blocks[1],
            });
        }
        Ok(())
    }

    fn spawn_block_task<T: VolumeScalar>(
        &self,
        volume: Arc<dyn PixelVolume<T>>,
        key: ChunkKey,
        input: TaskInput<T>,
        rel: [u32; 3],
        out_shape: [usize; 3],
        mode: DownsampleMode,
        remap: Remap,
    ) -> impl std::future::Future<Output = Result<(ChunkKey, Vec<u8>)>> {
        let semaphore = self.semaphore.clone();
        async move {
            let inner = async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| ExportError::Worker(e.to_string()))?;
                task::spawn_blocking(move || -> Result<Vec<u8>> {
                    let src = match input {
                        TaskInput::Volume { min, shape } => volume.read_region(min, shape)?,
                        TaskInput::Region(region) => region,
                    };
                    let out = downsample_block(&src, rel, out_shape, mode, remap);
                    Ok(array_to_le_bytes(&out))
                })
                .await
                .map_err(|e| ExportError::Worker(e.to_string()))?
            };
            match inner.await {
                Ok(payload) => Ok((key, payload)),
                Err(e) => Err(build_error(
                    key.timepoint as usize,
                    key.channel as usize,
                    key.level as usize,
                    key.block,
                    e,
                )),
            }
        }
    }

    /// Assemble a region of the previous level from the store, decoding each
    /// needed chunk at most once per plane
    #[allow(clippy::too_many_arguments)]
    async fn fetch_previous_region<T: VolumeScalar>(
        &self,
        writer: &ChunkStoreWriter,
        timepoint: usize,
        channel: usize,
        prev_level: usize,
        prev_extent: [usize; 3],
        prev_chunk_shape: [usize; 3],
        min: [usize; 3],
        shape: [usize; 3],
        cache: &mut HashMap<[u32; 3], Array3<T>>,
    ) -> Result<Array3<T>> {
        for block in overlapping_blocks(min, shape, prev_chunk_shape) {
            if cache.contains_key(&block) {
                continue;
            }
            let key = ChunkKey {
                timepoint: timepoint as u32,
                channel: channel as u32,
                level: prev_level as u32,
                block,
            };
            let payload = writer.read_back(&key).await?;
            let (_, bshape) = block_extent(prev_extent, prev_chunk_shape, block);
            cache.insert(
                block,
                array_from_le_bytes::<T>((bshape[2], bshape[1], bshape[0]), &payload)?,
            );
        }
        assemble_region(min, shape, prev_extent, prev_chunk_shape, cache)
    }

    /// Resolve the configured value-range mode into a concrete remap.
    /// `Compute` scans the volume plane by plane for its actual min/max.
    async fn resolve_remap<T: VolumeScalar>(
        &self,
        volume: &Arc<dyn PixelVolume<T>>,
    ) -> Result<Remap> {
        match self.config.value_range {
            ValueRangeMode::TakeFromSource => Ok(Remap::identity()),
            ValueRangeMode::Explicit { min, max } => {
                let range = ValueRange::new(min, max);
                if !range.is_valid() {
                    return Err(ExportError::InvalidFormat(format!(
                        "explicit value range [{}, {}] is not valid",
                        min, max
                    )));
                }
                Ok(Remap::linear::<T>(range))
            }
            ValueRangeMode::Compute => {
                let volume = volume.clone();
                let range = task::spawn_blocking(move || -> Result<ValueRange> {
                    let extent = volume.extent();
                    let mut lo = f64::INFINITY;
                    let mut hi = f64::NEG_INFINITY;
                    for z in 0..extent[2] {
                        let plane = volume.read_region([0, 0, z], [extent[0], extent[1], 1])?;
                        for &v in plane.iter() {
                            let v = v.to_f64();
                            lo = lo.min(v);
                            hi = hi.max(v);
                        }
                    }
                    Ok(ValueRange::new(lo, hi))
                })
                .await
                .map_err(|e| ExportError::Worker(e.to_string()))??;
                debug!("computed source value range [{}, {}]", range.min, range.max);
                Ok(Remap::linear::<T>(range))
            }
        }
    }
}

fn build_error(
    timepoint: usize,
    channel: usize,
    level: usize,
    block: [u32; 3],
    source: ExportError,
) -> ExportError {
    match source {
        // keep the innermost block context
        e @ ExportError::PyramidBuild { .. } => e,
        e => ExportError::PyramidBuild {
            timepoint,
            channel,
            level,
            block,
            source: Box::new(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::progress::NullProgress;
    use crate::volume::InMemoryVolume;
    use tempfile::TempDir;

    fn remap_to_u8(min: f64, max: f64) -> Remap {
        Remap::linear::<u8>(ValueRange::new(min, max))
    }

    #[test]
    fn test_remap_linear() {
        let remap = remap_to_u8(0.0, 510.0);
        assert_eq!(remap.map(0.0), 0.0);
        assert_eq!(remap.map(510.0), 255.0);
        assert_eq!(remap.map(255.0), 127.5);

        let degenerate = remap_to_u8(5.0, 5.0);
        assert_eq!(degenerate.map(5.0), 0.0);
    }

    #[test]
    fn test_downsample_mean_of_constant_is_constant() {
        let src = Array3::from_elem((8, 8, 8), 42u8);
        let out = downsample_block(&src, [2, 2, 2], [4, 4, 4], DownsampleMode::Mean, Remap::identity());
        assert!(out.iter().all(|&v| v == 42));
    }

    #[test]
    fn test_downsample_mean_window() {
        // 2x2x1 windows over a gradient along x: mean of {2k, 2k+1} = 2k + 0.5 -> rounds up
        let src = Array3::from_shape_fn((1, 2, 4), |(_, _, x)| (2 * x) as u16);
        let out = downsample_block(&src, [2, 2, 1], [2, 1, 1], DownsampleMode::Mean, Remap::identity());
        assert_eq!(out[[0, 0, 0]], 1); // mean of 0,2,0,2 = 1
        assert_eq!(out[[0, 0, 1]], 5); // mean of 4,6,4,6 = 5
    }

    #[test]
    fn test_downsample_nearest_picks_window_origin() {
        let src = Array3::from_shape_fn((2, 2, 4), |(z, y, x)| (x + 10 * y + 100 * z) as u32);
        let out = downsample_block(&src, [2, 2, 2], [2, 1, 1], DownsampleMode::Nearest, Remap::identity());
        assert_eq!(out[[0, 0, 0]], 0);
        assert_eq!(out[[0, 0, 1]], 2);
    }

    #[test]
    fn test_downsample_clipped_edge_window() {
        // extent 3 along x with factor 2: second window holds a single sample
        let src = Array3::from_shape_fn((1, 1, 3), |(_, _, x)| (x * 10) as u8);
        let out = downsample_block(&src, [2, 1, 1], [2, 1, 1], DownsampleMode::Mean, Remap::identity());
        assert_eq!(out[[0, 0, 0]], 5); // mean of 0, 10
        assert_eq!(out[[0, 0, 1]], 20); // lone edge sample
    }

    #[tokio::test]
    async fn test_build_single_volume_two_levels() {
        let dir = TempDir::new().unwrap();
        let config = ExportConfig::new(
            dir.path().join("meta.json"),
            dir.path().join("dataset"),
        )
        .with_schedule(
            vec![[1, 1, 1], [2, 2, 1]],
            vec![[16, 16, 4], [8, 8, 4]],
        );
        let schedule =
            MipmapSchedule::from_parts(&config.resolutions, &config.subdivisions).unwrap();
        let monitor = CacheEvictionMonitor::with_probe(u64::MAX, Box::new(|| 0));
        let builder = PyramidBuilder::new(&schedule, &config, &monitor);

        let mut sources: SourceVolumes<u16> = SourceVolumes::new();
        sources.insert(
            0,
            0,
            Arc::new(InMemoryVolume::from_fn([32, 32, 4], |x, y, _z| (x + y) as u16)),
        );

        let mut writer =
            ChunkStoreWriter::create(dir.path().join("dataset.mvx"), CompressionMethod::None)
                .await
                .unwrap();
        builder
            .build(&sources, &mut writer, 0..1, 0..1, &NullProgress)
            .await
            .unwrap();
        let summary = writer.finalize().await.unwrap();

        // level 0: 2x2x1 blocks, level 1: 2x2x1 blocks of the 16x16x4 extent
        assert_eq!(summary.chunk_count, 4 + 4);
    }

    #[tokio::test]
    async fn test_build_missing_volume_fails() {
        let dir = TempDir::new().unwrap();
        let config = ExportConfig::new(dir.path().join("m.json"), dir.path().join("d"))
            .with_schedule(vec![[1, 1, 1]], vec![[8, 8, 8]]);
        let schedule =
            MipmapSchedule::from_parts(&config.resolutions, &config.subdivisions).unwrap();
        let monitor = CacheEvictionMonitor::with_probe(u64::MAX, Box::new(|| 0));
        let builder = PyramidBuilder::new(&schedule, &config, &monitor);

        let sources: SourceVolumes<u8> = SourceVolumes::new();
        let mut writer = ChunkStoreWriter::create(dir.path().join("d.mvx"), CompressionMethod::None)
            .await
            .unwrap();
        let err = builder
            .build(&sources, &mut writer, 0..1, 0..1, &NullProgress)
            .await;
        assert!(matches!(err, Err(ExportError::MissingVolume { .. })));
    }
}
