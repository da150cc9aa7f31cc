//! Source pixel volumes and the scalar types they carry
//!
//! A [`PixelVolume`] is the engine's read-only view of one (channel, timepoint)
//! worth of source pixels. Regions are returned as `ndarray::Array3` with axes
//! ordered (z, y, x), so x varies fastest in memory; chunk payloads use the
//! same order.

use crate::error::{ExportError, Result};
use crate::types::ScalarType;
use ndarray::{s, Array2, Array3};
use num_traits::Bounded;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Scalar element of a pixel volume (8/16/32-bit unsigned)
pub trait VolumeScalar:
    Copy + Send + Sync + PartialOrd + Bounded + std::fmt::Debug + 'static
{
    const BYTES: usize;
    const TYPE: ScalarType;

    fn to_f64(self) -> f64;

    /// Round to nearest and clamp into the scalar's value range
    fn from_f64_clamped(v: f64) -> Self;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_volume_scalar {
    ($ty:ty, $scalar:expr) => {
        impl VolumeScalar for $ty {
            const BYTES: usize = std::mem::size_of::<$ty>();
            const TYPE: ScalarType = $scalar;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64_clamped(v: f64) -> Self {
                let r = v.round();
                if !(r > 0.0) {
                    0
                } else if r >= <$ty>::MAX as f64 {
                    <$ty>::MAX
                } else {
                    r as $ty
                }
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_volume_scalar!(u8, ScalarType::U8);
impl_volume_scalar!(u16, ScalarType::U16);
impl_volume_scalar!(u32, ScalarType::U32);

/// Serialize a region to little-endian bytes, x fastest
pub fn array_to_le_bytes<T: VolumeScalar>(array: &Array3<T>) -> Vec<u8> {
    let mut out = Vec::with_capacity(array.len() * T::BYTES);
    for &v in array.iter() {
        v.write_le(&mut out);
    }
    out
}

/// Deserialize a region from little-endian bytes; `shape` is (z, y, x)
pub fn array_from_le_bytes<T: VolumeScalar>(
    shape: (usize, usize, usize),
    bytes: &[u8],
) -> Result<Array3<T>> {
    let count = shape.0 * shape.1 * shape.2;
    if bytes.len() != count * T::BYTES {
        return Err(ExportError::InvalidFormat(format!(
            "chunk payload size mismatch: expected {} bytes for shape {:?}, got {}",
            count * T::BYTES,
            shape,
            bytes.len()
        )));
    }
    let samples: Vec<T> = bytes.chunks_exact(T::BYTES).map(T::read_le).collect();
    Array3::from_shape_vec(shape, samples)
        .map_err(|e| ExportError::InvalidFormat(e.to_string()))
}

/// Capability of a lazily-decoded volume to drop its decode cache.
/// Host-supplied; only volumes that support eviction implement it.
pub trait ClearableCache: Send + Sync {
    fn clear(&self);
}

/// Read-only source of pixels for one (channel, timepoint) pair
pub trait PixelVolume<T: VolumeScalar>: Send + Sync {
    /// Extent in voxels as [x, y, z]
    fn extent(&self) -> [usize; 3];

    /// Copy the axis-aligned region starting at `min` (voxel coords, [x, y, z])
    /// with `shape` voxels. Returned array axes are (z, y, x).
    fn read_region(&self, min: [usize; 3], shape: [usize; 3]) -> Result<Array3<T>>;

    /// Uncompressed size of the full volume in bytes
    fn size_in_bytes(&self) -> u64 {
        let e = self.extent();
        (e[0] * e[1] * e[2] * T::BYTES) as u64
    }

    /// Bytes of one decoded z-plane
    fn plane_size_bytes(&self) -> u64 {
        let e = self.extent();
        (e[0] * e[1] * T::BYTES) as u64
    }

    /// Decode cache of a lazily-decoded volume, if it has one
    fn cache(&self) -> Option<&dyn ClearableCache> {
        None
    }
}

fn check_bounds(extent: [usize; 3], min: [usize; 3], shape: [usize; 3]) -> Result<()> {
    for a in 0..3 {
        if shape[a] == 0 || min[a] + shape[a] > extent[a] {
            return Err(ExportError::OutOfBounds(format!(
                "region min {:?} shape {:?} exceeds extent {:?}",
                min, shape, extent
            )));
        }
    }
    Ok(())
}

/// Volume fully resident in memory
pub struct InMemoryVolume<T: VolumeScalar> {
    /// Axes ordered (z, y, x)
    data: Array3<T>,
}

impl<T: VolumeScalar> InMemoryVolume<T> {
    /// Wrap an existing array with axes ordered (z, y, x)
    pub fn from_array(data: Array3<T>) -> Self {
        Self { data }
    }

    /// Volume of the given extent ([x, y, z]) filled from `f(x, y, z)`
    pub fn from_fn(extent: [usize; 3], f: impl Fn(usize, usize, usize) -> T) -> Self {
        let data = Array3::from_shape_fn((extent[2], extent[1], extent[0]), |(z, y, x)| {
            f(x, y, z)
        });
        Self { data }
    }

    /// Volume of the given extent filled with one value
    pub fn constant(extent: [usize; 3], value: T) -> Self {
        Self {
            data: Array3::from_elem((extent[2], extent[1], extent[0]), value),
        }
    }
}

impl<T: VolumeScalar> PixelVolume<T> for InMemoryVolume<T> {
    fn extent(&self) -> [usize; 3] {
        let (z, y, x) = self.data.dim();
        [x, y, z]
    }

    fn read_region(&self, min: [usize; 3], shape: [usize; 3]) -> Result<Array3<T>> {
        check_bounds(self.extent(), min, shape)?;
        Ok(self
            .data
            .slice(s![
                min[2]..min[2] + shape[2],
                min[1]..min[1] + shape[1],
                min[0]..min[0] + shape[0]
            ])
            .to_owned())
    }
}

/// Plane decoder for a [`LazyVolume`]: produces one z-plane with axes (y, x)
pub type PlaneDecoder<T> = dyn Fn(usize) -> Array2<T> + Send + Sync;

/// Lazily-decoded volume backed by a per-plane decode cache.
///
/// Planes are decoded on first access and retained until the cache is cleared,
/// which is what [`crate::memory::CacheEvictionMonitor`] does under memory
/// pressure. Clearing is mutually exclusive with cache lookups (one lock),
/// never with copies out of a plane that a reader already holds.
pub struct LazyVolume<T: VolumeScalar> {
    extent: [usize; 3],
    decode: Box<PlaneDecoder<T>>,
    planes: Mutex<HashMap<usize, Arc<Array2<T>>>>,
    clears: AtomicUsize,
}

impl<T: VolumeScalar> LazyVolume<T> {
    pub fn new(
        extent: [usize; 3],
        decode: impl Fn(usize) -> Array2<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            extent,
            decode: Box::new(decode),
            planes: Mutex::new(HashMap::new()),
            clears: AtomicUsize::new(0),
        }
    }

    fn plane(&self, z: usize) -> Arc<Array2<T>> {
        let mut planes = self.planes.lock();
        planes
            .entry(z)
            .or_insert_with(|| Arc::new((self.decode)(z)))
            .clone()
    }

    /// Number of planes currently cached
    pub fn cached_planes(&self) -> usize {
        self.planes.lock().len()
    }

    /// How many times the cache has been cleared
    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::Relaxed)
    }
}

impl<T: VolumeScalar> ClearableCache for LazyVolume<T> {
    fn clear(&self) {
        self.planes.lock().clear();
        self.clears.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T: VolumeScalar> PixelVolume<T> for LazyVolume<T> {
    fn extent(&self) -> [usize; 3] {
        self.extent
    }

    fn read_region(&self, min: [usize; 3], shape: [usize; 3]) -> Result<Array3<T>> {
        check_bounds(self.extent, min, shape)?;
        let mut out = Array3::from_elem(
            (shape[2], shape[1], shape[0]),
            T::from_f64_clamped(0.0),
        );
        for dz in 0..shape[2] {
            let plane = self.plane(min[2] + dz);
            out.slice_mut(s![dz, .., ..]).assign(&plane.slice(s![
                min[1]..min[1] + shape[1],
                min[0]..min[0] + shape[0]
            ]));
        }
        Ok(out)
    }

    fn cache(&self) -> Option<&dyn ClearableCache> {
        Some(self)
    }
}

/// The per-(timepoint, channel) source volumes of one export call
pub struct SourceVolumes<T: VolumeScalar> {
    map: BTreeMap<(usize, usize), Arc<dyn PixelVolume<T>>>,
}

impl<T: VolumeScalar> SourceVolumes<T> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, timepoint: usize, channel: usize, volume: Arc<dyn PixelVolume<T>>) {
        self.map.insert((timepoint, channel), volume);
    }

    pub fn get(&self, timepoint: usize, channel: usize) -> Result<&Arc<dyn PixelVolume<T>>> {
        self.map
            .get(&(timepoint, channel))
            .ok_or(ExportError::MissingVolume { timepoint, channel })
    }

    /// 1 + highest registered timepoint index
    pub fn timepoint_count(&self) -> usize {
        self.map.keys().map(|(t, _)| t + 1).max().unwrap_or(0)
    }

    /// 1 + highest registered channel index
    pub fn channel_count(&self) -> usize {
        self.map.keys().map(|(_, c)| c + 1).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<T: VolumeScalar> Default for SourceVolumes<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut bytes = Vec::new();
        0xBEEFu16.write_le(&mut bytes);
        assert_eq!(bytes, vec![0xEF, 0xBE]);
        assert_eq!(u16::read_le(&bytes), 0xBEEF);
    }

    #[test]
    fn test_from_f64_clamped() {
        assert_eq!(u8::from_f64_clamped(-3.0), 0);
        assert_eq!(u8::from_f64_clamped(0.4), 0);
        assert_eq!(u8::from_f64_clamped(127.5), 128);
        assert_eq!(u8::from_f64_clamped(300.0), 255);
        assert_eq!(u16::from_f64_clamped(f64::NAN), 0);
    }

    #[test]
    fn test_array_bytes_round_trip() {
        let vol = InMemoryVolume::from_fn([4, 3, 2], |x, y, z| (x + 10 * y + 100 * z) as u16);
        let region = vol.read_region([0, 0, 0], [4, 3, 2]).unwrap();
        let bytes = array_to_le_bytes(&region);
        assert_eq!(bytes.len(), 4 * 3 * 2 * 2);
        let back: Array3<u16> = array_from_le_bytes((2, 3, 4), &bytes).unwrap();
        assert_eq!(back, region);
    }

    #[test]
    fn test_in_memory_read_region() {
        let vol = InMemoryVolume::from_fn([8, 8, 4], |x, y, z| (x + 10 * y + 100 * z) as u32);
        assert_eq!(vol.extent(), [8, 8, 4]);
        let region = vol.read_region([2, 3, 1], [2, 1, 2]).unwrap();
        assert_eq!(region.dim(), (2, 1, 2));
        assert_eq!(region[[0, 0, 0]], 2 + 30 + 100);
        assert_eq!(region[[1, 0, 1]], 3 + 30 + 200);

        assert!(vol.read_region([7, 0, 0], [2, 1, 1]).is_err());
        assert!(vol.read_region([0, 0, 0], [0, 1, 1]).is_err());
    }

    #[test]
    fn test_lazy_volume_cache() {
        let vol = LazyVolume::new([4, 4, 4], |z| {
            Array2::from_shape_fn((4, 4), move |(y, x)| (x + y + z) as u8)
        });
        assert_eq!(vol.cached_planes(), 0);
        let region = vol.read_region([0, 0, 0], [4, 4, 2]).unwrap();
        assert_eq!(region[[1, 2, 3]], 6);
        assert_eq!(vol.cached_planes(), 2);

        vol.cache().unwrap().clear();
        assert_eq!(vol.cached_planes(), 0);
        assert_eq!(vol.clear_count(), 1);

        // re-decode after eviction yields identical pixels
        let again = vol.read_region([0, 0, 0], [4, 4, 2]).unwrap();
        assert_eq!(again, region);
    }

    #[test]
    fn test_source_volumes() {
        let mut sources: SourceVolumes<u8> = SourceVolumes::new();
        sources.insert(0, 0, Arc::new(InMemoryVolume::constant([2, 2, 2], 1)));
        sources.insert(2, 1, Arc::new(InMemoryVolume::constant([2, 2, 2], 2)));
        assert_eq!(sources.timepoint_count(), 3);
        assert_eq!(sources.channel_count(), 2);
        assert!(sources.get(1, 0).is_err());
    }
}
