//! Packed chunk-store container
//!
//! One store file holds, per (timepoint, channel, level), a grid of
//! fixed-shape chunks. Layout:
//!
//! ```text
//! magic "MVX\0" | format version u32 LE | chunk records ... |
//! bincode chunk index | index length u64 LE | magic "MVX\0"
//! ```
//!
//! Records are appended in the order the builder completes planes, which is
//! deterministic, so identical inputs produce byte-identical files. Every
//! index entry carries a CRC32 of the uncompressed payload, verified on
//! read-back.

use crate::compression::{get_compressor, CompressionLevel, CompressionMethod};
use crate::error::{ExportError, Result};
use crate::planner::block_extent;
use crate::utils::{calculate_checksum, verify_checksum};
use crate::volume::{array_from_le_bytes, VolumeScalar};
use bytes::Bytes;
use ndarray::{s, Array3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Magic number of the chunk-store container
pub const STORE_MAGIC: &[u8; 4] = b"MVX\0";

/// Current container format version
pub const STORE_FORMAT_VERSION: u32 = 1;

const HEADER_LEN: u64 = 8;
const TRAILER_LEN: u64 = 12;

/// Identity of one chunk within a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub timepoint: u32,
    pub channel: u32,
    pub level: u32,
    /// Block coordinate within the level grid, [x, y, z]
    pub block: [u32; 3],
}

/// One record of the index footer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkIndexEntry {
    pub key: ChunkKey,
    pub offset: u64,
    pub compressed_len: u32,
    pub uncompressed_len: u32,
    pub compression: u8,
    pub checksum: u32,
}

/// Result of finalizing one store file
#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub path: PathBuf,
    pub chunk_count: usize,
    pub bytes_written: u64,
}

/// Append-only writer for one container file
pub struct ChunkStoreWriter {
    path: PathBuf,
    file: File,
    offset: u64,
    method: CompressionMethod,
    entries: Vec<ChunkIndexEntry>,
    by_key: HashMap<ChunkKey, usize>,
}

impl ChunkStoreWriter {
    /// Create the container file (parent directories included) and write its header
    pub async fn create(path: impl AsRef<Path>, method: CompressionMethod) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(&path).await?;
        file.write_all(STORE_MAGIC).await?;
        file.write_all(&STORE_FORMAT_VERSION.to_le_bytes()).await?;
        Ok(Self {
            path,
            file,
            offset: HEADER_LEN,
            method,
            entries: Vec::new(),
            by_key: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_count(&self) -> usize {
        self.entries.len()
    }

    /// Compress and append one chunk payload (uncompressed LE voxel bytes)
    pub async fn put_chunk(&mut self, key: ChunkKey, payload: &[u8]) -> Result<()> {
        if self.by_key.contains_key(&key) {
            return Err(ExportError::InvalidFormat(format!(
                "duplicate chunk {:?}",
                key
            )));
        }
        let compressed =
            get_compressor(self.method).compress(payload, CompressionLevel::default())?;
        self.file.write_all(&compressed).await?;
        let entry = ChunkIndexEntry {
            key,
            offset: self.offset,
            compressed_len: compressed.len() as u32,
            uncompressed_len: payload.len() as u32,
            compression: self.method as u8,
            checksum: calculate_checksum(payload),
        };
        self.offset += compressed.len() as u64;
        self.by_key.insert(key, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }

    /// Read back an already-appended chunk through a fresh handle on the same
    /// path. Used for loopback: level L+1 resampling level L's output.
    pub async fn read_back(&self, key: &ChunkKey) -> Result<Bytes> {
        let entry = self
            .by_key
            .get(key)
            .map(|&i| &self.entries[i])
            .ok_or(ExportError::ChunkNotFound(
                key.timepoint,
                key.channel,
                key.level,
                key.block,
            ))?;
        read_entry(&self.path, entry).await
    }

    /// Write the index footer and close the file
    pub async fn finalize(mut self) -> Result<StoreSummary> {
        let index = bincode::serialize(&self.entries)?;
        self.file.write_all(&index).await?;
        self.file.write_all(&(index.len() as u64).to_le_bytes()).await?;
        self.file.write_all(STORE_MAGIC).await?;
        self.file.flush().await?;
        Ok(StoreSummary {
            path: self.path,
            chunk_count: self.entries.len(),
            bytes_written: self.offset + index.len() as u64 + TRAILER_LEN,
        })
    }
}

async fn read_entry(path: &Path, entry: &ChunkIndexEntry) -> Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(entry.offset)).await?;
    let mut compressed = vec![0u8; entry.compressed_len as usize];
    file.read_exact(&mut compressed).await?;

    let method = CompressionMethod::from_u8(entry.compression).ok_or_else(|| {
        ExportError::InvalidFormat(format!("unknown compression code {}", entry.compression))
    })?;
    let payload = get_compressor(method)
        .decompress(&compressed, Some(entry.uncompressed_len as usize))?;
    if payload.len() != entry.uncompressed_len as usize {
        return Err(ExportError::InvalidFormat(format!(
            "chunk {:?} decompressed to {} bytes, expected {}",
            entry.key,
            payload.len(),
            entry.uncompressed_len
        )));
    }
    if !verify_checksum(&payload, entry.checksum) {
        return Err(ExportError::InvalidFormat(format!(
            "checksum mismatch for chunk {:?}",
            entry.key
        )));
    }
    Ok(Bytes::from(payload))
}

/// Read-only view of a finalized container file
pub struct ChunkStoreReader {
    path: PathBuf,
    index: HashMap<ChunkKey, ChunkIndexEntry>,
}

impl ChunkStoreReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).await?;

        let mut header = [0u8; 8];
        file.read_exact(&mut header).await?;
        if &header[..4] != STORE_MAGIC {
            return Err(ExportError::InvalidFormat(
                "bad container magic".to_string(),
            ));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != STORE_FORMAT_VERSION {
            return Err(ExportError::InvalidFormat(format!(
                "unsupported container version {}",
                version
            )));
        }

        let total = file.metadata().await?.len();
        if total < HEADER_LEN + TRAILER_LEN {
            return Err(ExportError::InvalidFormat(
                "container truncated before trailer".to_string(),
            ));
        }
        file.seek(SeekFrom::End(-(TRAILER_LEN as i64))).await?;
        let mut trailer = [0u8; 12];
        file.read_exact(&mut trailer).await?;
        if &trailer[8..12] != STORE_MAGIC {
            return Err(ExportError::InvalidFormat(
                "bad trailing magic; store was not finalized".to_string(),
            ));
        }
        let index_len = u64::from_le_bytes(trailer[..8].try_into().unwrap());
        if index_len > total - HEADER_LEN - TRAILER_LEN {
            return Err(ExportError::InvalidFormat(
                "index length exceeds file size".to_string(),
            ));
        }

        file.seek(SeekFrom::Start(total - TRAILER_LEN - index_len))
            .await?;
        let mut index_bytes = vec![0u8; index_len as usize];
        file.read_exact(&mut index_bytes).await?;
        let entries: Vec<ChunkIndexEntry> = bincode::deserialize(&index_bytes)?;

        Ok(Self {
            path,
            index: entries.into_iter().map(|e| (e.key, e)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChunkKey> {
        self.index.keys()
    }

    /// Uncompressed payload of one chunk
    pub async fn read_chunk(&self, key: &ChunkKey) -> Result<Bytes> {
        let entry = self.index.get(key).ok_or(ExportError::ChunkNotFound(
            key.timepoint,
            key.channel,
            key.level,
            key.block,
        ))?;
        read_entry(&self.path, entry).await
    }

    /// Assemble an arbitrary voxel region of one level from its chunks.
    /// `level_extent` and `chunk_shape` come from the schedule; `min`/`shape`
    /// are level voxel coordinates ([x, y, z]).
    pub async fn read_region<T: VolumeScalar>(
        &self,
        timepoint: u32,
        channel: u32,
        level: u32,
        level_extent: [usize; 3],
        chunk_shape: [usize; 3],
        min: [usize; 3],
        shape: [usize; 3],
    ) -> Result<Array3<T>> {
        let blocks = overlapping_blocks(min, shape, chunk_shape);
        let mut chunks = HashMap::with_capacity(blocks.len());
        for block in blocks {
            let key = ChunkKey {
                timepoint,
                channel,
                level,
                block,
            };
            let payload = self.read_chunk(&key).await?;
            let (_, block_shape) = block_extent(level_extent, chunk_shape, block);
            chunks.insert(
                block,
                array_from_le_bytes::<T>(
                    (block_shape[2], block_shape[1], block_shape[0]),
                    &payload,
                )?,
            );
        }
        assemble_region(min, shape, level_extent, chunk_shape, &chunks)
    }
}

/// Block coordinates of all chunks overlapping the voxel region, row-major (x fastest)
pub(crate) fn overlapping_blocks(
    min: [usize; 3],
    shape: [usize; 3],
    chunk_shape: [usize; 3],
) -> Vec<[u32; 3]> {
    let lo: Vec<usize> = (0..3).map(|a| min[a] / chunk_shape[a]).collect();
    let hi: Vec<usize> = (0..3)
        .map(|a| (min[a] + shape[a] - 1) / chunk_shape[a])
        .collect();
    let mut blocks = Vec::new();
    for bz in lo[2]..=hi[2] {
        for by in lo[1]..=hi[1] {
            for bx in lo[0]..=hi[0] {
                blocks.push([bx as u32, by as u32, bz as u32]);
            }
        }
    }
    blocks
}

/// Stitch decoded chunks into one contiguous region array. `chunks` must hold
/// every block overlapping the region (extra entries are ignored).
pub(crate) fn assemble_region<T: VolumeScalar>(
    min: [usize; 3],
    shape: [usize; 3],
    level_extent: [usize; 3],
    chunk_shape: [usize; 3],
    chunks: &HashMap<[u32; 3], Array3<T>>,
) -> Result<Array3<T>> {
    let mut out = Array3::from_elem((shape[2], shape[1], shape[0]), T::from_f64_clamped(0.0));
    for block in overlapping_blocks(min, shape, chunk_shape) {
        let chunk = chunks.get(&block).ok_or_else(|| {
            ExportError::InvalidFormat(format!(
                "missing chunk {:?} for region min {:?} shape {:?}",
                block, min, shape
            ))
        })?;
        let (block_min, block_shape) = block_extent(level_extent, chunk_shape, block);
        // intersection of [min, min+shape) with this block, in level coords
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for a in 0..3 {
            lo[a] = min[a].max(block_min[a]);
            hi[a] = (min[a] + shape[a]).min(block_min[a] + block_shape[a]);
        }
        out.slice_mut(s![
            lo[2] - min[2]..hi[2] - min[2],
            lo[1] - min[1]..hi[1] - min[1],
            lo[0] - min[0]..hi[0] - min[0]
        ])
        .assign(&chunk.slice(s![
            lo[2] - block_min[2]..hi[2] - block_min[2],
            lo[1] - block_min[1]..hi[1] - block_min[1],
            lo[0] - block_min[0]..hi[0] - block_min[0]
        ]));
    }
    Ok(out)
}
