//! Error types for pyramid export operations

use thiserror::Error;

/// Main error type for the export engine
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid mipmap schedule: {0}")]
    InvalidSchedule(String),

    #[error("pyramid build failed at timepoint {timepoint}, channel {channel}, level {level}, block {block:?}: {source}")]
    PyramidBuild {
        timepoint: usize,
        channel: usize,
        level: usize,
        block: [u32; 3],
        #[source]
        source: Box<ExportError>,
    },

    #[error("metadata write failed: {0}")]
    MetadataWrite(String),

    #[error("partition plan invariant violated: {0}")]
    PartitionPlan(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("invalid store format: {0}")]
    InvalidFormat(String),

    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no source volume registered for timepoint {timepoint}, channel {channel}")]
    MissingVolume { timepoint: usize, channel: usize },

    #[error("chunk not found: timepoint {0}, channel {1}, level {2}, block {3:?}")]
    ChunkNotFound(u32, u32, u32, [u32; 3]),

    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Specialized Result type for export operations
pub type Result<T> = std::result::Result<T, ExportError>;

impl From<bincode::Error> for ExportError {
    fn from(err: bincode::Error) -> Self {
        ExportError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Serialization(err.to_string())
    }
}
