//! Progress reporting back to the caller

/// Milestones emitted while an export runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// All blocks of one plane were written
    PlaneComplete {
        timepoint: usize,
        channel: usize,
        level: usize,
        plane: usize,
        blocks: usize,
    },
    /// One full pyramid level was written for a (timepoint, channel) pair
    LevelComplete {
        timepoint: usize,
        channel: usize,
        level: usize,
    },
    /// One partition file was finalized
    PartitionComplete { index: usize, total: usize },
}

/// Receives progress events; implementations must be cheap and non-blocking
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Sink that discards all events
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _event: ProgressEvent) {}
}
