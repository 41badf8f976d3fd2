//! Events and outcomes reported by the pipeline

use std::path::PathBuf;

use crate::job::{GpuFamily, JobId, ResourceKey, Variant};
use crate::textures::TextureInfo;

/// Notifications produced on the owning thread by [`Pipeline::pump`](super::Pipeline::pump)
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ThumbnailLoaded {
        key: ResourceKey,
        payload: TextureInfo,
    },
    OriginalLoaded {
        key: ResourceKey,
        payload: TextureInfo,
    },
    ConvertedLoaded {
        key: ResourceKey,
        family: GpuFamily,
        payload: TextureInfo,
    },
    ConvertProgress(ConvertProgress),
    /// Every converted lane went idle with nothing queued
    ConvertedAllDone(BatchReport),
    CacheCleared,
}

/// Progress of the current conversion batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertProgress {
    pub completed: usize,
    pub total: usize,
    pub current_path: PathBuf,
    pub family: GpuFamily,
}

/// Summary of a conversion batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Jobs that finished, successfully or not
    pub completed: usize,
    /// Jobs accepted into the batch (minus cancelled ones)
    pub total: usize,
    /// Jobs that actually ran the encoder
    pub reconverted: usize,
    /// Descriptors whose conversion failed
    pub failed: Vec<PathBuf>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.completed.saturating_sub(self.failed.len())
    }

    /// One-line summary for logs and CLI output
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}/{} converted textures ready ({} re-encoded, {} failed)",
            self.succeeded(),
            self.total,
            self.reconverted,
            self.failed.len()
        );
        if self.cancelled {
            line.push_str(", cancelled");
        }
        line
    }
}

/// Result of a request call
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// Served from the cache (or a disk preload) without queueing work
    Cached(TextureInfo),
    /// A job will produce the result; `merged` is set when an existing job absorbed the request
    Queued { job_id: JobId, merged: bool },
    /// Joined an existing pending thumbnail request
    Coalesced,
    /// Nothing to do for this request
    Skipped,
}

impl RequestOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, RequestOutcome::Queued { .. })
    }
}

/// Snapshot of one lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneStatus {
    pub lane: Variant,
    pub busy: bool,
    pub pending: usize,
}
