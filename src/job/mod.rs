//! Job model for the texture pipeline
//!
//! A job names one unit of work: a resource, the variant wanted from it
//! (thumbnail, decoded original or GPU-compressed form) and how eager the
//! request is about recomputing. Two jobs are duplicates when they target the
//! same resource and variant; id and policy are ignored for that purpose.

mod queue;
mod runner;

pub use queue::JobQueue;
pub use runner::{Completion, JobRunner, WorkFn};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::paths;

/// Identifier of a texture resource (the descriptor file path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Create a key, normalizing path separators
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(paths::normalize_key(path.as_ref()))
    }

    /// Create a key from a filesystem path
    pub fn from_path(path: &Path) -> Self {
        Self::new(path.to_string_lossy())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target hardware families for converted textures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GpuFamily {
    #[serde(rename = "ios")]
    PowerVrIos,
    #[serde(rename = "android")]
    PowerVrAndroid,
    #[serde(rename = "tegra")]
    Tegra,
    #[serde(rename = "mali")]
    Mali,
    #[serde(rename = "adreno")]
    Adreno,
    #[serde(rename = "dx11")]
    Dx11,
}

impl GpuFamily {
    /// Every known family, in lane order
    pub const ALL: [GpuFamily; 6] = [
        GpuFamily::PowerVrIos,
        GpuFamily::PowerVrAndroid,
        GpuFamily::Tegra,
        GpuFamily::Mali,
        GpuFamily::Adreno,
        GpuFamily::Dx11,
    ];

    /// Short name used in artifact file names, config and CLI
    pub fn name(&self) -> &'static str {
        match self {
            GpuFamily::PowerVrIos => "ios",
            GpuFamily::PowerVrAndroid => "android",
            GpuFamily::Tegra => "tegra",
            GpuFamily::Mali => "mali",
            GpuFamily::Adreno => "adreno",
            GpuFamily::Dx11 => "dx11",
        }
    }

    /// Human readable name for logs and progress output
    pub fn display_name(&self) -> &'static str {
        match self {
            GpuFamily::PowerVrIos => "PowerVR_iOS",
            GpuFamily::PowerVrAndroid => "PowerVR_Android",
            GpuFamily::Tegra => "tegra",
            GpuFamily::Mali => "mali",
            GpuFamily::Adreno => "adreno",
            GpuFamily::Dx11 => "dx11",
        }
    }

    /// Parse from either the short or the display name
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ios" | "powervr_ios" | "iosgpu" => Some(GpuFamily::PowerVrIos),
            "android" | "powervr_android" => Some(GpuFamily::PowerVrAndroid),
            "tegra" => Some(GpuFamily::Tegra),
            "mali" => Some(GpuFamily::Mali),
            "adreno" => Some(GpuFamily::Adreno),
            "dx11" => Some(GpuFamily::Dx11),
            _ => None,
        }
    }
}

impl fmt::Display for GpuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Which derived form of a texture is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variant {
    Thumbnail,
    Original,
    Converted(GpuFamily),
}

impl Variant {
    /// Name used for worker threads and log lines
    pub fn name(&self) -> String {
        match self {
            Variant::Thumbnail => "thumbnail".to_string(),
            Variant::Original => "original".to_string(),
            Variant::Converted(family) => format!("converted-{}", family.name()),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// How eager a request is about recomputation, loosest first.
///
/// The derived ordering is the strictness ordering: merging two requests
/// keeps the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FreshnessPolicy {
    /// Never compute; serve the cache (or an on-disk artifact) or nothing
    #[serde(rename = "skip")]
    SkipIfAbsent,
    /// Compute only if nothing was produced before
    #[serde(rename = "missing")]
    OnlyIfMissing,
    /// Compute if the existing result is older than its source or settings
    #[serde(rename = "stale")]
    OnlyIfStale,
    /// Always recompute
    #[serde(rename = "force")]
    Force,
}

impl FreshnessPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            FreshnessPolicy::SkipIfAbsent => "skip",
            FreshnessPolicy::OnlyIfMissing => "missing",
            FreshnessPolicy::OnlyIfStale => "stale",
            FreshnessPolicy::Force => "force",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "skip" | "skip-if-absent" => Some(FreshnessPolicy::SkipIfAbsent),
            "missing" | "only-if-missing" => Some(FreshnessPolicy::OnlyIfMissing),
            "stale" | "modified" | "only-if-stale" => Some(FreshnessPolicy::OnlyIfStale),
            "force" => Some(FreshnessPolicy::Force),
            _ => None,
        }
    }

    /// The stricter of two policies
    pub fn strictest(self, other: FreshnessPolicy) -> FreshnessPolicy {
        self.max(other)
    }
}

pub type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of texture work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub key: ResourceKey,
    pub variant: Variant,
    pub policy: FreshnessPolicy,
}

impl Job {
    /// Create a job with the next process-wide id
    pub fn new(key: ResourceKey, variant: Variant, policy: FreshnessPolicy) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            key,
            variant,
            policy,
        }
    }

    /// Identity used for deduplication: (key, variant)
    pub fn dedup_key(&self) -> (ResourceKey, Variant) {
        (self.key.clone(), self.variant)
    }

    /// Returns this job carrying the stricter of both policies
    pub fn merge_policy(&self, other: &Job) -> Job {
        Job {
            policy: self.policy.strictest(other.policy),
            ..self.clone()
        }
    }
}
