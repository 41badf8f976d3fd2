//! Pipeline configuration
//!
//! Stored in ~/.config/texconv/config.json unless a path is given explicitly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::cache::CacheBudgets;
use crate::job::GpuFamily;
use crate::textures::CompressionQuality;

/// Tunables for the pipeline and the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Thumbnails kept in memory
    pub thumbnail_budget: usize,

    /// Decoded originals kept in memory
    pub original_budget: usize,

    /// Converted textures kept in memory, per GPU family
    pub converted_budget: usize,

    /// Edge length of the square thumbnails, in pixels
    pub thumbnail_size: u32,

    /// Default encoder effort when a descriptor does not override it
    pub quality: CompressionQuality,

    /// How long a blocking wait sleeps on the completion channel between cancel checks
    pub wait_poll_ms: u64,

    /// GPU families that get a converted lane
    pub families: Vec<GpuFamily>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thumbnail_budget: 100,
            original_budget: 1,
            converted_budget: 1,
            thumbnail_size: 64,
            quality: CompressionQuality::Normal,
            wait_poll_ms: 50,
            families: GpuFamily::ALL.to_vec(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} budget must be at least 1")]
    ZeroBudget(&'static str),

    #[error("Thumbnail size must be between 1 and 4096, got {0}")]
    InvalidThumbnailSize(u32),

    #[error("Wait poll interval must be at least 1 ms")]
    ZeroPollInterval,

    #[error("GPU family listed twice: {0}")]
    DuplicateFamily(GpuFamily),
}

impl PipelineConfig {
    /// Get the config directory path (~/.config/texconv)
    fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("texconv");

        Ok(config_dir)
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load the config, or return defaults if it is missing or broken
    pub fn load(path: Option<&Path>) -> Self {
        let result = match path {
            Some(path) => Self::load_from(path),
            None => Self::default_path().and_then(|path| Self::load_from(&path)),
        };

        match result {
            Ok(config) => config,
            Err(e) => {
                warn!("Could not load config: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

        let config: Self =
            serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Save to `path`, or the default location
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content).with_context(|| format!("Failed to write {:?}", path))?;

        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thumbnail_budget == 0 {
            return Err(ConfigError::ZeroBudget("Thumbnail"));
        }
        if self.original_budget == 0 {
            return Err(ConfigError::ZeroBudget("Original"));
        }
        if self.converted_budget == 0 {
            return Err(ConfigError::ZeroBudget("Converted"));
        }
        if self.thumbnail_size == 0 || self.thumbnail_size > 4096 {
            return Err(ConfigError::InvalidThumbnailSize(self.thumbnail_size));
        }
        if self.wait_poll_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        for (i, family) in self.families.iter().enumerate() {
            if self.families[..i].contains(family) {
                return Err(ConfigError::DuplicateFamily(*family));
            }
        }
        Ok(())
    }

    pub fn budgets(&self) -> CacheBudgets {
        CacheBudgets {
            thumbnails: self.thumbnail_budget,
            originals: self.original_budget,
            converted: self.converted_budget,
        }
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }
}
