//! Texture descriptors and the store that serves them
//!
//! A descriptor is a small JSON file (`*.tex`) next to the source image:
//!
//! ```json
//! {
//!   "source": "rock.png",
//!   "compression": {
//!     "ios": { "format": "BC3" },
//!     "dx11": { "format": "BC7", "quality": "slow" }
//!   }
//! }
//! ```
//!
//! Cube maps list their faces in `cube_faces` instead of relying on `source`.
//! Relative paths resolve against the descriptor's directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::job::{GpuFamily, ResourceKey};
use crate::paths;
use crate::textures::{CompressionFormat, CompressionQuality, CUBE_FACE_COUNT};

/// Per-family compression settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompressionSettings {
    /// Target format; `None` means this family gets no converted form
    #[serde(default)]
    pub format: Option<CompressionFormat>,
    /// Overrides the configured compression quality
    #[serde(default)]
    pub quality: Option<CompressionQuality>,
}

/// On-disk shape of a descriptor file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    source: String,
    #[serde(default)]
    cube_faces: Vec<String>,
    #[serde(default)]
    compression: HashMap<GpuFamily, CompressionSettings>,
}

/// Descriptor errors
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Failed to read descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Descriptor has neither a source image nor cube faces: {0}")]
    MissingSource(PathBuf),

    #[error("Cube map {path} lists {found} faces (at most {})", CUBE_FACE_COUNT)]
    TooManyFaces { path: PathBuf, found: usize },
}

/// Read-only description of a texture resource
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDescriptor {
    /// Path of the descriptor file itself
    pub path: PathBuf,
    /// Source image (first face for cube maps)
    pub source: PathBuf,
    /// Cube map faces; empty for plain textures
    pub faces: Vec<PathBuf>,
    pub compression: HashMap<GpuFamily, CompressionSettings>,
}

impl TextureDescriptor {
    /// Descriptor for a plain texture without any compression settings
    pub fn new(path: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            faces: Vec::new(),
            compression: HashMap::new(),
        }
    }

    /// Builder-style helper to set the format for one family
    pub fn with_format(mut self, family: GpuFamily, format: CompressionFormat) -> Self {
        self.compression.entry(family).or_default().format = Some(format);
        self
    }

    /// Builder-style helper to turn the descriptor into a cube map
    pub fn with_faces(mut self, faces: Vec<PathBuf>) -> Self {
        if let Some(first) = faces.first() {
            self.source = first.clone();
        }
        self.faces = faces;
        self
    }

    /// Load a descriptor file from disk
    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let content = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let file: DescriptorFile =
            serde_json::from_str(&content).map_err(|source| DescriptorError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if file.cube_faces.len() > CUBE_FACE_COUNT {
            return Err(DescriptorError::TooManyFaces {
                path: path.to_path_buf(),
                found: file.cube_faces.len(),
            });
        }

        let faces: Vec<PathBuf> = file
            .cube_faces
            .iter()
            .filter(|face| !face.is_empty())
            .map(|face| paths::resolve_relative(path, face))
            .collect();

        let source = if !file.source.is_empty() {
            paths::resolve_relative(path, &file.source)
        } else if let Some(first) = faces.first() {
            first.clone()
        } else {
            return Err(DescriptorError::MissingSource(path.to_path_buf()));
        };

        Ok(Self {
            path: path.to_path_buf(),
            source,
            faces,
            compression: file.compression,
        })
    }

    /// Write the descriptor back out, with paths relative to its directory where possible
    pub fn save(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        let relative = |p: &Path| -> String {
            p.strip_prefix(dir)
                .unwrap_or(p)
                .to_string_lossy()
                .to_string()
        };

        let file = DescriptorFile {
            source: if self.is_cube_map() {
                String::new()
            } else {
                relative(&self.source)
            },
            cube_faces: self.faces.iter().map(|f| relative(f)).collect(),
            compression: self.compression.clone(),
        };

        paths::ensure_parent_dirs(&self.path)?;
        let content = serde_json::to_string_pretty(&file).context("Failed to serialize descriptor")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::from_path(&self.path)
    }

    pub fn is_cube_map(&self) -> bool {
        !self.faces.is_empty()
    }

    /// Number of faces a payload for this texture carries
    pub fn face_count(&self) -> usize {
        if self.is_cube_map() {
            self.faces.len()
        } else {
            1
        }
    }

    /// Images that make up this texture
    pub fn input_paths(&self) -> Vec<&Path> {
        if self.is_cube_map() {
            self.faces.iter().map(PathBuf::as_path).collect()
        } else {
            vec![self.source.as_path()]
        }
    }

    /// Compression format for a family, if the family gets a converted form
    pub fn format_for(&self, family: GpuFamily) -> Option<CompressionFormat> {
        self.compression.get(&family).and_then(|s| s.format)
    }

    /// Quality override for a family
    pub fn quality_for(&self, family: GpuFamily) -> Option<CompressionQuality> {
        self.compression.get(&family).and_then(|s| s.quality)
    }

    /// Where the converted artifact for a family lives
    pub fn converted_path(&self, family: GpuFamily) -> PathBuf {
        paths::converted_artifact_path(&self.path, family)
    }

    /// Newest modification time among the inputs and the descriptor itself
    pub fn newest_input_time(&self) -> Option<std::time::SystemTime> {
        self.input_paths()
            .into_iter()
            .chain(std::iter::once(self.path.as_path()))
            .filter_map(paths::modified_time)
            .max()
    }

    /// Newest modification time among the source images only
    pub fn source_modified(&self) -> Option<std::time::SystemTime> {
        self.input_paths()
            .into_iter()
            .filter_map(paths::modified_time)
            .max()
    }

    /// Whether the converted artifact exists and is newer than every input
    pub fn is_converted_actual(&self, family: GpuFamily) -> bool {
        let Some(artifact_time) = paths::modified_time(&self.converted_path(family)) else {
            return false;
        };
        match self.newest_input_time() {
            Some(input_time) => artifact_time >= input_time,
            None => true,
        }
    }
}

/// Source of texture descriptors, read-only from the pipeline's point of view
pub trait DescriptorStore: Send + Sync {
    fn descriptor(&self, key: &ResourceKey) -> Option<Arc<TextureDescriptor>>;

    /// Every known resource
    fn keys(&self) -> Vec<ResourceKey>;
}

/// Descriptors loaded from a directory tree (or inserted directly)
#[derive(Debug, Default)]
pub struct DescriptorCatalog {
    entries: BTreeMap<ResourceKey, Arc<TextureDescriptor>>,
}

impl DescriptorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.tex` file under `root`.
    ///
    /// Broken descriptors are logged and skipped.
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            anyhow::bail!("Descriptor root is not a directory: {}", root.display());
        }

        let mut catalog = Self::new();
        let mut skipped = 0;

        for entry in WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || !paths::is_descriptor_file(path) {
                continue;
            }

            match TextureDescriptor::load(path) {
                Ok(descriptor) => {
                    debug!("Loaded descriptor {}", path.display());
                    catalog.insert(descriptor);
                }
                Err(e) => {
                    warn!("Skipping descriptor: {}", e);
                    skipped += 1;
                }
            }
        }

        info!(
            "Loaded {} texture descriptors from {} ({} skipped)",
            catalog.len(),
            root.display(),
            skipped
        );
        Ok(catalog)
    }

    pub fn insert(&mut self, descriptor: TextureDescriptor) -> ResourceKey {
        let key = descriptor.key();
        self.entries.insert(key.clone(), Arc::new(descriptor));
        key
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TextureDescriptor>> {
        self.entries.values()
    }
}

impl DescriptorStore for DescriptorCatalog {
    fn descriptor(&self, key: &ResourceKey) -> Option<Arc<TextureDescriptor>> {
        self.entries.get(key).cloned()
    }

    fn keys(&self) -> Vec<ResourceKey> {
        self.entries.keys().cloned().collect()
    }
}
