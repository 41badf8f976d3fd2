//! Decoded texture payload shared between the workers, the cache and observers

use image::RgbaImage;
use std::sync::Arc;
use std::time::SystemTime;

/// Number of faces in a cube map
pub const CUBE_FACE_COUNT: usize = 6;

/// Pixel data plus metadata for one texture variant.
///
/// Faces are reference counted so a payload can be handed to many observers
/// and cache tiers without copying pixels. A face that failed to load is
/// `None`; a payload with no faces or any missing face is a stub.
#[derive(Debug, Clone, Default)]
pub struct TextureInfo {
    /// One image per face (1 for plain textures, one per listed cube face)
    pub images: Vec<Option<Arc<RgbaImage>>>,
    /// Estimated size in memory/on the GPU
    pub data_size: u64,
    /// Size of the file(s) on disk
    pub file_size: u64,
    /// Width and height of the first face
    pub dimensions: (u32, u32),
    /// Source modification time when this payload was produced
    pub source_modified: Option<SystemTime>,
}

impl TextureInfo {
    /// Placeholder for a texture that could not be produced
    pub fn stub(faces: usize) -> Self {
        Self {
            images: vec![None; faces.max(1)],
            ..Self::default()
        }
    }

    /// Build a payload from decoded faces, taking dimensions from the first one
    pub fn from_faces(faces: Vec<Option<RgbaImage>>) -> Self {
        let dimensions = faces
            .iter()
            .flatten()
            .next()
            .map(|img| img.dimensions())
            .unwrap_or((0, 0));

        Self {
            images: faces.into_iter().map(|face| face.map(Arc::new)).collect(),
            dimensions,
            ..Self::default()
        }
    }

    /// True when the payload carries no usable pixels
    pub fn is_stub(&self) -> bool {
        self.images.is_empty() || self.images.iter().any(Option::is_none)
    }

    pub fn face_count(&self) -> usize {
        self.images.len()
    }

    /// First available face
    pub fn first_image(&self) -> Option<&Arc<RgbaImage>> {
        self.images.iter().flatten().next()
    }
}
