//! Texture decoding and per-family compression using image_dds
//!
//! Sources are read with `image` (or image_dds for `.dds` inputs) and
//! converted artifacts are block-compressed DDS files. Cube maps are encoded
//! as a single six-layer surface.

use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use image_dds::{ddsfile::Dds, ImageFormat, Mipmaps, Quality, Surface, SurfaceRgba8};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::info::CUBE_FACE_COUNT;
use crate::descriptor::TextureDescriptor;
use crate::job::GpuFamily;
use crate::paths;

/// Supported compression formats for converted textures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompressionFormat {
    /// BC7 - High quality, best for diffuse/color textures
    BC7,
    /// BC5 - Two channel, ideal for normal maps
    BC5,
    /// BC4 - Single channel, good for grayscale
    BC4,
    /// BC3 - DXT5, good for textures with alpha
    BC3,
    /// BC2 - DXT3, explicit 4-bit alpha
    BC2,
    /// BC1 - DXT1, smallest size, no/1-bit alpha
    BC1,
    /// Uncompressed RGBA
    Rgba,
    /// Uncompressed BGRA (B8G8R8A8)
    Bgra,
}

impl CompressionFormat {
    pub fn to_image_format(self) -> ImageFormat {
        match self {
            CompressionFormat::BC7 => ImageFormat::BC7RgbaUnorm,
            CompressionFormat::BC5 => ImageFormat::BC5RgUnorm,
            CompressionFormat::BC4 => ImageFormat::BC4RUnorm,
            CompressionFormat::BC3 => ImageFormat::BC3RgbaUnorm,
            CompressionFormat::BC2 => ImageFormat::BC2RgbaUnorm,
            CompressionFormat::BC1 => ImageFormat::BC1RgbaUnorm,
            CompressionFormat::Rgba => ImageFormat::Rgba8Unorm,
            CompressionFormat::Bgra => ImageFormat::Bgra8Unorm,
        }
    }

    /// Get format name for logging
    pub fn name(&self) -> &'static str {
        match self {
            CompressionFormat::BC7 => "BC7",
            CompressionFormat::BC5 => "BC5",
            CompressionFormat::BC4 => "BC4",
            CompressionFormat::BC3 => "BC3",
            CompressionFormat::BC2 => "BC2",
            CompressionFormat::BC1 => "BC1",
            CompressionFormat::Rgba => "RGBA",
            CompressionFormat::Bgra => "BGRA",
        }
    }

    /// Parse a format name, accepting the common DXGI and DXT aliases
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BC7" | "BC7_UNORM" | "BC7_UNORM_SRGB" => Some(CompressionFormat::BC7),
            "BC5" | "BC5_UNORM" | "ATI2" => Some(CompressionFormat::BC5),
            "BC4" | "BC4_UNORM" | "ATI1" => Some(CompressionFormat::BC4),
            "BC3" | "BC3_UNORM" | "DXT5" => Some(CompressionFormat::BC3),
            "BC2" | "BC2_UNORM" | "DXT3" => Some(CompressionFormat::BC2),
            "BC1" | "BC1_UNORM" | "DXT1" => Some(CompressionFormat::BC1),
            "RGBA" | "R8G8B8A8" | "RGBA8888" => Some(CompressionFormat::Rgba),
            "BGRA" | "B8G8R8A8" | "BGRA8888" => Some(CompressionFormat::Bgra),
            _ => None,
        }
    }

    /// Storage cost in bits per pixel
    fn bits_per_pixel(self) -> u64 {
        match self {
            CompressionFormat::BC1 | CompressionFormat::BC4 => 4,
            CompressionFormat::BC2
            | CompressionFormat::BC3
            | CompressionFormat::BC5
            | CompressionFormat::BC7 => 8,
            CompressionFormat::Rgba | CompressionFormat::Bgra => 32,
        }
    }
}

impl TryFrom<String> for CompressionFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_name(&value).ok_or_else(|| format!("unknown compression format '{}'", value))
    }
}

impl From<CompressionFormat> for String {
    fn from(format: CompressionFormat) -> Self {
        format.name().to_string()
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Encoder effort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionQuality {
    Fast,
    #[default]
    Normal,
    Slow,
}

impl CompressionQuality {
    pub fn to_quality(self) -> Quality {
        match self {
            CompressionQuality::Fast => Quality::Fast,
            CompressionQuality::Normal => Quality::Normal,
            CompressionQuality::Slow => Quality::Slow,
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fast" => Some(CompressionQuality::Fast),
            "normal" => Some(CompressionQuality::Normal),
            "slow" => Some(CompressionQuality::Slow),
            _ => None,
        }
    }
}

/// Estimate the in-memory size of a texture including its mip chain.
///
/// `format` of `None` means uncompressed RGBA.
pub fn estimate_texture_size(width: u32, height: u32, faces: usize, format: Option<CompressionFormat>) -> u64 {
    let pixels = width as u64 * height as u64;
    let bits = format.map(CompressionFormat::bits_per_pixel).unwrap_or(32);
    // Mips add roughly a third
    (pixels * bits / 8) * 4 / 3 * faces.max(1) as u64
}

/// Image I/O used by the pipeline workers
pub trait TextureCodec: Send + Sync {
    /// Decode a source image to RGBA
    fn decode(&self, path: &Path) -> Result<RgbaImage>;

    /// Compress every face of `descriptor` for `family` and write the artifact.
    ///
    /// Returns the path that was written.
    fn convert_for_family(
        &self,
        descriptor: &TextureDescriptor,
        family: GpuFamily,
        quality: CompressionQuality,
    ) -> Result<PathBuf>;

    /// Decode a previously written artifact, one image per face
    fn load_converted(&self, descriptor: &TextureDescriptor, family: GpuFamily) -> Result<Vec<RgbaImage>>;
}

/// Codec backed by image_dds (BCn) and image (PNG, TGA, JPEG...)
#[derive(Debug, Default, Clone, Copy)]
pub struct DdsCodec;

impl DdsCodec {
    pub fn new() -> Self {
        Self
    }
}

fn read_dds(path: &Path) -> Result<Dds> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Dds::read(BufReader::new(file)).with_context(|| format!("Failed to parse DDS {}", path.display()))
}

/// Decode every layer of a DDS file, top mip only
fn decode_dds_layers(dds: &Dds) -> Result<Vec<RgbaImage>> {
    let surface = Surface::from_dds(dds).context("Unsupported DDS layout")?;
    let rgba = surface.decode_rgba8().context("Failed to decode DDS")?;
    let (width, height, layers) = (rgba.width, rgba.height, rgba.layers.max(1));

    // Layers are stacked vertically
    let stacked = rgba.to_image(0).context("Failed to convert DDS surface")?;
    Ok((0..layers)
        .map(|layer| image::imageops::crop_imm(&stacked, 0, layer * height, width, height).to_image())
        .collect())
}

impl TextureCodec for DdsCodec {
    fn decode(&self, path: &Path) -> Result<RgbaImage> {
        if paths::extension(path).as_deref() == Some("dds") {
            let dds = read_dds(path)?;
            return decode_dds_layers(&dds)?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("DDS has no layers: {}", path.display()));
        }

        let img = image::open(path).with_context(|| format!("Failed to decode {}", path.display()))?;
        Ok(img.to_rgba8())
    }

    fn convert_for_family(
        &self,
        descriptor: &TextureDescriptor,
        family: GpuFamily,
        quality: CompressionQuality,
    ) -> Result<PathBuf> {
        let format = descriptor
            .format_for(family)
            .ok_or_else(|| anyhow!("No compression format for {} in {}", family, descriptor.path.display()))?;

        let inputs = descriptor.input_paths();
        if descriptor.is_cube_map() && inputs.len() != CUBE_FACE_COUNT {
            anyhow::bail!(
                "Cube map {} has {} of {} faces",
                descriptor.path.display(),
                inputs.len(),
                CUBE_FACE_COUNT
            );
        }

        let faces = inputs
            .iter()
            .map(|path| self.decode(path))
            .collect::<Result<Vec<_>>>()?;
        let (width, height) = faces[0].dimensions();
        if faces.iter().any(|face| face.dimensions() != (width, height)) {
            anyhow::bail!("Faces of {} differ in size", descriptor.path.display());
        }

        debug!(
            "Encoding {} ({}x{}, {} faces) as {} for {}",
            descriptor.path.display(),
            width,
            height,
            faces.len(),
            format,
            family
        );

        let mut data = Vec::with_capacity(faces.len() * (width * height * 4) as usize);
        for face in &faces {
            data.extend_from_slice(face.as_raw());
        }
        let surface = SurfaceRgba8 {
            width,
            height,
            depth: 1,
            layers: faces.len() as u32,
            mipmaps: 1,
            data,
        };

        let encoded = surface
            .encode(format.to_image_format(), quality.to_quality(), Mipmaps::GeneratedAutomatic)
            .context("Failed to encode texture")?;
        let dds = encoded.to_dds().context("Failed to create DDS")?;
        let mut output = Vec::new();
        dds.write(&mut output).context("Failed to write DDS")?;

        let target = descriptor.converted_path(family);
        paths::ensure_parent_dirs(&target)?;
        std::fs::write(&target, &output).with_context(|| format!("Failed to write: {:?}", target))?;

        info!("Converted {} -> {} ({} bytes)", descriptor.path.display(), target.display(), output.len());
        Ok(target)
    }

    fn load_converted(&self, descriptor: &TextureDescriptor, family: GpuFamily) -> Result<Vec<RgbaImage>> {
        let path = descriptor.converted_path(family);
        let dds = read_dds(&path)?;
        decode_dds_layers(&dds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use tempfile::tempdir;

    #[test]
    fn test_compression_format_from_name() {
        assert_eq!(CompressionFormat::from_name("BC7"), Some(CompressionFormat::BC7));
        assert_eq!(CompressionFormat::from_name("bc7_unorm"), Some(CompressionFormat::BC7));
        assert_eq!(CompressionFormat::from_name("DXT5"), Some(CompressionFormat::BC3));
        assert_eq!(CompressionFormat::from_name("DXT1"), Some(CompressionFormat::BC1));
        assert_eq!(CompressionFormat::from_name("RGBA"), Some(CompressionFormat::Rgba));
        assert_eq!(CompressionFormat::from_name("pvrtc"), None);
    }

    #[test]
    fn test_compression_format_serde() {
        let parsed: CompressionFormat = serde_json::from_str("\"dxt1\"").unwrap();
        assert_eq!(parsed, CompressionFormat::BC1);
        assert_eq!(serde_json::to_string(&CompressionFormat::BC5).unwrap(), "\"BC5\"");
        assert!(serde_json::from_str::<CompressionFormat>("\"etc2\"").is_err());
    }

    #[test]
    fn test_estimate_texture_size() {
        assert_eq!(estimate_texture_size(64, 64, 1, None), 64 * 64 * 4 * 4 / 3);
        assert_eq!(estimate_texture_size(64, 64, 1, Some(CompressionFormat::BC1)), 64 * 64 / 2 * 4 / 3);
        assert_eq!(
            estimate_texture_size(64, 64, 6, Some(CompressionFormat::BC7)),
            6 * estimate_texture_size(64, 64, 1, Some(CompressionFormat::BC7))
        );
    }

    #[test]
    fn test_decode_png() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("red.png");
        RgbaImage::from_pixel(8, 4, Rgba([255, 0, 0, 255])).save(&path)?;

        let decoded = DdsCodec::new().decode(&path)?;
        assert_eq!(decoded.dimensions(), (8, 4));
        assert_eq!(decoded.get_pixel(3, 2), &Rgba([255, 0, 0, 255]));
        Ok(())
    }

    #[test]
    fn test_convert_and_reload_uncompressed() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("green.png");
        RgbaImage::from_pixel(16, 16, Rgba([0, 255, 0, 255])).save(&source)?;

        let descriptor = TextureDescriptor::new(dir.path().join("green.tex"), &source)
            .with_format(GpuFamily::Dx11, CompressionFormat::Rgba);

        let codec = DdsCodec::new();
        let written = codec.convert_for_family(&descriptor, GpuFamily::Dx11, CompressionQuality::Fast)?;
        assert_eq!(written, dir.path().join("green.dx11.dds"));
        assert!(written.exists());

        let faces = codec.load_converted(&descriptor, GpuFamily::Dx11)?;
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].dimensions(), (16, 16));
        assert_eq!(faces[0].get_pixel(5, 5), &Rgba([0, 255, 0, 255]));
        Ok(())
    }

    #[test]
    fn test_convert_without_format_fails() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("a.png");
        RgbaImage::new(4, 4).save(&source)?;
        let descriptor = TextureDescriptor::new(dir.path().join("a.tex"), &source);

        let result = DdsCodec::new().convert_for_family(&descriptor, GpuFamily::Mali, CompressionQuality::Fast);
        assert!(result.is_err());
        assert!(!descriptor.converted_path(GpuFamily::Mali).exists());
        Ok(())
    }
}
