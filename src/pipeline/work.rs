//! Work executed on lane worker threads
//!
//! Workers only see an immutable job plus shared handles to the descriptor
//! store and the codec. Every failure becomes a stub payload here, so the
//! owning thread never has to deal with worker errors.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::make_thumbnail;
use crate::descriptor::{DescriptorStore, TextureDescriptor};
use crate::job::{FreshnessPolicy, GpuFamily, Job, Variant};
use crate::paths;
use crate::textures::{estimate_texture_size, CompressionQuality, TextureCodec, TextureInfo};

/// Shared, read-only inputs of every worker
pub struct WorkContext {
    pub store: Arc<dyn DescriptorStore>,
    pub codec: Arc<dyn TextureCodec>,
    pub thumbnail_size: u32,
    pub quality: CompressionQuality,
}

/// What a worker hands back to the owning thread
#[derive(Debug, Clone, Default)]
pub struct WorkOutput {
    /// The requested variant (stub on failure)
    pub info: TextureInfo,
    /// Thumbnail derived alongside an original
    pub thumbnail: Option<TextureInfo>,
    /// Whether the encoder actually ran for a converted job
    pub reconverted: bool,
}

impl WorkOutput {
    fn stub(faces: usize) -> Self {
        Self {
            info: TextureInfo::stub(faces),
            ..Self::default()
        }
    }
}

pub fn execute(ctx: &WorkContext, job: &Job) -> WorkOutput {
    let Some(descriptor) = ctx.store.descriptor(&job.key) else {
        warn!("No descriptor for {}", job.key);
        return WorkOutput::stub(1);
    };

    match job.variant {
        Variant::Thumbnail => {
            let original = load_original(ctx, &descriptor);
            WorkOutput {
                info: make_thumbnail(&original, ctx.thumbnail_size),
                ..WorkOutput::default()
            }
        }
        Variant::Original => {
            let original = load_original(ctx, &descriptor);
            let thumbnail = make_thumbnail(&original, ctx.thumbnail_size);
            WorkOutput {
                info: original,
                thumbnail: Some(thumbnail),
                reconverted: false,
            }
        }
        Variant::Converted(family) => match convert(ctx, &descriptor, family, job.policy) {
            Ok((info, reconverted)) => WorkOutput {
                info,
                thumbnail: None,
                reconverted,
            },
            Err(e) => {
                warn!(
                    "Failed to convert {} for {}: {:#}",
                    descriptor.path.display(),
                    family,
                    e
                );
                WorkOutput::stub(descriptor.face_count())
            }
        },
    }
}

/// Decode every listed face of a texture; faces that fail stay empty
fn load_original(ctx: &WorkContext, descriptor: &TextureDescriptor) -> TextureInfo {
    let inputs = descriptor.input_paths();
    let faces: Vec<_> = inputs
        .iter()
        .map(|path| match ctx.codec.decode(path) {
            Ok(img) => Some(img),
            Err(e) => {
                warn!("Failed to load {}: {:#}", path.display(), e);
                None
            }
        })
        .collect();

    let mut info = TextureInfo::from_faces(faces);
    let (width, height) = info.dimensions;
    info.data_size = estimate_texture_size(width, height, info.face_count(), None);
    info.file_size = inputs.iter().map(|path| paths::file_size(path)).sum();
    info.source_modified = descriptor.source_modified();
    info
}

/// Whether an existing artifact satisfies `policy`
fn needs_conversion(descriptor: &TextureDescriptor, family: GpuFamily, policy: FreshnessPolicy) -> bool {
    match policy {
        FreshnessPolicy::Force => true,
        FreshnessPolicy::OnlyIfStale => !descriptor.is_converted_actual(family),
        FreshnessPolicy::OnlyIfMissing => !descriptor.converted_path(family).exists(),
        FreshnessPolicy::SkipIfAbsent => false,
    }
}

fn convert(
    ctx: &WorkContext,
    descriptor: &TextureDescriptor,
    family: GpuFamily,
    policy: FreshnessPolicy,
) -> Result<(TextureInfo, bool)> {
    let format = descriptor
        .format_for(family)
        .ok_or_else(|| anyhow!("no compression format set"))?;
    let quality = descriptor.quality_for(family).unwrap_or(ctx.quality);

    let reconverted = needs_conversion(descriptor, family, policy);
    if reconverted {
        ctx.codec.convert_for_family(descriptor, family, quality)?;
    } else {
        debug!("{} for {} is up to date", descriptor.path.display(), family);
    }

    let faces = ctx.codec.load_converted(descriptor, family)?;
    if faces.is_empty() {
        return Err(anyhow!("converted artifact has no faces"));
    }

    let face_count = faces.len();
    let artifact = descriptor.converted_path(family);
    let mut info = TextureInfo::from_faces(faces.into_iter().map(Some).collect());
    let (width, height) = info.dimensions;
    info.data_size = estimate_texture_size(width, height, face_count, Some(format));
    info.file_size = paths::file_size(&artifact);
    info.source_modified = descriptor.source_modified();
    Ok((info, reconverted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorCatalog;
    use crate::job::ResourceKey;
    use crate::textures::{CompressionFormat, CUBE_FACE_COUNT};
    use image::RgbaImage;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCodec {
        conversions: AtomicUsize,
    }

    impl TextureCodec for CountingCodec {
        fn decode(&self, path: &Path) -> Result<RgbaImage> {
            if path.to_string_lossy().contains("missing") {
                anyhow::bail!("no such image");
            }
            Ok(RgbaImage::new(32, 16))
        }

        fn convert_for_family(
            &self,
            descriptor: &TextureDescriptor,
            family: GpuFamily,
            _quality: CompressionQuality,
        ) -> Result<PathBuf> {
            self.conversions.fetch_add(1, Ordering::SeqCst);
            Ok(descriptor.converted_path(family))
        }

        fn load_converted(&self, descriptor: &TextureDescriptor, _family: GpuFamily) -> Result<Vec<RgbaImage>> {
            Ok(vec![RgbaImage::new(8, 8); descriptor.face_count()])
        }
    }

    fn context(catalog: DescriptorCatalog, codec: Arc<CountingCodec>) -> WorkContext {
        WorkContext {
            store: Arc::new(catalog),
            codec,
            thumbnail_size: 16,
            quality: CompressionQuality::Fast,
        }
    }

    #[test]
    fn test_original_comes_with_thumbnail() {
        let mut catalog = DescriptorCatalog::new();
        let key = catalog.insert(TextureDescriptor::new("/t/rock.tex", "/t/rock.png"));
        let ctx = context(catalog, Arc::new(CountingCodec::default()));

        let output = execute(&ctx, &Job::new(key, Variant::Original, FreshnessPolicy::OnlyIfMissing));
        assert!(!output.info.is_stub());
        assert_eq!(output.info.dimensions, (32, 16));
        assert_eq!(output.thumbnail.map(|t| t.dimensions), Some((16, 16)));
    }

    #[test]
    fn test_cube_map_with_missing_face_is_stub() {
        let faces: Vec<PathBuf> = (0..CUBE_FACE_COUNT)
            .map(|i| {
                if i == 3 {
                    PathBuf::from("/t/missing.png")
                } else {
                    PathBuf::from(format!("/t/face{}.png", i))
                }
            })
            .collect();
        let mut catalog = DescriptorCatalog::new();
        let key = catalog.insert(TextureDescriptor::new("/t/sky.tex", "").with_faces(faces));
        let ctx = context(catalog, Arc::new(CountingCodec::default()));

        let output = execute(&ctx, &Job::new(key, Variant::Thumbnail, FreshnessPolicy::OnlyIfMissing));
        assert!(output.info.is_stub());
        assert_eq!(output.info.face_count(), CUBE_FACE_COUNT);
    }

    #[test]
    fn test_cube_map_shows_listed_faces() {
        let faces: Vec<PathBuf> = ["px", "nx", "ny", "pz", "nz"]
            .iter()
            .map(|name| PathBuf::from(format!("/t/{}.png", name)))
            .collect();
        let mut catalog = DescriptorCatalog::new();
        let key = catalog.insert(TextureDescriptor::new("/t/sky.tex", "").with_faces(faces));
        let ctx = context(catalog, Arc::new(CountingCodec::default()));

        let output = execute(&ctx, &Job::new(key, Variant::Original, FreshnessPolicy::OnlyIfMissing));
        assert!(!output.info.is_stub());
        assert_eq!(output.info.face_count(), 5);
        let thumbnail = output.thumbnail.unwrap();
        assert!(!thumbnail.is_stub());
        assert_eq!(thumbnail.face_count(), 5);
    }

    #[test]
    fn test_unknown_key_and_missing_format_are_stubs() {
        let mut catalog = DescriptorCatalog::new();
        let key = catalog.insert(TextureDescriptor::new("/t/rock.tex", "/t/rock.png"));
        let codec = Arc::new(CountingCodec::default());
        let ctx = context(catalog, Arc::clone(&codec));

        let unknown = execute(
            &ctx,
            &Job::new(ResourceKey::new("/t/none.tex"), Variant::Original, FreshnessPolicy::Force),
        );
        assert!(unknown.info.is_stub());

        let no_format = execute(
            &ctx,
            &Job::new(key, Variant::Converted(GpuFamily::Mali), FreshnessPolicy::Force),
        );
        assert!(no_format.info.is_stub());
        assert_eq!(codec.conversions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_converted_policy_decides_reencode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let descriptor = TextureDescriptor::new(dir.path().join("rock.tex"), dir.path().join("rock.png"))
            .with_format(GpuFamily::Dx11, CompressionFormat::BC7);
        std::fs::write(&descriptor.source, b"png")?;
        std::fs::write(&descriptor.path, b"{}")?;

        let mut catalog = DescriptorCatalog::new();
        let key = catalog.insert(descriptor.clone());
        let codec = Arc::new(CountingCodec::default());
        let ctx = context(catalog, Arc::clone(&codec));
        let variant = Variant::Converted(GpuFamily::Dx11);

        // Artifact missing: converts
        let output = execute(&ctx, &Job::new(key.clone(), variant, FreshnessPolicy::OnlyIfMissing));
        assert!(output.reconverted);
        assert_eq!(output.info.dimensions, (8, 8));

        // Artifact present and newer than the inputs
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(descriptor.converted_path(GpuFamily::Dx11), b"dds")?;
        let output = execute(&ctx, &Job::new(key.clone(), variant, FreshnessPolicy::OnlyIfStale));
        assert!(!output.reconverted);
        let output = execute(&ctx, &Job::new(key.clone(), variant, FreshnessPolicy::OnlyIfMissing));
        assert!(!output.reconverted);
        assert_eq!(output.info.file_size, 3);

        let output = execute(&ctx, &Job::new(key, variant, FreshnessPolicy::Force));
        assert!(output.reconverted);
        assert_eq!(codec.conversions.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
