//! Path handling for texture descriptors and their artifacts
//!
//! Descriptors may be authored on Windows, so separators are normalized
//! before paths are used as cache keys. Converted artifacts are written next
//! to their descriptor as `<stem>.<family>.dds`.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::job::GpuFamily;

/// File extension of texture descriptor files
pub const DESCRIPTOR_EXTENSION: &str = "tex";

/// Normalize a path for use as a resource key (forward slashes, no trailing slash)
/// `Data\Textures\rock.tex` -> `Data/Textures/rock.tex`
pub fn normalize_key(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    match normalized.trim_end_matches('/') {
        "" => normalized,
        trimmed => trimmed.to_string(),
    }
}

/// Resolve a path written inside a descriptor against the descriptor's directory
/// Handles both forward and backslashes
pub fn resolve_relative(descriptor: &Path, relative: &str) -> PathBuf {
    let native = PathBuf::from(relative.replace('\\', "/"));
    if native.is_absolute() {
        return native;
    }
    match descriptor.parent() {
        Some(dir) => dir.join(native),
        None => native,
    }
}

/// Get file extension (lowercase)
pub fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

/// Check whether a path names a texture descriptor
pub fn is_descriptor_file(path: &Path) -> bool {
    extension(path).as_deref() == Some(DESCRIPTOR_EXTENSION)
}

/// Path of the compressed artifact for a descriptor and hardware family
/// `textures/rock.tex` + ios -> `textures/rock.ios.dds`
pub fn converted_artifact_path(descriptor: &Path, family: GpuFamily) -> PathBuf {
    let stem = descriptor
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    descriptor.with_file_name(format!("{}.{}.dds", stem, family.name()))
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Modification time of a file, if it exists
pub fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Size of a file in bytes, 0 if missing
pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("Data\\Textures\\rock.tex"), "Data/Textures/rock.tex");
        assert_eq!(normalize_key("textures/"), "textures");
        assert_eq!(normalize_key("/"), "/");
    }

    #[test]
    fn test_resolve_relative() {
        let descriptor = Path::new("/project/textures/rock.tex");
        assert_eq!(
            resolve_relative(descriptor, "rock.png"),
            PathBuf::from("/project/textures/rock.png")
        );
        assert_eq!(
            resolve_relative(descriptor, "sub\\rock_n.png"),
            PathBuf::from("/project/textures/sub/rock_n.png")
        );
        assert_eq!(
            resolve_relative(descriptor, "/abs/rock.png"),
            PathBuf::from("/abs/rock.png")
        );
    }

    #[test]
    fn test_converted_artifact_path() {
        let descriptor = Path::new("/project/textures/rock.tex");
        assert_eq!(
            converted_artifact_path(descriptor, GpuFamily::PowerVrIos),
            PathBuf::from("/project/textures/rock.ios.dds")
        );
        assert_eq!(
            converted_artifact_path(descriptor, GpuFamily::Dx11),
            PathBuf::from("/project/textures/rock.dx11.dds")
        );
    }

    #[test]
    fn test_is_descriptor_file() {
        assert!(is_descriptor_file(Path::new("a/b/rock.tex")));
        assert!(is_descriptor_file(Path::new("a/b/ROCK.TEX")));
        assert!(!is_descriptor_file(Path::new("a/b/rock.png")));
        assert!(!is_descriptor_file(Path::new("a/b/tex")));
    }
}
