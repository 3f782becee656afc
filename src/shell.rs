/// Desktop shell collaborator
///
/// Native dialogs, raw file reads and OS-level thumbnails. The core only
/// talks to the `Shell` trait so tests can swap in a fake.
///
/// OS thumbnails come from the freedesktop thumbnail cache, the same one
/// file managers fill for STEP and other formats we cannot decode. Raster
/// images without a cached thumbnail are decoded and scaled directly.
use image::imageops::FilterType;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::preview::{self, PreviewImage};

/// Cache sub-folders from largest to smallest
const THUMBNAIL_FLAVORS: [(&str, u32); 4] = [("xx-large", 1024), ("x-large", 512), ("large", 256), ("normal", 128)];

#[allow(async_fn_in_trait)]
/// Desktop side of the session: picking, reading and thumbnailing files
pub trait Shell {
    /// Ask the user for files; empty when the dialog is cancelled
    async fn select_files(&self) -> Vec<PathBuf>;

    /// Whole file contents; `None` when unreadable
    async fn read_file_bytes(&self, path: &Path) -> Option<Vec<u8>>;

    /// Best-effort thumbnail for files the preview pipeline cannot decode
    async fn get_file_thumbnail(&self, path: &Path, size: u32) -> Option<PreviewImage>;
}

/// Shell backed by the local desktop
#[derive(Debug, Clone)]
pub struct DesktopShell {
    /// Root of the thumbnail cache (`$XDG_CACHE_HOME/thumbnails`)
    thumbnail_root: Option<PathBuf>,
}

impl Default for DesktopShell {
    fn default() -> Self {
        Self::new()
    }
}

impl DesktopShell {
    /// Shell using the current user's thumbnail cache
    pub fn new() -> Self {
        Self {
            thumbnail_root: dirs::cache_dir().map(|dir| dir.join("thumbnails")),
        }
    }

    /// Look thumbnails up under `root` instead of the user cache
    pub fn with_thumbnail_root(root: impl Into<PathBuf>) -> Self {
        Self {
            thumbnail_root: Some(root.into()),
        }
    }

    /// Cached OS thumbnail for `path`, if one exists and is not stale
    async fn cached_thumbnail(&self, path: &Path, size: u32) -> Option<Vec<u8>> {
        let root = self.thumbnail_root.as_ref()?;
        // Cache entries are keyed by the absolute, symlink-free path
        let absolute = tokio::fs::canonicalize(path).await.ok()?;
        let source_modified = modified(&absolute).await?;
        let file_name = thumbnail_file_name(&absolute);

        // Closest flavor that still covers the requested size first, then the
        // largest of the smaller ones
        let mut flavors = THUMBNAIL_FLAVORS.to_vec();
        flavors.sort_by_key(|(_, edge)| (*edge < size, edge.abs_diff(size)));

        for (flavor, _) in flavors {
            let candidate = root.join(flavor).join(&file_name);
            let Some(thumb_modified) = modified(&candidate).await else {
                continue;
            };
            // Written before the file last changed: it shows old content
            if thumb_modified < source_modified {
                debug!(thumbnail = %candidate.display(), "stale cached thumbnail");
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&candidate).await {
                debug!(path = %path.display(), thumbnail = %candidate.display(), "using cached thumbnail");
                return Some(bytes);
            }
        }
        None
    }
}

impl Shell for DesktopShell {
    async fn select_files(&self) -> Vec<PathBuf> {
        rfd::AsyncFileDialog::new()
            .set_title("Select files")
            .pick_files()
            .await
            .map(|handles| handles.into_iter().map(|h| h.path().to_path_buf()).collect())
            .unwrap_or_default()
    }

    async fn read_file_bytes(&self, path: &Path) -> Option<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "could not read file");
                None
            }
        }
    }

    async fn get_file_thumbnail(&self, path: &Path, size: u32) -> Option<PreviewImage> {
        // Prefer what the desktop already rendered, otherwise decode images ourselves
        let bytes = match self.cached_thumbnail(path, size).await {
            Some(bytes) => bytes,
            None if preview::is_raster_image(&path.to_string_lossy()) => self.read_file_bytes(path).await?,
            None => return None,
        };

        // Decode and resize off the async thread
        let path_display = path.display().to_string();
        let result = tokio::task::spawn_blocking(move || thumbnail_from_image_bytes(&bytes, size)).await;
        match result {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                warn!(path = %path_display, error = %e, "thumbnail task failed");
                None
            }
        }
    }
}

/// Decode any raster format the `image` crate knows and fit it into a square
pub fn thumbnail_from_image_bytes(bytes: &[u8], size: u32) -> Option<PreviewImage> {
    // Keeps the aspect ratio, longest edge becomes `size`
    let img = image::load_from_memory(bytes).ok()?;
    let thumbnail = img.resize(size, size, FilterType::Lanczos3);
    PreviewImage::encode(&thumbnail.to_rgba8()).ok()
}

/// Name of a file's entry in the thumbnail cache: md5 of its `file://` URI
pub fn thumbnail_file_name(absolute: &Path) -> String {
    // Lowercase hex, 32 chars
    let digest = Md5::digest(file_uri(absolute).as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();
    format!("{}.png", hex)
}

/// `file://` URI escaped the way GLib escapes paths
pub fn file_uri(absolute: &Path) -> String {
    // Escape per segment so the separators survive
    let path = absolute.to_string_lossy().replace('\\', "/");
    let escaped: Vec<String> = path
        .split('/')
        .map(|segment| unescape_path_safe(&urlencoding::encode(segment)))
        .collect();

    let joined = escaped.join("/");
    if joined.starts_with('/') {
        format!("file://{}", joined)
    } else {
        // Windows drive paths
        format!("file:///{}", joined)
    }
}

/// `urlencoding` escapes every reserved character, GLib keeps these in paths
fn unescape_path_safe(encoded: &str) -> String {
    const KEPT: [(&str, &str); 13] = [
        ("%21", "!"),
        ("%24", "$"),
        ("%26", "&"),
        ("%27", "'"),
        ("%28", "("),
        ("%29", ")"),
        ("%2A", "*"),
        ("%2B", "+"),
        ("%2C", ","),
        ("%3A", ":"),
        ("%3B", ";"),
        ("%3D", "="),
        ("%40", "@"),
    ];

    // Every '%' in the encoder's output starts an escape, so plain
    // replacement never splits one
    KEPT.iter()
        .fold(encoded.to_string(), |acc, &(escape, plain)| acc.replace(escape, plain))
}

/// mtime of `path`, if it exists
async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        PreviewImage::encode(&RgbaImage::from_pixel(width, height, Rgba([0, 128, 255, 255])))
            .unwrap()
            .into_bytes()
    }

    #[test]
    fn test_thumbnail_fits_requested_size() {
        let thumb = thumbnail_from_image_bytes(&png(64, 32), 16).unwrap();
        let decoded = image::load_from_memory(thumb.as_bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn test_thumbnail_of_non_image_is_none() {
        assert!(thumbnail_from_image_bytes(b"solid x", 16).is_none());
    }

    #[test]
    fn test_file_uri_escaping() {
        assert_eq!(
            file_uri(Path::new("/home/me/jobs/part (1) v2.step")),
            "file:///home/me/jobs/part%20(1)%20v2.step"
        );
        assert_eq!(file_uri(Path::new("/tmp/a#b%c.stl")), "file:///tmp/a%23b%25c.stl");
        assert_eq!(file_uri(Path::new("/tmp/零件.step")), "file:///tmp/%E9%9B%B6%E4%BB%B6.step");
    }

    #[test]
    fn test_thumbnail_file_name_is_md5_of_uri() {
        // md5("file:///home/jens/photos/me.png"), the freedesktop thumbnail spec example
        assert_eq!(
            thumbnail_file_name(Path::new("/home/jens/photos/me.png")),
            "c6ee772d9e49320e97ec29a7eb5b1697.png"
        );
    }

    #[tokio::test]
    async fn test_cached_thumbnail_for_cad_file() {
        let dir = tempfile::tempdir().unwrap();
        let step = dir.path().join("part.step");
        std::fs::write(&step, b"ISO-10303-21;").unwrap();

        let root = dir.path().join("thumbnails");
        let cache_name = thumbnail_file_name(&std::fs::canonicalize(&step).unwrap());
        std::fs::create_dir_all(root.join("large")).unwrap();
        std::fs::write(root.join("large").join(&cache_name), png(256, 128)).unwrap();

        let shell = DesktopShell::with_thumbnail_root(&root);
        let thumb = shell.get_file_thumbnail(&step, 64).await.unwrap();
        let decoded = image::load_from_memory(thumb.as_bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
    }

    #[tokio::test]
    async fn test_cad_file_without_cached_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let step = dir.path().join("part.step");
        std::fs::write(&step, b"ISO-10303-21;").unwrap();

        let shell = DesktopShell::with_thumbnail_root(dir.path().join("thumbnails"));
        assert_eq!(shell.read_file_bytes(&step).await.unwrap(), b"ISO-10303-21;");
        assert!(shell.get_file_thumbnail(&step, 64).await.is_none());
        assert!(shell.read_file_bytes(&dir.path().join("missing")).await.is_none());
    }

    #[tokio::test]
    async fn test_raster_image_is_scaled_directly() {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("photo.png");
        std::fs::write(&photo, png(40, 80)).unwrap();

        let shell = DesktopShell::with_thumbnail_root(dir.path().join("thumbnails"));
        let thumb = shell.get_file_thumbnail(&photo, 20).await.unwrap();
        let decoded = image::load_from_memory(thumb.as_bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 20));
    }
}
