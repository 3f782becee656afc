/// Preview generation module
///
/// Turns model file bytes into a small PNG:
/// - 3MF: embedded thumbnail first, mesh render as fallback
/// - STL / OBJ: decode then render
/// - Anything else: no preview
///
/// Failures never leave this module; callers get `None` and show a
/// placeholder instead.

pub mod cache;

pub use cache::{preview_file_name, preview_key, PreviewCache};

use image::{ImageFormat, RgbaImage};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::PreviewError;
use crate::model::{self, Decoded, ModelFormat};
use crate::render;

/// Encoded preview image (PNG bytes)
#[derive(Clone, PartialEq, Eq)]
pub struct PreviewImage(Vec<u8>);

impl PreviewImage {
    /// Wrap bytes that are already PNG encoded
    pub fn from_png(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Wrap arbitrary image bytes, re-encoding to PNG when needed
    pub fn from_image_bytes(bytes: &[u8]) -> Result<Self, PreviewError> {
        let format = image::guess_format(bytes)
            .map_err(|e| PreviewError::CorruptData(format!("image: {}", e)))?;
        let decoded = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| PreviewError::CorruptData(format!("image: {}", e)))?;

        // PNG is kept byte-for-byte, only checked to decode
        if format == ImageFormat::Png {
            return Ok(Self(bytes.to_vec()));
        }
        Self::encode(&decoded.to_rgba8())
    }

    /// Encode an RGBA buffer as PNG
    pub fn encode(image: &RgbaImage) -> Result<Self, PreviewError> {
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| PreviewError::RenderError(format!("PNG encode: {}", e)))?;
        Ok(Self(out.into_inner()))
    }

    /// Raw PNG bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PreviewImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PreviewImage({} bytes)", self.0.len())
    }
}

/// Whether the pipeline knows how to preview this file name
pub fn is_previewable(file_name: &str) -> bool {
    ModelFormat::from_file_name(file_name).is_some()
}

/// Raster images (png, jpg, webp, ...) by extension. These have no model
/// preview; path-sourced ones go to the shell thumbnailer instead.
pub fn is_raster_image(file_name: &str) -> bool {
    ImageFormat::from_extension(model::extension(file_name)).is_some()
}

/// Decode and render, keeping the failure kind
pub fn try_generate_preview(file_name: &str, bytes: &[u8]) -> Result<PreviewImage, PreviewError> {
    match model::decode(file_name, bytes)? {
        // Embedded thumbnails skip the renderer
        Decoded::Thumbnail(image) => Ok(image),
        Decoded::Scene(scene) => render::render(&scene),
    }
}

/// Best-effort preview: any failure yields `None`
pub fn generate_preview(file_name: &str, bytes: &[u8]) -> Option<PreviewImage> {
    if !is_previewable(file_name) {
        return None;
    }

    match try_generate_preview(file_name, bytes) {
        Ok(image) => {
            debug!(file = file_name, bytes = image.len(), "generated preview");
            Some(image)
        }
        Err(e) => {
            warn!(file = file_name, error = %e, "preview generation failed");
            None
        }
    }
}

/// Run `generate_preview` on the blocking pool
pub async fn generate_preview_async(file_name: String, bytes: Arc<[u8]>) -> Option<PreviewImage> {
    if !is_previewable(&file_name) {
        return None;
    }

    // Decoding and rendering are CPU-bound
    match tokio::task::spawn_blocking(move || generate_preview(&file_name, &bytes)).await {
        Ok(preview) => preview,
        Err(e) => {
            warn!(error = %e, "preview task panicked");
            None
        }
    }
}
