/// Extension-based dispatch into the format parsers
use tracing::debug;

use super::{obj, stl, threemf, ModelFormat, SceneObject};
use crate::error::PreviewError;
use crate::preview::PreviewImage;

/// Result of decoding a model file
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Geometry that still has to be rendered
    Scene(SceneObject),
    /// Ready-made thumbnail found inside a 3MF container
    Thumbnail(PreviewImage),
}

/// Decode `bytes` according to the extension of `file_name`
///
/// Unknown extensions fail with `UnsupportedFormat` without looking at the
/// content. For 3MF the embedded thumbnail wins over the mesh, which is only
/// parsed when no usable thumbnail exists.
pub fn decode(file_name: &str, bytes: &[u8]) -> Result<Decoded, PreviewError> {
    let format = ModelFormat::from_file_name(file_name)
        .ok_or_else(|| PreviewError::UnsupportedFormat(file_name.to_string()))?;

    // Dispatch on the extension only
    match format {
        ModelFormat::Stl => Ok(Decoded::Scene(SceneObject::from_mesh(stl::parse(bytes)?))),
        ModelFormat::Obj => Ok(Decoded::Scene(obj::parse(bytes)?)),
        ModelFormat::ThreeMf => {
            if let Some(thumbnail) = threemf::extract_thumbnail(bytes)? {
                debug!(file = file_name, "using embedded 3MF thumbnail");
                return Ok(Decoded::Thumbnail(thumbnail));
            }
            Ok(Decoded::Scene(threemf::parse(bytes)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_extension_is_unsupported() {
        // Valid STL content must not be sniffed when the name says otherwise
        let err = decode("part.step", b"solid x\nendsolid x\n").unwrap_err();
        assert!(matches!(err, PreviewError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_garbage_stl_is_corrupt() {
        let err = decode("part.stl", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, PreviewError::CorruptData(_)));
    }

    #[test]
    fn test_garbage_3mf_is_corrupt() {
        let err = decode("plate.3mf", b"not a zip archive").unwrap_err();
        assert!(matches!(err, PreviewError::CorruptData(_)));
    }
}
