/// Error types shared across the crate
///
/// Preview errors never leave the preview pipeline: they collapse to `None`
/// at its public boundary. Storage errors are hard failures and propagate to
/// the caller.
use thiserror::Error;

/// Failure while turning a model file into a preview image
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreviewError {
    /// Extension not handled by the decoder (no content sniffing is attempted)
    #[error("unsupported model format: {0}")]
    UnsupportedFormat(String),

    /// Recognized format that failed to parse
    #[error("corrupt model data: {0}")]
    CorruptData(String),

    /// Bounding box is empty, non-finite or has zero extent
    #[error("model has no renderable geometry")]
    EmptyGeometry,

    /// Rasterization or image encoding failed
    #[error("render failed: {0}")]
    RenderError(String),
}

/// Failure reading or writing the settings file
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading or writing the file, or creating its folder
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// No per-user config directory on this platform
    #[error("could not determine a configuration directory")]
    NoConfigDir,
}

/// Failure in the order storage collaborator
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `order.json` that does not parse
    #[error("invalid order manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("settings error: {0}")]
    Config(#[from] ConfigError),

    /// Neither the settings file nor `--base-dir` names one
    #[error("base directory not set")]
    BaseDirNotSet,

    /// No folder with a manifest under that name
    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// Bytes handed in as a preview are not PNG or JPEG
    #[error("preview image is not a decodable PNG or JPEG")]
    InvalidImage,

    /// Upload name that would not land inside the order directory
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),
}
