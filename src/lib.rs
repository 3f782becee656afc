/// Print order manager
///
/// 3D-print job orders kept as folders with a JSON manifest, plus the
/// machinery that feeds them: model previews, a pending set of candidate
/// files, preview reconciliation after commit, and watch-folder ingestion.

pub mod config;
pub mod error;
pub mod model;
pub mod preview;
pub mod render;
pub mod shell;
pub mod state;
pub mod storage;
pub mod watch;

// Errors and the preview entry point at the crate root
pub use error::{ConfigError, PreviewError, StorageError};
pub use preview::{generate_preview, PreviewImage};
