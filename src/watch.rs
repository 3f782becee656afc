/// Watched-folder listing and arrival polling
///
/// Polling is caller-driven: nothing runs in the background. The watcher
/// remembers every path it has reported, and `poll_new_arrivals` returns
/// only paths it has not seen before.
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::state::data::WatchEntry;

#[allow(async_fn_in_trait)]
/// Source of watch-folder listings, swapped for a fake in tests
pub trait WatchSource {
    /// Start watching `folder`; files already present are not arrivals
    async fn watch(&mut self, folder: &Path) -> io::Result<()>;

    /// Folder being watched, if any
    fn folder(&self) -> Option<&Path>;

    /// Every file currently in the folder
    async fn list(&self) -> io::Result<Vec<WatchEntry>>;

    /// Files that appeared since the last `watch` or poll
    async fn poll_new_arrivals(&mut self) -> io::Result<Vec<WatchEntry>>;
}

#[derive(Debug, Default)]
/// Polls a local folder with `walkdir`
pub struct FolderWatcher {
    folder: Option<PathBuf>,
    /// Paths already reported, including those present at `watch` time
    seen: HashSet<PathBuf>,
}

impl FolderWatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatchSource for FolderWatcher {
    async fn watch(&mut self, folder: &Path) -> io::Result<()> {
        // Snapshot what is there now so it never shows up as new
        let entries = list_folder(folder.to_path_buf()).await?;
        self.seen = entries.into_iter().map(|e| e.path).collect();
        self.folder = Some(folder.to_path_buf());
        info!(folder = %folder.display(), existing = self.seen.len(), "watching folder");
        Ok(())
    }

    fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    async fn list(&self) -> io::Result<Vec<WatchEntry>> {
        match &self.folder {
            Some(folder) => list_folder(folder.clone()).await,
            None => Ok(Vec::new()),
        }
    }

    async fn poll_new_arrivals(&mut self) -> io::Result<Vec<WatchEntry>> {
        let current = self.list().await?;
        let arrivals: Vec<WatchEntry> = current
            .into_iter()
            // `insert` is false for paths reported before
            .filter(|entry| self.seen.insert(entry.path.clone()))
            .collect();
        debug!(arrivals = arrivals.len(), "polled watch folder");
        Ok(arrivals)
    }
}

/// Files directly inside `folder`, sorted by name
pub async fn list_folder(folder: PathBuf) -> io::Result<Vec<WatchEntry>> {
    tokio::task::spawn_blocking(move || list_folder_blocking(&folder))
        .await
        .map_err(io::Error::other)?
}

/// Blocking half of `list_folder`
fn list_folder_blocking(folder: &Path) -> io::Result<Vec<WatchEntry>> {
    if !folder.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("not a directory: {}", folder.display()),
        ));
    }

    let mut entries = Vec::new();
    // Top level only, no subfolders
    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        // Skip directories and symlinks
        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = entry.metadata().map_err(io::Error::from)?;
        // Milliseconds since the epoch, 0 when the platform has no mtime
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        entries.push(WatchEntry {
            path: entry.path().to_path_buf(),
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            modified_ms,
        });
    }

    Ok(entries)
}
