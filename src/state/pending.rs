/// Pending set: files picked, dropped or imported but not yet committed
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

use super::data::{FileBlob, FileUpload, PendingFile, PendingId};
use crate::model;
use crate::preview::{self, PreviewImage};
use crate::render::PREVIEW_SIZE;
use crate::shell::Shell;

#[derive(Debug, Default)]
/// Ordered candidate files, unique by identity
pub struct PendingSet {
    /// Insertion order is the order files are committed in
    entries: Vec<PendingFile>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &PendingFile> {
        self.entries.iter()
    }

    /// Entry with this identity, if still pending
    pub fn get(&self, id: &PendingId) -> Option<&PendingFile> {
        self.entries.iter().find(|f| &f.id == id)
    }

    fn get_mut(&mut self, id: &PendingId) -> Option<&mut PendingFile> {
        self.entries.iter_mut().find(|f| &f.id == id)
    }

    /// True while the entry has not been removed or committed
    pub fn contains(&self, id: &PendingId) -> bool {
        self.get(id).is_some()
    }

    /// Add path-sourced files, skipping paths already pending
    ///
    /// Previews are not generated here; see `preview_jobs`.
    pub fn add_by_paths<I, P>(&mut self, paths: I) -> Vec<PendingId>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let mut added = Vec::new();
        for path in paths {
            // Identity is the path text itself
            let file = PendingFile::from_path(path.as_ref());
            if self.contains(&file.id) {
                continue;
            }
            added.push(file.id.clone());
            self.entries.push(file);
        }
        debug!(added = added.len(), total = self.entries.len(), "pending files added by path");
        added
    }

    /// Add byte-sourced files, generating previews before they become visible
    pub async fn add_by_raw_files(&mut self, blobs: Vec<FileBlob>) -> Vec<PendingId> {
        // Drop duplicates within the batch and against what is already pending
        let mut seen: HashSet<PendingId> = self.entries.iter().map(|f| f.id.clone()).collect();
        let fresh: Vec<FileBlob> = blobs.into_iter().filter(|b| seen.insert(b.id())).collect();

        // Previews first, so the entries appear complete
        let prepared = prepare_raw_files(fresh).await;
        self.insert_prepared(prepared)
    }

    /// Append prepared entries, dropping any identity already present
    pub fn insert_prepared(&mut self, files: Vec<PendingFile>) -> Vec<PendingId> {
        let mut added = Vec::new();
        for file in files {
            if self.contains(&file.id) {
                continue;
            }
            added.push(file.id.clone());
            self.entries.push(file);
        }
        added
    }

    /// Remove one entry, keeping the order of the rest
    pub fn remove(&mut self, id: &PendingId) -> Option<PendingFile> {
        // Vec::remove shifts the tail down
        let index = self.entries.iter().position(|f| &f.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Attach a preview; false when the entry is gone
    pub fn set_preview(&mut self, id: &PendingId, image: PreviewImage) -> bool {
        match self.get_mut(id) {
            Some(file) => {
                file.preview = Some(image);
                true
            }
            None => false,
        }
    }

    /// Per-file note; false when the entry is gone
    pub fn set_note(&mut self, id: &PendingId, note: &str) -> bool {
        match self.get_mut(id) {
            Some(file) => {
                file.note = note.to_string();
                true
            }
            None => false,
        }
    }

    /// Set the requested print quantity, clamped to at least 1
    pub fn set_quantity(&mut self, id: &PendingId, quantity: i64) -> bool {
        match self.get_mut(id) {
            Some(file) => {
                // Zero and negatives become 1
                file.print_qty = quantity.clamp(1, i64::from(u32::MAX)) as u32;
                true
            }
            None => false,
        }
    }

    /// Uploads for every pending entry, in order
    pub fn uploads(&self) -> Vec<FileUpload> {
        self.entries.iter().map(PendingFile::to_upload).collect()
    }

    /// Empty the set, returning the entries in order
    pub fn take_all(&mut self) -> Vec<PendingFile> {
        // Leaves an empty set behind
        std::mem::take(&mut self.entries)
    }

    /// Preview work for path-sourced entries
    ///
    /// Jobs hold no borrow on the set: run them, then hand the result back
    /// through `set_preview`, which ignores entries removed in the meantime.
    pub fn preview_jobs<I, P>(&self, paths: I) -> Vec<PreviewJob>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        paths
            .into_iter()
            .filter_map(|path| {
                let path = path.as_ref();
                // Files the pipeline cannot decode go to the OS thumbnailer
                let kind = if model::is_opaque_cad(path) || preview::is_raster_image(path) {
                    PreviewKind::ShellThumbnail
                } else if preview::is_previewable(path) {
                    PreviewKind::Pipeline
                } else {
                    return None;
                };

                // Only paths that are still pending get a job
                let id = PendingId::Path(path.to_string());
                self.contains(&id).then(|| PreviewJob {
                    id,
                    path: PathBuf::from(path),
                    kind,
                })
            })
            .collect()
    }
}

/// Generate previews for previewable blobs and wrap them as pending entries
pub async fn prepare_raw_files(blobs: Vec<FileBlob>) -> Vec<PendingFile> {
    let mut prepared = Vec::with_capacity(blobs.len());
    for blob in blobs {
        let mut file = PendingFile::from_blob(&blob);
        // Unpreviewable blobs are added without a preview
        if preview::is_previewable(&blob.name) {
            file.preview = preview::generate_preview_async(blob.name.clone(), blob.bytes.clone()).await;
        }
        prepared.push(file);
    }
    prepared
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a pending path gets its preview
pub enum PreviewKind {
    /// Ask the shell for an OS-level thumbnail (opaque CAD formats, images)
    ShellThumbnail,
    /// Read the file and run the preview pipeline
    Pipeline,
}

/// A deferred preview for one pending path
#[derive(Debug, Clone)]
pub struct PreviewJob {
    /// Pending entry the result belongs to
    pub id: PendingId,
    pub path: PathBuf,
    /// Which pipeline renders it
    pub kind: PreviewKind,
}

impl PreviewJob {
    /// Produce the preview; `None` on any failure
    pub async fn run<H: Shell>(&self, shell: &H) -> Option<PreviewImage> {
        match self.kind {
            PreviewKind::ShellThumbnail => shell.get_file_thumbnail(&self.path, PREVIEW_SIZE).await,
            PreviewKind::Pipeline => {
                // Unreadable file: no preview
                let bytes = shell.read_file_bytes(&self.path).await?;
                let name = self.path.to_string_lossy().into_owned();
                preview::generate_preview_async(name, bytes.into()).await
            }
        }
    }
}
