/// Watch-folder review history
use std::path::Path;

use super::data::{MonitorFile, MonitorStatus, WatchEntry};

/// Which monitor entries are offered for review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorFilter {
    /// Only files that arrived while watching
    #[default]
    New,
    /// Every file in the folder that has not been added or ignored
    All,
}

/// Files seen in the watched folder, keyed by path, in first-seen order
#[derive(Debug, Default)]
pub struct MonitorHistory {
    files: Vec<MonitorFile>,
}

impl MonitorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Forget every file, e.g. when a different folder is watched
    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitorFile> {
        self.files.iter()
    }

    /// Entry for `path`, if it was ever listed
    pub fn get(&self, path: &Path) -> Option<&MonitorFile> {
        self.files.iter().find(|f| f.path == path)
    }

    fn get_mut(&mut self, path: &Path) -> Option<&mut MonitorFile> {
        self.files.iter_mut().find(|f| f.path == path)
    }

    /// Insert or refresh one listing entry
    ///
    /// Metadata is always refreshed. Added and ignored files keep their
    /// status, and a `New` file is never downgraded to `Existing`.
    pub fn upsert(&mut self, entry: &WatchEntry, status: MonitorStatus) {
        let Some(existing) = self.get_mut(&entry.path) else {
            self.files.push(MonitorFile::from_entry(entry, status));
            return;
        };

        // Size and mtime may have changed since the last listing
        let refreshed = MonitorFile::from_entry(entry, existing.status);
        *existing = refreshed;

        if existing.status.is_terminal() {
            return;
        }
        // A later `Existing` listing must not hide a new arrival
        if status == MonitorStatus::New || existing.status != MonitorStatus::New {
            existing.status = status;
        }
    }

    /// Upsert a whole listing with one status
    pub fn append(&mut self, entries: &[WatchEntry], status: MonitorStatus) {
        for entry in entries {
            self.upsert(entry, status);
        }
    }

    /// Actionable files for the filter; added and ignored never qualify
    pub fn candidates(&self, filter: MonitorFilter) -> Vec<&MonitorFile> {
        self.files
            .iter()
            .filter(|f| !f.status.is_terminal())
            // `New` filter: arrivals only
            .filter(|f| filter == MonitorFilter::All || f.status == MonitorStatus::New)
            .collect()
    }

    /// Files to display: `All` includes terminal entries with their label
    pub fn visible(&self, filter: MonitorFilter) -> Vec<&MonitorFile> {
        match filter {
            MonitorFilter::All => self.files.iter().collect(),
            MonitorFilter::New => self.candidates(filter),
        }
    }

    /// Mark a file as added; false when unknown or already added
    pub fn mark_added(&mut self, path: &Path) -> bool {
        match self.get_mut(path) {
            Some(file) if file.status != MonitorStatus::Added => {
                file.status = MonitorStatus::Added;
                true
            }
            _ => false,
        }
    }

    /// Mark a file as ignored; added or ignored files are left alone
    pub fn mark_ignored(&mut self, path: &Path) -> bool {
        match self.get_mut(path) {
            Some(file) if !file.status.is_terminal() => {
                file.status = MonitorStatus::Ignored;
                true
            }
            _ => false,
        }
    }

    /// Offer added and ignored files again
    pub fn reset(&mut self) {
        for file in &mut self.files {
            if file.status.is_terminal() {
                file.status = MonitorStatus::New;
            }
        }
    }
}
