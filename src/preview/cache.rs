/// In-memory cache of persisted order previews
///
/// Keys are `<orderDir>::<previewFile>`, so one order's entries share a
/// prefix and can be dropped together.
use std::collections::HashMap;
use tracing::debug;

use super::PreviewImage;
use crate::error::StorageError;
use crate::storage::OrderStore;

/// Appended to the stored name; previews are always PNG
const PREVIEW_SUFFIX: &str = ".preview.png";

/// File name a stored model's preview is written under
pub fn preview_file_name(stored_name: &str) -> String {
    format!("{}{}", stored_name, PREVIEW_SUFFIX)
}

/// Cache key for a preview of an order
pub fn preview_key(dir_name: &str, preview_file: &str) -> String {
    format!("{}::{}", dir_name, preview_file)
}

#[derive(Debug, Default)]
/// Decoded previews keyed by `preview_key`
pub struct PreviewCache {
    entries: HashMap<String, PreviewImage>,
}

impl PreviewCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dir_name: &str, preview_file: &str) -> Option<&PreviewImage> {
        self.entries.get(&preview_key(dir_name, preview_file))
    }

    pub fn contains(&self, dir_name: &str, preview_file: &str) -> bool {
        self.entries.contains_key(&preview_key(dir_name, preview_file))
    }

    /// Cache the preview of a stored file under its preview file name
    pub fn insert_for_stored(&mut self, dir_name: &str, stored_name: &str, image: PreviewImage) {
        let key = preview_key(dir_name, &preview_file_name(stored_name));
        self.entries.insert(key, image);
    }

    /// Forget the preview of one stored file
    pub fn remove_for_stored(&mut self, dir_name: &str, stored_name: &str) -> Option<PreviewImage> {
        self.entries
            .remove(&preview_key(dir_name, &preview_file_name(stored_name)))
    }

    /// Drop every preview of one order; returns how many were cached
    pub fn remove_order(&mut self, dir_name: &str) -> usize {
        // `dir::` so that `a` never matches `ab::...`
        let prefix = preview_key(dir_name, "");
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(&prefix));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the cached preview, loading it from the store on first use
    ///
    /// A preview the store does not have is not cached, so a later call
    /// tries again.
    pub async fn ensure<S: OrderStore>(
        &mut self,
        store: &S,
        dir_name: &str,
        preview_file: &str,
    ) -> Result<Option<&PreviewImage>, StorageError> {
        let key = preview_key(dir_name, preview_file);

        if !self.entries.contains_key(&key) {
            match store.read_preview(dir_name, preview_file).await? {
                Some(bytes) => {
                    debug!(key = %key, bytes = bytes.len(), "loaded preview");
                    self.entries.insert(key.clone(), PreviewImage::from_png(bytes));
                }
                None => return Ok(None),
            }
        }

        Ok(self.entries.get(&key))
    }
}
