/// Order persistence module
///
/// Orders live as folders with a JSON manifest; the core only talks to
/// the `OrderStore` trait:
/// - Filesystem implementation (fs.rs)
///
/// Every mutating call returns the fresh order snapshot as the store sees
/// it after the write.

pub mod fs;

// The only store on disk
pub use fs::FsOrderStore;

pub use crate::error::StorageError;
use crate::preview::PreviewImage;
use std::path::Path;

use crate::state::data::{FileUpload, Order, OrderDraft, OrderPatch, Quantities};

#[allow(async_fn_in_trait)]
/// Persistence for orders. Every write returns the full order as stored
/// afterwards; unknown stored names leave the order unchanged.
pub trait OrderStore {
    /// Create the folder and manifest, taking the next order number
    async fn create_order(&self, draft: &OrderDraft) -> Result<Order, StorageError>;

    /// Every order under the base directory, sorted by folder name
    async fn list_orders(&self) -> Result<Vec<Order>, StorageError>;

    /// Apply order-level field changes (status, shipping, notes, ...)
    async fn update_order(&self, dir_name: &str, patch: &OrderPatch) -> Result<Order, StorageError>;

    /// Duplicate an order folder under the next order number. The copy starts
    /// over: status `新建`, no shipping info, nothing printed yet.
    async fn copy_order(&self, dir_name: &str) -> Result<Order, StorageError>;

    /// Remove an order folder with everything in it; `false` if it was not there
    async fn delete_order(&self, dir_name: &str) -> Result<bool, StorageError>;

    /// Copy or write files into the order, appending records in upload order
    async fn persist_files(&self, dir_name: &str, uploads: &[FileUpload]) -> Result<Order, StorageError>;

    /// Write `<stored>.preview.png` and link it from the record
    async fn persist_preview_image(
        &self,
        dir_name: &str,
        stored_name: &str,
        image: &PreviewImage,
    ) -> Result<Order, StorageError>;

    /// Store clamped print and printed counts for one file
    async fn update_file_quantities(
        &self,
        dir_name: &str,
        stored_name: &str,
        quantities: Quantities,
    ) -> Result<Order, StorageError>;

    /// Set the note of one file
    async fn update_file_note(&self, dir_name: &str, stored_name: &str, note: &str) -> Result<Order, StorageError>;

    /// Overwrite a stored file with `source`, keeping its stored name and
    /// dropping its preview
    async fn replace_file(&self, dir_name: &str, stored_name: &str, source: &Path) -> Result<Order, StorageError>;

    /// Remove a stored file, its preview and its record
    async fn delete_file(&self, dir_name: &str, stored_name: &str) -> Result<Order, StorageError>;

    /// Remove only the preview of a file
    async fn delete_preview_image(&self, dir_name: &str, stored_name: &str) -> Result<Order, StorageError>;

    /// Raw preview bytes, `None` when the file does not exist
    async fn read_preview(&self, dir_name: &str, preview_file: &str) -> Result<Option<Vec<u8>>, StorageError>;
}
