/// Filesystem order store
///
/// Layout under the base directory:
///
/// ```text
/// <base>/<YYMMDD>_<title>_<customer>_<NNNN>/order.json
/// <base>/<dir>/<stored name>
/// <base>/<dir>/<stored name>.preview.png
/// ```
///
/// The manifest is re-read on every call, so each write observes the
/// previous one.
use chrono::{Local, SecondsFormat, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{OrderStore, StorageError};
use crate::config::Settings;
use crate::preview::{preview_file_name, PreviewImage};
use crate::state::data::{
    file_name_of, FileSource, FileUpload, Order, OrderDraft, OrderFileRecord, OrderPatch, OrderStatus, Quantities,
};

/// Manifest file inside every order folder
const MANIFEST: &str = "order.json";
/// Folder segment used when a title or customer name is blank
const UNNAMED: &str = "未命名";

#[derive(Debug, Clone)]
/// Order store over plain folders, configured by the settings file
pub struct FsOrderStore {
    settings_path: PathBuf,
    base_dir_override: Option<PathBuf>,
}

impl FsOrderStore {
    /// Store whose settings (base directory, order counter) live at `settings_path`
    pub fn new(settings_path: impl Into<PathBuf>) -> Self {
        Self {
            settings_path: settings_path.into(),
            base_dir_override: None,
        }
    }

    /// Use `dir` instead of the base directory from the settings file
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir_override = Some(dir.into());
        self
    }

    /// Current settings, re-read from disk
    pub async fn settings(&self) -> Result<Settings, StorageError> {
        Ok(Settings::load_from(&self.settings_path).await?)
    }

    /// Persist a new base directory and make sure it exists
    pub async fn set_base_dir(&self, dir: &Path) -> Result<Settings, StorageError> {
        let mut settings = self.settings().await?;
        settings.base_dir = Some(dir.to_path_buf());
        settings.save_to(&self.settings_path).await?;
        tokio::fs::create_dir_all(dir).await?;
        info!(base_dir = %dir.display(), "base directory set");
        Ok(settings)
    }

    /// Remember the folder the watch command follows
    pub async fn set_watch_folder(&self, dir: &Path) -> Result<Settings, StorageError> {
        let mut settings = self.settings().await?;
        settings.watch_folder = Some(dir.to_path_buf());
        settings.save_to(&self.settings_path).await?;
        Ok(settings)
    }

    /// Directory holding the order folders; the override wins over the settings
    pub async fn base_dir(&self) -> Result<PathBuf, StorageError> {
        if let Some(dir) = &self.base_dir_override {
            return Ok(dir.clone());
        }
        self.settings().await?.base_dir.ok_or(StorageError::BaseDirNotSet)
    }

    /// Reserve the next order number and a free folder name for it.
    /// The number is only persisted by `commit_order_number`.
    async fn next_order_dir(
        &self,
        base_dir: &Path,
        title: &str,
        customer: &str,
    ) -> Result<(Settings, u32, String, String), StorageError> {
        let settings = self.settings().await?;
        // Numbers keep counting across days, only the date prefix changes
        let order_no = settings.last_order_number + 1;
        let date_prefix = Local::now().format("%y%m%d").to_string();
        let folder_base = format!(
            "{}_{}_{}_{:04}",
            date_prefix,
            sanitize_segment(title),
            sanitize_segment(customer),
            order_no
        );

        // Same number twice on one day (e.g. after a settings reset) gets _1, _2, ...
        let mut dir_name = folder_base.clone();
        let mut suffix = 1;
        while tokio::fs::try_exists(base_dir.join(&dir_name)).await? {
            dir_name = format!("{}_{}", folder_base, suffix);
            suffix += 1;
        }

        Ok((settings, order_no, date_prefix, dir_name))
    }

    /// Record `order_no` as the last one handed out
    async fn commit_order_number(&self, mut settings: Settings, order_no: u32) -> Result<(), StorageError> {
        settings.last_order_number = order_no;
        settings.save_to(&self.settings_path).await?;
        Ok(())
    }

    /// Folder path and parsed manifest of one order
    async fn read_order(&self, dir_name: &str) -> Result<(PathBuf, Order), StorageError> {
        let order_dir = self.base_dir().await?.join(dir_name);
        let raw = match tokio::fs::read_to_string(order_dir.join(MANIFEST)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::OrderNotFound(dir_name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok((order_dir, serde_json::from_str(&raw)?))
    }

    /// Overwrite the manifest with `order`
    async fn write_order(&self, order_dir: &Path, order: &Order) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(order)?;
        tokio::fs::write(order_dir.join(MANIFEST), json).await?;
        Ok(())
    }

    /// Apply `edit` to one file record and save; unknown names leave the
    /// order untouched
    async fn edit_file<F>(&self, dir_name: &str, stored_name: &str, edit: F) -> Result<Order, StorageError>
    where
        F: FnOnce(&mut OrderFileRecord),
    {
        let (order_dir, mut order) = self.read_order(dir_name).await?;
        match order.file_mut(stored_name) {
            Some(record) => edit(record),
            None => return Ok(order),
        }
        self.write_order(&order_dir, &order).await?;
        Ok(order)
    }
}

impl OrderStore for FsOrderStore {
    async fn create_order(&self, draft: &OrderDraft) -> Result<Order, StorageError> {
        let base_dir = self.base_dir().await?;
        let (settings, order_no, date_prefix, dir_name) =
            self.next_order_dir(&base_dir, &draft.title, &draft.customer_name).await?;

        let order_dir = base_dir.join(&dir_name);
        // Folder first, so a failed create never burns an order number
        tokio::fs::create_dir_all(&order_dir).await?;

        // Manifest starts with no files
        let order = Order {
            dir_name,
            order_no,
            date_prefix,
            customer_name: draft.customer_name.clone(),
            title: draft.title.clone(),
            material: draft.material.clone(),
            quantity: draft.quantity,
            due_date: draft.due_date.clone(),
            status: draft.status,
            note: draft.note.clone(),
            folder_note: draft.folder_note.clone(),
            shipping_info: draft.shipping_info.clone(),
            created_at: timestamp(),
            files: Vec::new(),
        };
        self.write_order(&order_dir, &order).await?;
        self.commit_order_number(settings, order_no).await?;

        info!(dir = %order.dir_name, order_no, "order created");
        Ok(order)
    }

    async fn update_order(&self, dir_name: &str, patch: &OrderPatch) -> Result<Order, StorageError> {
        let (order_dir, mut order) = self.read_order(dir_name).await?;
        if patch.is_empty() {
            return Ok(order);
        }

        // Only the fields the patch carries change
        patch.apply(&mut order);
        self.write_order(&order_dir, &order).await?;
        debug!(dir = dir_name, status = %order.status, "order updated");
        Ok(order)
    }

    async fn copy_order(&self, dir_name: &str) -> Result<Order, StorageError> {
        let base_dir = self.base_dir().await?;
        let (source_dir, source) = self.read_order(dir_name).await?;
        let (settings, order_no, date_prefix, next_dir) =
            self.next_order_dir(&base_dir, &source.title, &source.customer_name).await?;

        // Files and previews come along, then the manifest is rewritten
        let target_dir = base_dir.join(&next_dir);
        copy_dir(source_dir, target_dir.clone()).await?;

        // Same content, fresh bookkeeping: new number, status reset, nothing printed yet
        let copied = Order {
            dir_name: next_dir,
            order_no,
            date_prefix,
            status: OrderStatus::New,
            shipping_info: String::new(),
            created_at: timestamp(),
            files: source
                .files
                .iter()
                .map(|file| OrderFileRecord {
                    printed_qty: 0,
                    ..file.clone()
                })
                .collect(),
            ..source
        };
        self.write_order(&target_dir, &copied).await?;
        self.commit_order_number(settings, order_no).await?;

        info!(from = dir_name, to = %copied.dir_name, order_no, "order copied");
        Ok(copied)
    }

    async fn delete_order(&self, dir_name: &str) -> Result<bool, StorageError> {
        if !is_plain_file_name(dir_name) {
            return Err(StorageError::InvalidFileName(dir_name.to_string()));
        }

        let order_dir = self.base_dir().await?.join(dir_name);
        // Already gone counts as not deleted, not as an error
        match tokio::fs::remove_dir_all(&order_dir).await {
            Ok(()) => {
                info!(dir = dir_name, "order deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_orders(&self) -> Result<Vec<Order>, StorageError> {
        let base_dir = self.base_dir().await?;
        // No base folder yet means no orders
        let mut entries = match tokio::fs::read_dir(&base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // Folders without a readable manifest are not orders
        let mut orders = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let manifest = entry.path().join(MANIFEST);
            let Ok(raw) = tokio::fs::read_to_string(&manifest).await else {
                continue;
            };
            match serde_json::from_str::<Order>(&raw) {
                Ok(order) => orders.push(order),
                Err(e) => warn!(path = %manifest.display(), error = %e, "skipping invalid order manifest"),
            }
        }

        // Date prefix first, so name order is creation order
        orders.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
        Ok(orders)
    }

    async fn persist_files(&self, dir_name: &str, uploads: &[FileUpload]) -> Result<Order, StorageError> {
        let (order_dir, mut order) = self.read_order(dir_name).await?;

        // Check every name before the first write so a bad one stores nothing
        let mut names = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let original_name = match &upload.source {
                FileSource::Path(path) => file_name_of(&path.to_string_lossy()),
                FileSource::Bytes(_) => file_name_of(&upload.name),
            };
            if !is_plain_file_name(&original_name) {
                return Err(StorageError::InvalidFileName(original_name));
            }
            names.push(original_name);
        }

        // Copy until the first failure
        let before = order.files.len();
        let stored = store_uploads(&order_dir, &mut order.files, uploads, names).await;

        // Files copied before a failure still get their records
        if stored.is_err() && order.files.len() == before {
            return stored.map(|_| order);
        }
        self.write_order(&order_dir, &order).await?;
        // Then report the failure itself
        stored?;

        info!(dir = dir_name, added = uploads.len(), total = order.files.len(), "files persisted");
        Ok(order)
    }

    async fn persist_preview_image(
        &self,
        dir_name: &str,
        stored_name: &str,
        image: &PreviewImage,
    ) -> Result<Order, StorageError> {
        let (order_dir, mut order) = self.read_order(dir_name).await?;
        let Some(record) = order.file_mut(stored_name) else {
            return Ok(order);
        };

        // Only PNG or JPEG bytes are accepted as previews
        match image::guess_format(image.as_bytes()) {
            Ok(image::ImageFormat::Png | image::ImageFormat::Jpeg) => {}
            _ => return Err(StorageError::InvalidImage),
        }

        // Preview sits next to the file as `<stored name>.preview.png`
        let file_name = preview_file_name(stored_name);
        tokio::fs::write(order_dir.join(&file_name), image.as_bytes()).await?;
        record.preview_image = Some(file_name);

        self.write_order(&order_dir, &order).await?;
        debug!(dir = dir_name, stored = stored_name, "preview saved");
        Ok(order)
    }

    async fn update_file_quantities(
        &self,
        dir_name: &str,
        stored_name: &str,
        quantities: Quantities,
    ) -> Result<Order, StorageError> {
        // print >= 1 and 0 <= printed <= print
        let quantities = Quantities::clamped(i64::from(quantities.print), i64::from(quantities.printed));
        self.edit_file(dir_name, stored_name, |record| {
            record.print_qty = quantities.print;
            record.printed_qty = quantities.printed;
        })
        .await
    }

    async fn update_file_note(&self, dir_name: &str, stored_name: &str, note: &str) -> Result<Order, StorageError> {
        self.edit_file(dir_name, stored_name, |record| record.note = note.to_string())
            .await
    }

    async fn replace_file(&self, dir_name: &str, stored_name: &str, source: &Path) -> Result<Order, StorageError> {
        let (order_dir, mut order) = self.read_order(dir_name).await?;
        let Some(record) = order.file_mut(stored_name) else {
            return Ok(order);
        };

        // New content under the old stored name, so the record keeps its identity
        tokio::fs::copy(source, order_dir.join(stored_name)).await?;
        if let Some(preview) = record.preview_image.take() {
            remove_if_exists(&order_dir.join(preview)).await?;
        }
        // Displayed name follows the new file
        record.name = file_name_of(&source.to_string_lossy());

        self.write_order(&order_dir, &order).await?;
        info!(dir = dir_name, stored = stored_name, source = %source.display(), "file replaced");
        Ok(order)
    }

    async fn delete_file(&self, dir_name: &str, stored_name: &str) -> Result<Order, StorageError> {
        let (order_dir, mut order) = self.read_order(dir_name).await?;
        let Some(index) = order.files.iter().position(|f| f.saved_as == stored_name) else {
            return Ok(order);
        };

        // Record first, then the stored file and its preview
        let record = order.files.remove(index);
        remove_if_exists(&order_dir.join(&record.saved_as)).await?;
        if let Some(preview) = &record.preview_image {
            remove_if_exists(&order_dir.join(preview)).await?;
        }

        self.write_order(&order_dir, &order).await?;
        info!(dir = dir_name, stored = stored_name, "file deleted");
        Ok(order)
    }

    async fn delete_preview_image(&self, dir_name: &str, stored_name: &str) -> Result<Order, StorageError> {
        let (order_dir, mut order) = self.read_order(dir_name).await?;
        let Some(record) = order.file_mut(stored_name) else {
            return Ok(order);
        };

        if let Some(preview) = record.preview_image.take() {
            remove_if_exists(&order_dir.join(preview)).await?;
        }

        self.write_order(&order_dir, &order).await?;
        Ok(order)
    }

    async fn read_preview(&self, dir_name: &str, preview_file: &str) -> Result<Option<Vec<u8>>, StorageError> {
        // Nothing to look up
        if dir_name.is_empty() || preview_file.is_empty() {
            return Ok(None);
        }
        let path = self.base_dir().await?.join(dir_name).join(preview_file);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Folder-name segment: path-illegal characters dropped, whitespace runs
/// collapsed to `_`
pub fn sanitize_segment(value: &str) -> String {
    let mut cleaned = String::with_capacity(value.len());
    // Set while inside a whitespace run
    let mut in_space = false;

    for c in value.trim().chars() {
        if c.is_whitespace() {
            if !in_space {
                cleaned.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control() {
            continue;
        }
        cleaned.push(c);
    }

    // Nothing left after cleaning
    if cleaned.is_empty() {
        UNNAMED.to_string()
    } else {
        cleaned
    }
}

/// First free path among `name.ext`, `name (1).ext`, `name (2).ext`, ...
pub async fn unique_path(target: &Path) -> Result<PathBuf, StorageError> {
    if !tokio::fs::try_exists(target).await? {
        return Ok(target.to_path_buf());
    }

    // Taken: try `stem (n).ext` until one is free
    let parent = target.parent().unwrap_or_else(|| Path::new(""));
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let candidate = parent.join(format!("{} ({}){}", stem, counter, ext));
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        counter += 1;
    }
}

/// A single path component that stays inside its parent directory
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Copy or write each upload under a free name, appending a record per file
async fn store_uploads(
    order_dir: &Path,
    files: &mut Vec<OrderFileRecord>,
    uploads: &[FileUpload],
    names: Vec<String>,
) -> Result<(), StorageError> {
    for (upload, original_name) in uploads.iter().zip(names) {
        // Never overwrite an earlier file with the same name
        let target = unique_path(&order_dir.join(&original_name)).await?;

        match &upload.source {
            FileSource::Path(path) => {
                tokio::fs::copy(path, &target).await?;
            }
            FileSource::Bytes(bytes) => {
                tokio::fs::write(&target, bytes).await?;
            }
        }

        let saved_as = file_name_of(&target.to_string_lossy());
        debug!(name = %original_name, saved_as = %saved_as, "file stored");

        let quantities = Quantities::clamped(
            i64::from(upload.quantities.print),
            i64::from(upload.quantities.printed),
        );
        files.push(OrderFileRecord {
            name: original_name,
            saved_as,
            note: upload.note.clone(),
            preview_image: None,
            print_qty: quantities.print,
            printed_qty: quantities.printed,
            added_at: timestamp(),
        });
    }
    Ok(())
}

/// Recursive copy of an order folder; the target must not exist yet
async fn copy_dir(source: PathBuf, target: PathBuf) -> Result<(), StorageError> {
    tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
        for entry in WalkDir::new(&source).follow_links(false) {
            let entry = entry.map_err(std::io::Error::from)?;
            // Same relative layout under the target
            let relative = entry.path().strip_prefix(&source).unwrap_or(entry.path());
            let destination = target.join(relative);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&destination)?;
            } else if entry.file_type().is_file() {
                std::fs::copy(entry.path(), &destination)?;
            }
        }
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Delete a file; a missing one is fine
async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// UTC RFC 3339 with milliseconds, e.g. `2024-05-01T08:30:00.000Z`
fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
