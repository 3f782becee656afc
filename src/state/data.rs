/// Shared data structures for the application state
///
/// These structs represent the data model that flows between
/// the order store, the pending set and the watch folder.
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::model;
use crate::preview::PreviewImage;

/// Identity of a pending file, used for de-duplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingId {
    /// Added from a filesystem path
    Path(String),
    /// Added from in-memory bytes (drag-drop, clipboard)
    File { name: String, size: u64, modified: i64 },
}

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingId::Path(path) => write!(f, "path:{}", path),
            PendingId::File { name, size, modified } => write!(f, "file:{}:{}:{}", name, size, modified),
        }
    }
}

/// Where the content of a file comes from
#[derive(Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Copied from disk when the order is committed
    Path(PathBuf),
    /// Held in memory, shared with the preview task
    Bytes(Arc<[u8]>),
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            FileSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

/// A file handed over as raw bytes (drop, paste)
#[derive(Debug, Clone)]
pub struct FileBlob {
    /// File name as the drop or paste reported it
    pub name: String,
    /// Contents, shared with preview tasks without copying
    pub bytes: Arc<[u8]>,
    /// Last modification time in milliseconds since the epoch
    pub modified: i64,
}

impl FileBlob {
    /// Blob named `name` with its contents and mtime
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>, modified: i64) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            modified,
        }
    }

    /// Byte length, part of the pending identity
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Identity used to drop repeated drops of the same file
    pub fn id(&self) -> PendingId {
        PendingId::File {
            name: self.name.clone(),
            size: self.size(),
            modified: self.modified,
        }
    }
}

/// A candidate file not yet committed to an order
#[derive(Debug, Clone)]
pub struct PendingFile {
    /// Key for de-duplication and preview hand-back
    pub id: PendingId,
    /// Display name (file name without directories)
    pub name: String,
    /// Path or bytes the content is copied from
    pub source: FileSource,
    /// Free-text note carried into the order record
    pub note: String,
    /// Requested print quantity, always >= 1
    pub print_qty: u32,
    /// Generated or pasted preview, attached once ready
    pub preview: Option<PreviewImage>,
}

impl PendingFile {
    /// Entry for a dropped or picked path
    pub fn from_path(path: &str) -> Self {
        Self {
            id: PendingId::Path(path.to_string()),
            name: file_name_of(path),
            source: FileSource::Path(PathBuf::from(path)),
            note: String::new(),
            print_qty: 1,
            preview: None,
        }
    }

    /// Entry for dropped or pasted bytes
    pub fn from_blob(blob: &FileBlob) -> Self {
        Self {
            id: blob.id(),
            name: blob.name.clone(),
            source: FileSource::Bytes(blob.bytes.clone()),
            note: String::new(),
            print_qty: 1,
            preview: None,
        }
    }

    /// Original filesystem path, absent for byte-sourced files
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Bytes(_) => None,
        }
    }

    /// Hand-off to the store: nothing printed yet
    pub fn to_upload(&self) -> FileUpload {
        FileUpload {
            name: self.name.clone(),
            source: self.source.clone(),
            note: self.note.clone(),
            quantities: Quantities::clamped(i64::from(self.print_qty), 0),
        }
    }
}

/// One file handed to the order store for persisting
#[derive(Debug, Clone)]
pub struct FileUpload {
    /// Original name; the stored name may differ after de-duplication
    pub name: String,
    pub source: FileSource,
    /// Per-file note for the record
    pub note: String,
    /// Clamped again by the store before writing
    pub quantities: Quantities,
}

impl FileUpload {
    /// Upload copied from `path`, default quantities
    pub fn from_path(path: &Path) -> Self {
        Self {
            name: file_name_of(&path.to_string_lossy()),
            source: FileSource::Path(path.to_path_buf()),
            note: String::new(),
            quantities: Quantities::default(),
        }
    }

    /// Upload written from the blob's bytes, default quantities
    pub fn from_blob(blob: &FileBlob) -> Self {
        Self {
            name: blob.name.clone(),
            source: FileSource::Bytes(blob.bytes.clone()),
            note: String::new(),
            quantities: Quantities::default(),
        }
    }
}

/// Requested and completed print counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantities {
    /// Copies to print, at least 1
    pub print: u32,
    /// Copies done so far, never above `print`
    pub printed: u32,
}

impl Default for Quantities {
    fn default() -> Self {
        Self { print: 1, printed: 0 }
    }
}

impl Quantities {
    /// Clamp raw input: print >= 1, 0 <= printed <= print
    pub fn clamped(print: i64, printed: i64) -> Self {
        let print = print.clamp(1, i64::from(u32::MAX)) as u32;
        let printed = printed.clamp(0, i64::from(print)) as u32;
        Self { print, printed }
    }
}

/// Parse free-form quantity input: floor, never negative, `fallback`
/// when the text is not a finite number
pub fn normalize_qty(raw: &str, fallback: i64) -> i64 {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => value.floor().max(0.0) as i64,
        _ => fallback,
    }
}

/// Order lifecycle status, stored with its display label
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderStatus {
    /// Freshly created or copied
    #[default]
    #[serde(rename = "新建")]
    New,
    /// On a printer
    #[serde(rename = "打印中")]
    Printing,
    /// Support removal, sanding, painting
    #[serde(rename = "后处理")]
    PostProcessing,
    /// Finished and handed over
    #[serde(rename = "已完成")]
    Done,
    #[serde(rename = "已取消")]
    Canceled,
}

impl OrderStatus {
    /// Every status, in lifecycle order
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::New,
        OrderStatus::Printing,
        OrderStatus::PostProcessing,
        OrderStatus::Done,
        OrderStatus::Canceled,
    ];

    /// Label stored in the manifest and shown to the user
    pub fn label(&self) -> &'static str {
        match self {
            OrderStatus::New => "新建",
            OrderStatus::Printing => "打印中",
            OrderStatus::PostProcessing => "后处理",
            OrderStatus::Done => "已完成",
            OrderStatus::Canceled => "已取消",
        }
    }

    /// ASCII name accepted on the command line
    pub fn key(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Printing => "printing",
            OrderStatus::PostProcessing => "post-processing",
            OrderStatus::Done => "done",
            OrderStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    /// Accepts either the stored label or the ASCII key
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let lower = raw.to_ascii_lowercase();
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.label() == raw || status.key() == lower)
            .ok_or_else(|| {
                let known: Vec<_> = OrderStatus::ALL.iter().map(|s| s.key()).collect();
                format!("unknown status '{}' (expected one of: {})", raw, known.join(", "))
            })
    }
}

/// A file record inside an order manifest (store-owned)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderFileRecord {
    /// Original file name, used for preview matching
    pub name: String,
    /// Collision-free name inside the order directory
    pub saved_as: String,
    /// Per-file note, e.g. color or infill
    #[serde(default)]
    pub note: String,
    /// `<saved_as>.preview.png` once a preview was written
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub preview_image: Option<String>,
    /// Missing in old manifests, read as 1
    #[serde(default = "default_print_qty")]
    pub print_qty: u32,
    #[serde(default)]
    pub printed_qty: u32,
    /// RFC 3339 time the file was stored
    #[serde(default)]
    pub added_at: String,
}

impl OrderFileRecord {
    /// Requested and printed counts as one value
    pub fn quantities(&self) -> Quantities {
        Quantities {
            print: self.print_qty,
            printed: self.printed_qty,
        }
    }
}

/// An order folder and its manifest
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Folder name under the base directory, also the order's key
    pub dir_name: String,
    /// Running order number, shown as `NNNN`
    pub order_no: u32,
    /// `YYMMDD` of the day the order was created
    pub date_prefix: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub material: String,
    /// Sets of the whole order, apart from per-file print counts
    #[serde(default = "default_print_qty")]
    pub quantity: u32,
    /// Free-form date as the user typed it
    #[serde(default)]
    pub due_date: String,
    #[serde(default)]
    pub status: OrderStatus,
    /// Order note from the creation form
    #[serde(default)]
    pub note: String,
    /// Note shown on the folder itself, apart from the order note
    #[serde(default)]
    pub folder_note: String,
    /// Courier and tracking number once shipped
    #[serde(default)]
    pub shipping_info: String,
    /// RFC 3339 creation time
    #[serde(default)]
    pub created_at: String,
    /// Stored files in the order they were added
    #[serde(default)]
    pub files: Vec<OrderFileRecord>,
}

impl Order {
    /// Record of a stored file, looked up by its stored name
    pub fn file(&self, stored_name: &str) -> Option<&OrderFileRecord> {
        self.files.iter().find(|f| f.saved_as == stored_name)
    }

    /// Mutable lookup by stored name
    pub fn file_mut(&mut self, stored_name: &str) -> Option<&mut OrderFileRecord> {
        self.files.iter_mut().find(|f| f.saved_as == stored_name)
    }
}

/// User input for a new order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDraft {
    /// Second segment of the folder name
    pub customer_name: String,
    /// First segment of the folder name
    pub title: String,
    pub material: String,
    /// Sets of the whole order, 1 by default
    pub quantity: u32,
    pub due_date: String,
    pub status: OrderStatus,
    pub note: String,
    pub folder_note: String,
    pub shipping_info: String,
}

impl Default for OrderDraft {
    fn default() -> Self {
        Self {
            customer_name: String::new(),
            title: String::new(),
            material: String::new(),
            quantity: 1,
            due_date: String::new(),
            status: OrderStatus::New,
            note: String::new(),
            folder_note: String::new(),
            shipping_info: String::new(),
        }
    }
}

/// Partial update of order-level fields; `None` leaves a field as it is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderPatch {
    pub customer_name: Option<String>,
    pub title: Option<String>,
    pub material: Option<String>,
    pub quantity: Option<u32>,
    pub due_date: Option<String>,
    pub status: Option<OrderStatus>,
    pub note: Option<String>,
    pub folder_note: Option<String>,
    pub shipping_info: Option<String>,
}

impl OrderPatch {
    /// Patch that only changes the status
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch that only changes the folder note
    pub fn folder_note(note: impl Into<String>) -> Self {
        Self {
            folder_note: Some(note.into()),
            ..Self::default()
        }
    }

    /// Nothing set, applying it changes nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Copy every set field onto `order`. The directory, number and file
    /// list are never touched.
    pub fn apply(&self, order: &mut Order) {
        fn set(target: &mut String, value: &Option<String>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }

        set(&mut order.customer_name, &self.customer_name);
        set(&mut order.title, &self.title);
        set(&mut order.material, &self.material);
        set(&mut order.due_date, &self.due_date);
        set(&mut order.note, &self.note);
        set(&mut order.folder_note, &self.folder_note);
        set(&mut order.shipping_info, &self.shipping_info);

        // Order quantity never drops below one
        if let Some(quantity) = self.quantity {
            order.quantity = quantity.max(1);
        }
        if let Some(status) = self.status {
            order.status = status;
        }
    }
}

/// Classification of a watched-folder file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    /// Arrived after watching started
    New,
    /// Already there when the folder was listed
    Existing,
    /// Sent to the pending set
    Added,
    /// Dismissed by the user
    Ignored,
}

impl MonitorStatus {
    /// Added and ignored files are never reclassified by a listing
    pub fn is_terminal(&self) -> bool {
        matches!(self, MonitorStatus::Added | MonitorStatus::Ignored)
    }

    /// Lowercase name for listings
    pub fn label(&self) -> &'static str {
        match self {
            MonitorStatus::New => "new",
            MonitorStatus::Existing => "existing",
            MonitorStatus::Added => "added",
            MonitorStatus::Ignored => "ignored",
        }
    }
}

/// One file as reported by the watch-folder lister
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    /// Full path inside the watched folder
    pub path: PathBuf,
    /// File name without the folder
    pub name: String,
    /// Length in bytes
    pub size: u64,
    /// mtime in milliseconds since the epoch
    pub modified_ms: i64,
}

/// A watched-folder file with its review status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorFile {
    pub path: PathBuf,
    pub name: String,
    /// Lowercase extension without the dot
    pub ext: String,
    pub size: u64,
    pub modified_ms: i64,
    /// Where the file stands in review
    pub status: MonitorStatus,
}

impl MonitorFile {
    /// Listing entry plus its review status
    pub fn from_entry(entry: &WatchEntry, status: MonitorStatus) -> Self {
        Self {
            path: entry.path.clone(),
            name: entry.name.clone(),
            ext: model::extension(&entry.name),
            size: entry.size,
            modified_ms: entry.modified_ms,
            status,
        }
    }
}

/// Last path component, accepting both separators
pub fn file_name_of(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or(path)
        .to_string()
}

/// Manifests written without quantities print each file once
fn default_print_qty() -> u32 {
    1
}

/// Older manifests store a missing preview as `""`
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_id_display() {
        assert_eq!(PendingId::Path("/tmp/a.stl".into()).to_string(), "path:/tmp/a.stl");
        let blob = FileBlob::new("a.stl", vec![0u8; 12], 1700);
        // Bytes are identified by name, size and mtime
        assert_eq!(blob.id().to_string(), "file:a.stl:12:1700");
    }

    #[test]
    fn test_quantities_clamp() {
        assert_eq!(Quantities::clamped(5, 10), Quantities { print: 5, printed: 5 });
        assert_eq!(Quantities::clamped(0, -3), Quantities { print: 1, printed: 0 });
        // Printed is clamped against the already clamped print
        assert_eq!(Quantities::clamped(-7, 2), Quantities { print: 1, printed: 1 });
    }

    #[test]
    fn test_normalize_qty() {
        // Fractions are floored
        assert_eq!(normalize_qty("3.9", 1), 3);
        assert_eq!(normalize_qty(" 4 ", 1), 4);
        // Negative floors to zero, garbage and infinity use the fallback
        assert_eq!(normalize_qty("-2", 1), 0);
        assert_eq!(normalize_qty("abc", 1), 1);
        assert_eq!(normalize_qty("inf", 7), 7);
    }

    #[test]
    fn test_file_name_of() {
        // Either separator
        assert_eq!(file_name_of("C:\\jobs\\part.stl"), "part.stl");
        assert_eq!(file_name_of("/home/me/plate.3mf"), "plate.3mf");
        // Trailing separators are skipped
        assert_eq!(file_name_of("dir/"), "dir");
        assert_eq!(file_name_of("bare.obj"), "bare.obj");
    }

    #[test]
    fn test_manifest_round_trip_uses_camel_case() {
        let json = r#"{
            "dirName": "250101_box_bob_0001",
            "orderNo": 1,
            "datePrefix": "250101",
            "customerName": "bob",
            "title": "box",
            "material": "PLA",
            "quantity": 2,
            "status": "打印中",
            "createdAt": "2025-01-01T00:00:00.000Z",
            "files": [
                {"name": "a.stl", "savedAs": "a (1).stl", "previewImage": "", "printQty": 3, "printedQty": 1, "addedAt": "x"}
            ]
        }"#;

        // Empty previewImage reads as no preview
        let order: Order = serde_json::from_str(json).unwrap();
        assert_eq!(order.status, OrderStatus::Printing);
        assert_eq!(order.files[0].saved_as, "a (1).stl");
        assert_eq!(order.files[0].preview_image, None);

        // Written back camelCase, without the empty preview
        let value = serde_json::to_value(&order).unwrap();
        assert_eq!(value["files"][0]["savedAs"], "a (1).stl");
        assert_eq!(value["status"], "打印中");
        assert!(value["files"][0].get("previewImage").is_none());
    }

    #[test]
    fn test_status_parses_label_or_key() {
        assert_eq!("打印中".parse::<OrderStatus>().unwrap(), OrderStatus::Printing);
        assert_eq!("Done".parse::<OrderStatus>().unwrap(), OrderStatus::Done);
        assert_eq!(" post-processing ".parse::<OrderStatus>().unwrap(), OrderStatus::PostProcessing);

        // The error lists the accepted keys
        let err = "shipped".parse::<OrderStatus>().unwrap_err();
        assert!(err.contains("canceled"));
    }

    #[test]
    fn test_order_patch_only_touches_set_fields() {
        let mut order: Order = serde_json::from_str(
            r#"{"dirName": "d", "orderNo": 4, "datePrefix": "250101", "customerName": "bob",
                "material": "PLA", "shippingInfo": "box 3", "files": [{"name": "a.stl", "savedAs": "a.stl"}]}"#,
        )
        .unwrap();

        let patch = OrderPatch {
            status: Some(OrderStatus::Done),
            shipping_info: Some(String::new()),
            quantity: Some(0),
            ..OrderPatch::default()
        };
        assert!(!patch.is_empty());
        // Quantity 0 is raised to 1, unset fields survive
        patch.apply(&mut order);

        assert_eq!(order.status, OrderStatus::Done);
        assert_eq!(order.shipping_info, "");
        assert_eq!(order.quantity, 1);
        assert_eq!(order.material, "PLA");
        assert_eq!(order.customer_name, "bob");
        assert_eq!(order.files.len(), 1);
        assert!(OrderPatch::default().is_empty());
    }

    #[test]
    fn test_missing_quantities_default() {
        // Older manifests omit both quantities
        let record: OrderFileRecord =
            serde_json::from_str(r#"{"name": "a.stl", "savedAs": "a.stl"}"#).unwrap();
        assert_eq!(record.quantities(), Quantities { print: 1, printed: 0 });
    }
}
