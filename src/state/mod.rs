/// State management module
///
/// This module handles all in-memory application state:
/// - Shared data structures (data.rs)
/// - Pending files awaiting commit (pending.rs)
/// - Matching previews to committed records (reconcile.rs)
/// - Watch-folder review history (monitor.rs)
/// - The session that owns all of the above (session.rs)

pub mod data;
pub mod monitor;
pub mod pending;
pub mod reconcile;
pub mod session;

// Flat paths for the types the binary uses
pub use data::{
    FileBlob, FileSource, FileUpload, MonitorFile, MonitorStatus, Order, OrderDraft, OrderFileRecord, OrderPatch,
    OrderStatus, PendingFile, PendingId, Quantities, WatchEntry,
};
pub use monitor::{MonitorFilter, MonitorHistory};
pub use pending::PendingSet;
pub use reconcile::{MatchOutcome, Reconciliation};
pub use session::{Session, SessionEvent};
