/// Application session: the one owner of mutable state
///
/// Every flow takes `&mut self`, so state is only touched between awaits of
/// a single flow. Changes are announced on an unbounded channel; a closed
/// receiver is not an error.
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use super::data::{
    FileBlob, FileUpload, MonitorStatus, Order, OrderDraft, OrderPatch, OrderStatus, PendingFile, PendingId, Quantities,
};
use super::monitor::{MonitorFilter, MonitorHistory};
use super::pending::{prepare_raw_files, PendingSet};
use super::reconcile::{reconcile, Reconciliation};
use crate::error::StorageError;
use crate::preview::{PreviewCache, PreviewImage};
use crate::shell::Shell;
use crate::storage::OrderStore;
use crate::watch::WatchSource;

/// Change notifications for whatever presents the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Pending entries were added, removed or edited
    PendingChanged,
    /// A preview was attached to this pending entry
    PreviewReady(PendingId),
    /// The order list or an order in it changed
    OrdersChanged,
    /// Watch-folder history or filter changed
    MonitorChanged,
}

/// Owns the pending set, the order list, the preview cache and the watch
/// history, and drives the store, shell and watcher collaborators
pub struct Session<S, H, W> {
    /// Where orders live
    store: S,
    /// Dialogs, file reads and OS thumbnails
    shell: H,
    /// Source of watch-folder arrivals
    watcher: W,
    pending: PendingSet,
    monitor: MonitorHistory,
    /// Which monitor entries are offered for import
    monitor_filter: MonitorFilter,
    /// Decoded order previews keyed by `dir::preview file`
    previews: PreviewCache,
    /// Last listing from the store, patched in place by single-order flows
    orders: Vec<Order>,
    /// Sender half of the channel returned by `new`
    events: UnboundedSender<SessionEvent>,
}

impl<S: OrderStore, H: Shell, W: WatchSource> Session<S, H, W> {
    /// New session plus the receiving end of its event channel
    pub fn new(store: S, shell: H, watcher: W) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let session = Self {
            store,
            shell,
            watcher,
            pending: PendingSet::new(),
            monitor: MonitorHistory::new(),
            monitor_filter: MonitorFilter::default(),
            previews: PreviewCache::new(),
            orders: Vec::new(),
            events,
        };
        (session, receiver)
    }

    /// Send an event; nobody listening is fine
    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// The order store behind this session
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Files waiting to become part of an order
    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    /// Orders as of the last listing or write
    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    /// Everything seen in the watch folder so far
    pub fn monitor(&self) -> &MonitorHistory {
        &self.monitor
    }

    /// Current watch-folder filter
    pub fn monitor_filter(&self) -> MonitorFilter {
        self.monitor_filter
    }

    /// Decoded previews of stored order files
    pub fn previews(&self) -> &PreviewCache {
        &self.previews
    }

    // ========== Pending files ==========

    /// Native picker, then the same path as a drop
    pub async fn pick_files(&mut self) -> Vec<PendingId> {
        let paths = self.shell.select_files().await;
        if paths.is_empty() {
            return Vec::new();
        }
        let paths: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        self.drop_paths(&paths).await
    }

    /// Add dropped paths; previews follow one by one
    pub async fn drop_paths(&mut self, paths: &[String]) -> Vec<PendingId> {
        // Entries show up before any preview is ready
        let added = self.pending.add_by_paths(paths);
        self.notify(SessionEvent::PendingChanged);
        self.fill_previews_from_paths(paths).await;
        added
    }

    /// Add dropped or pasted bytes with their previews already attached
    pub async fn drop_raw_files(&mut self, blobs: Vec<FileBlob>) -> Vec<PendingId> {
        // Previews are generated before the entries are added
        let added = self.pending.add_by_raw_files(blobs).await;
        if !added.is_empty() {
            self.notify(SessionEvent::PendingChanged);
        }
        added
    }

    /// Generate previews for pending paths, applying each as it lands
    ///
    /// Returns how many previews were attached.
    pub async fn fill_previews_from_paths(&mut self, paths: &[String]) -> usize {
        // One job per pending path: model render or shell thumbnail
        let jobs = self.pending.preview_jobs(paths);
        let mut applied = 0;

        for job in jobs {
            let Some(image) = job.run(&self.shell).await else {
                continue;
            };
            // The entry may have been removed while the preview was in flight
            if self.pending.set_preview(&job.id, image) {
                applied += 1;
                self.notify(SessionEvent::PreviewReady(job.id));
            }
        }

        debug!(applied, "pending previews filled");
        applied
    }

    /// Drop one pending entry, returning it if it was there
    pub fn remove_pending(&mut self, id: &PendingId) -> Option<PendingFile> {
        let removed = self.pending.remove(id);
        if removed.is_some() {
            self.notify(SessionEvent::PendingChanged);
        }
        removed
    }

    /// Per-file note carried into the order record
    pub fn set_pending_note(&mut self, id: &PendingId, note: &str) -> bool {
        let changed = self.pending.set_note(id, note);
        if changed {
            self.notify(SessionEvent::PendingChanged);
        }
        changed
    }

    /// Print quantity, clamped to at least 1
    pub fn set_pending_quantity(&mut self, id: &PendingId, quantity: i64) -> bool {
        let changed = self.pending.set_quantity(id, quantity);
        if changed {
            self.notify(SessionEvent::PendingChanged);
        }
        changed
    }

    /// Manually supplied preview (e.g. pasted image) for a pending entry
    pub fn set_pending_preview(&mut self, id: &PendingId, image: PreviewImage) -> bool {
        let changed = self.pending.set_preview(id, image);
        if changed {
            self.notify(SessionEvent::PreviewReady(id.clone()));
        }
        changed
    }

    // ========== Orders ==========

    /// Reload every order from the store; cached previews are dropped
    pub async fn refresh_orders(&mut self) -> Result<(), StorageError> {
        self.orders = self.store.list_orders().await?;
        self.previews.clear();
        self.notify(SessionEvent::OrdersChanged);
        Ok(())
    }

    /// Replace (or add) one order in the local list after a store write
    fn apply_order_update(&mut self, order: Order) {
        match self.orders.iter_mut().find(|o| o.dir_name == order.dir_name) {
            Some(existing) => *existing = order,
            None => self.orders.push(order),
        }
        self.notify(SessionEvent::OrdersChanged);
    }

    /// Create an order from the draft and commit every pending file into it
    ///
    /// Pending files are cleared only once files and previews are stored;
    /// on a storage error they stay pending.
    pub async fn submit_order(&mut self, draft: &OrderDraft) -> Result<Reconciliation, StorageError> {
        let order = self.store.create_order(draft).await?;

        // Empty order: nothing to persist or reconcile
        if self.pending.is_empty() {
            self.refresh_orders().await?;
            return Ok(Reconciliation {
                order,
                outcomes: Vec::new(),
            });
        }

        // Snapshot the batch; records are appended after any existing ones
        let batch: Vec<PendingFile> = self.pending.iter().cloned().collect();
        let uploads = self.pending.uploads();
        let previous = order.files.len();

        let updated = self.store.persist_files(&order.dir_name, &uploads).await?;
        // Records of this batch, for pairing by position when names differ
        let fallback = updated.files.get(previous..).unwrap_or_default().to_vec();
        let result = reconcile(&self.store, &mut self.previews, updated, &batch, &fallback).await?;

        // Only now is it safe to forget the pending files
        self.pending.take_all();
        self.notify(SessionEvent::PendingChanged);
        info!(
            dir = %result.order.dir_name,
            files = batch.len(),
            previews = result.paired_count(),
            "order submitted"
        );

        self.refresh_orders().await?;
        Ok(result)
    }

    /// Change order-level fields (status, shipping info, due date, ...)
    pub async fn update_order(&mut self, dir_name: &str, patch: &OrderPatch) -> Result<Order, StorageError> {
        let updated = self.store.update_order(dir_name, patch).await?;
        self.apply_order_update(updated.clone());
        Ok(updated)
    }

    /// Move an order to another status
    pub async fn set_order_status(&mut self, dir_name: &str, status: OrderStatus) -> Result<Order, StorageError> {
        self.update_order(dir_name, &OrderPatch::status(status)).await
    }

    /// Note shown on the order folder itself
    pub async fn set_order_note(&mut self, dir_name: &str, note: &str) -> Result<Order, StorageError> {
        self.update_order(dir_name, &OrderPatch::folder_note(note.trim())).await
    }

    /// Duplicate an order as a fresh one (new number, status reset)
    pub async fn copy_order(&mut self, dir_name: &str) -> Result<Order, StorageError> {
        let copied = self.store.copy_order(dir_name).await?;
        self.apply_order_update(copied.clone());
        Ok(copied)
    }

    /// Remove an order folder; `false` when it was already gone
    pub async fn delete_order(&mut self, dir_name: &str) -> Result<bool, StorageError> {
        let removed = self.store.delete_order(dir_name).await?;

        // Forget it locally either way, the folder is not there anymore
        self.orders.retain(|order| order.dir_name != dir_name);
        let evicted = self.previews.remove_order(dir_name);
        debug!(dir = dir_name, removed, evicted, "order dropped");

        self.notify(SessionEvent::OrdersChanged);
        Ok(removed)
    }

    /// Swap the content of a stored file for another file on disk
    pub async fn replace_order_file(
        &mut self,
        dir_name: &str,
        stored_name: &str,
        source: &Path,
    ) -> Result<Order, StorageError> {
        let updated = self.store.replace_file(dir_name, stored_name, source).await?;
        // The old preview no longer matches the content
        self.previews.remove_for_stored(dir_name, stored_name);
        self.apply_order_update(updated.clone());
        Ok(updated)
    }

    /// Append dropped bytes to an existing order, previews included
    pub async fn add_raw_files_to_order(
        &mut self,
        dir_name: &str,
        blobs: Vec<FileBlob>,
    ) -> Result<Reconciliation, StorageError> {
        // Previews come from the bytes before anything is stored
        let batch = prepare_raw_files(blobs).await;
        let uploads: Vec<FileUpload> = batch.iter().map(PendingFile::to_upload).collect();

        let updated = self.store.persist_files(dir_name, &uploads).await?;
        // The new records are the last `batch.len()` ones
        let start = updated.files.len().saturating_sub(batch.len());
        let fallback = updated.files[start..].to_vec();

        let result = reconcile(&self.store, &mut self.previews, updated, &batch, &fallback).await?;
        self.apply_order_update(result.order.clone());
        Ok(result)
    }

    /// Append files by path, without previews
    pub async fn add_paths_to_order(&mut self, dir_name: &str, paths: &[PathBuf]) -> Result<Order, StorageError> {
        let uploads: Vec<FileUpload> = paths.iter().map(|p| FileUpload::from_path(p)).collect();
        let updated = self.store.persist_files(dir_name, &uploads).await?;
        self.apply_order_update(updated.clone());
        Ok(updated)
    }

    /// Clamp (print >= 1, printed <= print) and store
    pub async fn set_order_file_quantities(
        &mut self,
        dir_name: &str,
        stored_name: &str,
        print: i64,
        printed: i64,
    ) -> Result<Order, StorageError> {
        let quantities = Quantities::clamped(print, printed);
        let updated = self
            .store
            .update_file_quantities(dir_name, stored_name, quantities)
            .await?;
        self.apply_order_update(updated.clone());
        Ok(updated)
    }

    /// Note on one stored file
    pub async fn set_order_file_note(&mut self, dir_name: &str, stored_name: &str, note: &str) -> Result<Order, StorageError> {
        let updated = self.store.update_file_note(dir_name, stored_name, note).await?;
        self.apply_order_update(updated.clone());
        Ok(updated)
    }

    /// Remove a stored file, its preview and its record
    pub async fn delete_order_file(&mut self, dir_name: &str, stored_name: &str) -> Result<Order, StorageError> {
        let updated = self.store.delete_file(dir_name, stored_name).await?;
        self.previews.remove_for_stored(dir_name, stored_name);
        self.apply_order_update(updated.clone());
        Ok(updated)
    }

    /// Remove only the preview of a stored file
    pub async fn delete_order_preview(&mut self, dir_name: &str, stored_name: &str) -> Result<Order, StorageError> {
        let updated = self.store.delete_preview_image(dir_name, stored_name).await?;
        self.previews.remove_for_stored(dir_name, stored_name);
        self.apply_order_update(updated.clone());
        Ok(updated)
    }

    /// Replace the preview of a stored file with a user-supplied image
    pub async fn paste_order_preview(
        &mut self,
        dir_name: &str,
        stored_name: &str,
        image: PreviewImage,
    ) -> Result<Order, StorageError> {
        let updated = self
            .store
            .persist_preview_image(dir_name, stored_name, &image)
            .await?;
        self.previews.insert_for_stored(dir_name, stored_name, image);
        self.apply_order_update(updated.clone());
        Ok(updated)
    }

    /// Cached preview of an order file, loaded from the store on first use
    pub async fn order_preview(&mut self, dir_name: &str, preview_file: &str) -> Result<Option<PreviewImage>, StorageError> {
        let image = self.previews.ensure(&self.store, dir_name, preview_file).await?;
        Ok(image.cloned())
    }

    // ========== Watch folder ==========

    /// Watch a new folder, forgetting the previous history
    pub async fn watch_folder(&mut self, folder: &Path) -> io::Result<()> {
        self.watcher.watch(folder).await?;
        // History belongs to the previous folder
        self.monitor.clear();

        // Files already there are only listed when all files are shown
        if self.monitor_filter == MonitorFilter::All {
            let files = self.watcher.list().await?;
            self.monitor.append(&files, MonitorStatus::Existing);
        }
        self.notify(SessionEvent::MonitorChanged);
        Ok(())
    }

    /// Poll for arrivals; returns how many were new
    pub async fn refresh_monitor(&mut self) -> io::Result<usize> {
        // Not watching anything yet
        if self.watcher.folder().is_none() {
            return Ok(0);
        }

        let arrivals = self.watcher.poll_new_arrivals().await?;
        if arrivals.is_empty() {
            return Ok(0);
        }

        self.monitor.append(&arrivals, MonitorStatus::New);
        self.notify(SessionEvent::MonitorChanged);
        info!(arrivals = arrivals.len(), "new files in watch folder");
        Ok(arrivals.len())
    }

    /// Switch between new arrivals only and every file in the folder
    pub async fn set_monitor_filter(&mut self, filter: MonitorFilter) -> io::Result<()> {
        self.monitor_filter = filter;
        // Switching to all lists what is already in the folder
        if filter == MonitorFilter::All && self.watcher.folder().is_some() {
            let files = self.watcher.list().await?;
            self.monitor.append(&files, MonitorStatus::Existing);
        }
        self.notify(SessionEvent::MonitorChanged);
        Ok(())
    }

    /// Forget added and ignored marks
    pub fn reset_monitor_history(&mut self) {
        self.monitor.reset();
        self.notify(SessionEvent::MonitorChanged);
    }

    /// Move every current candidate into the pending set
    pub async fn monitor_add_all(&mut self) -> usize {
        let paths: Vec<PathBuf> = self
            .monitor
            .candidates(self.monitor_filter)
            .into_iter()
            .map(|f| f.path.clone())
            .collect();
        if paths.is_empty() {
            return 0;
        }

        // Mark first so a second call does not add them again
        for path in &paths {
            self.monitor.mark_added(path);
        }
        self.add_monitor_paths(&paths).await;
        paths.len()
    }

    /// Send one monitored file to the pending set; `false` if unknown or already added
    pub async fn monitor_add_one(&mut self, path: &Path) -> bool {
        match self.monitor.get(path) {
            // Ignored files can still be added by hand
            Some(file) if file.status != MonitorStatus::Added => {}
            _ => return false,
        }

        self.monitor.mark_added(path);
        self.add_monitor_paths(&[path.to_path_buf()]).await;
        true
    }

    /// Hide one monitored file from the candidates
    pub fn monitor_ignore_one(&mut self, path: &Path) -> bool {
        let changed = self.monitor.mark_ignored(path);
        if changed {
            self.notify(SessionEvent::MonitorChanged);
        }
        changed
    }

    /// Same as a drop, previews included
    async fn add_monitor_paths(&mut self, paths: &[PathBuf]) {
        let paths: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        self.pending.add_by_paths(&paths);
        self.notify(SessionEvent::PendingChanged);
        self.notify(SessionEvent::MonitorChanged);
        self.fill_previews_from_paths(&paths).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::stl::tetrahedron_stl;
    use crate::storage::FsOrderStore;
    use crate::watch::FolderWatcher;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Scripted picker, real reads, canned OS thumbnails
    #[derive(Default)]
    struct FakeShell {
        /// What the picker returns
        selection: Vec<PathBuf>,
        /// Every path a thumbnail was asked for
        thumbnail_requests: RefCell<Vec<PathBuf>>,
    }

    impl Shell for FakeShell {
        async fn select_files(&self) -> Vec<PathBuf> {
            self.selection.clone()
        }

        async fn read_file_bytes(&self, path: &Path) -> Option<Vec<u8>> {
            std::fs::read(path).ok()
        }

        async fn get_file_thumbnail(&self, path: &Path, _size: u32) -> Option<PreviewImage> {
            self.thumbnail_requests.borrow_mut().push(path.to_path_buf());
            Some(PreviewImage::from_png(b"\x89PNG\r\n\x1a\nshell".to_vec()))
        }
    }

    type TestSession = Session<FsOrderStore, FakeShell, FolderWatcher>;

    struct Fixture {
        dir: TempDir,
        session: TestSession,
        events: UnboundedReceiver<SessionEvent>,
    }

    impl Fixture {
        fn inbox(&self) -> PathBuf {
            self.dir.path().join("inbox")
        }

        /// Write a file into the inbox and return its path as text
        fn write_input(&self, name: &str, bytes: &[u8]) -> String {
            let path = self.inbox().join(name);
            std::fs::write(&path, bytes).unwrap();
            path.to_string_lossy().into_owned()
        }

        /// Events sent since the last drain
        fn drain(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    async fn fixture_with(shell: FakeShell) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("inbox")).unwrap();

        let store = FsOrderStore::new(dir.path().join("settings.json"));
        store.set_base_dir(&dir.path().join("orders")).await.unwrap();

        let (session, events) = Session::new(store, shell, FolderWatcher::new());
        Fixture { dir, session, events }
    }

    async fn fixture() -> Fixture {
        fixture_with(FakeShell::default()).await
    }

    fn draft() -> OrderDraft {
        OrderDraft {
            title: "bracket".to_string(),
            customer_name: "ana".to_string(),
            ..OrderDraft::default()
        }
    }

    #[tokio::test]
    async fn test_drop_paths_fills_previews_incrementally() {
        let mut fx = fixture().await;
        let stl = fx.write_input("a.stl", &tetrahedron_stl());
        let step = fx.write_input("b.step", b"ISO-10303-21;");
        let txt = fx.write_input("c.txt", b"notes");

        let ids = fx.session.drop_paths(&[stl.clone(), step.clone(), txt]).await;
        assert_eq!(ids.len(), 3);

        let pending = fx.session.pending();
        assert!(pending.get(&ids[0]).unwrap().preview.is_some());
        // The STEP preview came from the shell, the text file has none
        assert!(pending.get(&ids[1]).unwrap().preview.is_some());
        assert!(pending.get(&ids[2]).unwrap().preview.is_none());

        // Entries are announced first, then each preview as it lands
        let events = fx.drain();
        assert_eq!(events[0], SessionEvent::PendingChanged);
        assert_eq!(
            &events[1..],
            [SessionEvent::PreviewReady(ids[0].clone()), SessionEvent::PreviewReady(ids[1].clone())]
        );
    }

    #[tokio::test]
    async fn test_pick_files_uses_shell_selection() {
        let dir = tempfile::tempdir().unwrap();
        let picked = dir.path().join("picked.stl");
        std::fs::write(&picked, tetrahedron_stl()).unwrap();

        let mut fx = fixture_with(FakeShell {
            selection: vec![picked.clone()],
            ..FakeShell::default()
        })
        .await;

        let ids = fx.session.pick_files().await;
        assert_eq!(ids, vec![PendingId::Path(picked.to_string_lossy().into_owned())]);
        assert!(fx.session.pending().get(&ids[0]).unwrap().preview.is_some());
        // STL renders locally, the shell is never asked
        assert!(fx.session.shell.thumbnail_requests.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_desktop_shell_supplies_cad_and_image_previews() {
        use crate::shell::{thumbnail_file_name, DesktopShell};
        use image::{Rgba, RgbaImage};

        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        std::fs::create_dir_all(&inbox).unwrap();
        let png = PreviewImage::encode(&RgbaImage::from_pixel(300, 300, Rgba([9, 9, 9, 255]))).unwrap();

        // A STEP file the desktop has already thumbnailed, a photo, and a STEP file it has not
        let step = inbox.join("bracket.step");
        let photo = inbox.join("photo.png");
        let bare = inbox.join("bare.stp");
        std::fs::write(&step, b"ISO-10303-21;").unwrap();
        std::fs::write(&photo, png.as_bytes()).unwrap();
        std::fs::write(&bare, b"ISO-10303-21;").unwrap();

        // Thumbnail cache as a file manager would have left it
        let thumbnails = dir.path().join("thumbnails");
        std::fs::create_dir_all(thumbnails.join("large")).unwrap();
        let cached = thumbnails.join("large").join(thumbnail_file_name(&std::fs::canonicalize(&step).unwrap()));
        std::fs::write(cached, png.as_bytes()).unwrap();

        let store = FsOrderStore::new(dir.path().join("settings.json"));
        let shell = DesktopShell::with_thumbnail_root(&thumbnails);
        let (mut session, _events) = Session::new(store, shell, FolderWatcher::new());

        let paths: Vec<String> = [&step, &photo, &bare]
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let ids = session.pending.add_by_paths(&paths);
        // Cached thumbnail and photo are both scaled to the preview size
        assert_eq!(session.fill_previews_from_paths(&paths).await, 2);

        for id in &ids[..2] {
            let preview = session.pending().get(id).unwrap().preview.clone().unwrap();
            let decoded = image::load_from_memory(preview.as_bytes()).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (256, 256));
        }
        assert!(session.pending().get(&ids[2]).unwrap().preview.is_none());
    }

    #[tokio::test]
    async fn test_submit_order_pairs_duplicate_names_in_order() {
        let mut fx = fixture().await;
        let bytes = tetrahedron_stl();

        // Two different files both called a.stl, plus one without a preview
        fx.session
            .drop_raw_files(vec![
                FileBlob::new("a.stl", bytes.clone(), 1),
                FileBlob::new("a.stl", bytes.clone(), 2),
                FileBlob::new("readme.txt", b"hi".to_vec(), 3),
            ])
            .await;
        let previews: Vec<PreviewImage> = fx
            .session
            .pending()
            .iter()
            .filter_map(|f| f.preview.clone())
            .collect();
        assert_eq!(previews.len(), 2);

        // Both a.stl previews were generated from the bytes
        let result = fx.session.submit_order(&draft()).await.unwrap();
        let order = &result.order;

        let stored: Vec<_> = order.files.iter().map(|f| f.saved_as.as_str()).collect();
        // Second a.stl was renamed on disk but still got its own preview
        assert_eq!(stored, ["a.stl", "a (1).stl", "readme.txt"]);
        assert_eq!(order.files[0].preview_image.as_deref(), Some("a.stl.preview.png"));
        assert_eq!(order.files[1].preview_image.as_deref(), Some("a (1).stl.preview.png"));
        assert_eq!(order.files[2].preview_image, None);
        assert_eq!(result.paired_count(), 2);

        assert!(fx.session.pending().is_empty());
        assert_eq!(fx.session.orders().len(), 1);

        let cached = fx
            .session
            .order_preview(&order.dir_name, "a (1).stl.preview.png")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached, previews[1]);
    }

    #[tokio::test]
    async fn test_submit_failure_keeps_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsOrderStore::new(dir.path().join("settings.json"));
        let (mut session, _events) = Session::new(store, FakeShell::default(), FolderWatcher::new());

        // No base directory configured
        session.drop_paths(&["/nowhere/a.stl".to_string()]).await;
        let result = session.submit_order(&draft()).await;

        assert!(matches!(result, Err(StorageError::BaseDirNotSet)));
        assert_eq!(session.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_add_raw_files_to_existing_order() {
        let mut fx = fixture().await;
        let order = fx.session.submit_order(&draft()).await.unwrap().order;

        let result = fx
            .session
            .add_raw_files_to_order(&order.dir_name, vec![FileBlob::new("plate.stl", tetrahedron_stl(), 5)])
            .await
            .unwrap();

        // Preview rendered from the bytes and cached
        assert_eq!(result.order.files.len(), 1);
        assert!(result.order.files[0].preview_image.is_some());
        assert!(fx.session.previews().contains(&order.dir_name, "plate.stl.preview.png"));
    }

    #[tokio::test]
    async fn test_order_file_quantities_are_clamped() {
        let mut fx = fixture().await;
        let order = fx.session.submit_order(&draft()).await.unwrap().order;
        // Added by path, so no preview
        let input = PathBuf::from(fx.write_input("part.obj", b"v 0 0 0\n"));
        fx.session.add_paths_to_order(&order.dir_name, &[input]).await.unwrap();

        let updated = fx
            .session
            .set_order_file_quantities(&order.dir_name, "part.obj", 5, 10)
            .await
            .unwrap();
        assert_eq!(updated.files[0].quantities(), Quantities { print: 5, printed: 5 });
        // Local list follows the store
        assert_eq!(fx.session.orders()[0].files[0].printed_qty, 5);
    }

    #[tokio::test]
    async fn test_order_lifecycle_status_copy_and_delete() {
        let mut fx = fixture().await;
        let order = fx.session.submit_order(&draft()).await.unwrap().order;
        let result = fx
            .session
            .add_raw_files_to_order(&order.dir_name, vec![FileBlob::new("plate.stl", tetrahedron_stl(), 5)])
            .await
            .unwrap();
        fx.session
            .set_order_file_quantities(&order.dir_name, "plate.stl", 3, 2)
            .await
            .unwrap();
        assert!(fx.session.previews().contains(&order.dir_name, "plate.stl.preview.png"));
        fx.drain();

        // Status change updates the local list and announces it once
        let printing = fx.session.set_order_status(&order.dir_name, OrderStatus::Printing).await.unwrap();
        assert_eq!(printing.status, OrderStatus::Printing);
        assert_eq!(fx.session.orders()[0].status, OrderStatus::Printing);
        assert_eq!(fx.drain(), [SessionEvent::OrdersChanged]);

        // Folder note is trimmed
        let noted = fx.session.set_order_note(&order.dir_name, "  shelf B ").await.unwrap();
        assert_eq!(noted.folder_note, "shelf B");

        // Copy starts over: new status, nothing printed, same previews
        let copy = fx.session.copy_order(&order.dir_name).await.unwrap();
        assert_eq!(copy.status, OrderStatus::New);
        assert_eq!(copy.files[0].printed_qty, 0);
        assert_eq!(copy.files[0].preview_image, result.order.files[0].preview_image);
        assert_eq!(fx.session.orders().len(), 2);

        // Deleting drops the order and its cached previews
        assert!(fx.session.delete_order(&order.dir_name).await.unwrap());
        assert_eq!(fx.session.orders().len(), 1);
        assert_eq!(fx.session.orders()[0].dir_name, copy.dir_name);
        assert!(!fx.session.previews().contains(&order.dir_name, "plate.stl.preview.png"));

        fx.session.refresh_orders().await.unwrap();
        assert_eq!(fx.session.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_order_file_drops_cached_preview() {
        let mut fx = fixture().await;
        let order = fx.session.submit_order(&draft()).await.unwrap().order;
        fx.session
            .add_raw_files_to_order(&order.dir_name, vec![FileBlob::new("plate.stl", tetrahedron_stl(), 5)])
            .await
            .unwrap();

        // The rendered preview of plate.stl is cached at this point
        let replacement = PathBuf::from(fx.write_input("plate-v2.stl", &tetrahedron_stl()));
        let updated = fx
            .session
            .replace_order_file(&order.dir_name, "plate.stl", &replacement)
            .await
            .unwrap();

        // Stored name stays, display name and preview change
        assert_eq!(updated.files[0].name, "plate-v2.stl");
        assert_eq!(updated.files[0].preview_image, None);
        assert!(!fx.session.previews().contains(&order.dir_name, "plate.stl.preview.png"));
        assert!(fx
            .session
            .order_preview(&order.dir_name, "plate.stl.preview.png")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_removed_entry_ignores_late_preview() {
        let mut fx = fixture().await;
        let stl = fx.write_input("a.stl", &tetrahedron_stl());
        let id = fx.session.pending.add_by_paths([stl.as_str()]).remove(0);

        // Preview is in flight when the entry goes away
        let jobs = fx.session.pending.preview_jobs([stl.as_str()]);
        fx.session.remove_pending(&id);

        let image = jobs[0].run(&fx.session.shell).await.unwrap();
        assert!(!fx.session.set_pending_preview(&id, image));
        assert!(fx.session.pending().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_flow() {
        let mut fx = fixture().await;
        let inbox = fx.inbox();
        fx.write_input("old.stl", &tetrahedron_stl());

        fx.session.set_monitor_filter(MonitorFilter::All).await.unwrap();
        fx.session.watch_folder(&inbox).await.unwrap();
        assert_eq!(fx.session.monitor().len(), 1);
        assert_eq!(fx.session.monitor().iter().next().unwrap().status, MonitorStatus::Existing);

        // Arrives after watching started
        let fresh = PathBuf::from(fx.write_input("fresh.stl", &tetrahedron_stl()));
        assert_eq!(fx.session.refresh_monitor().await.unwrap(), 1);
        assert_eq!(fx.session.monitor().get(&fresh).unwrap().status, MonitorStatus::New);

        // Adding twice is a no-op
        assert!(fx.session.monitor_add_one(&fresh).await);
        assert!(!fx.session.monitor_add_one(&fresh).await);
        assert_eq!(fx.session.pending().len(), 1);
        assert!(fx.session.pending().iter().next().unwrap().preview.is_some());

        // A full listing does not regress the added file
        fx.session.set_monitor_filter(MonitorFilter::All).await.unwrap();
        assert_eq!(fx.session.monitor().get(&fresh).unwrap().status, MonitorStatus::Added);

        // Ignored plus added leaves nothing to add
        let old = inbox.join("old.stl");
        assert!(fx.session.monitor_ignore_one(&old));
        assert_eq!(fx.session.monitor_add_all().await, 0);

        // Reset offers everything again as new
        fx.session.reset_monitor_history();
        assert_eq!(fx.session.monitor().get(&old).unwrap().status, MonitorStatus::New);

        // Both are offered again; fresh.stl is already pending
        assert_eq!(fx.session.monitor_add_all().await, 2);
        assert_eq!(fx.session.pending().len(), 2);
    }

    #[tokio::test]
    async fn test_new_filter_skips_existing_listing() {
        let mut fx = fixture().await;
        let inbox = fx.inbox();
        fx.write_input("old.stl", b"x");

        fx.session.watch_folder(&inbox).await.unwrap();
        // Default filter only offers arrivals
        assert!(fx.session.monitor().is_empty());
        assert_eq!(fx.session.refresh_monitor().await.unwrap(), 0);
    }
}
