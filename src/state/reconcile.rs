/// Pairing freshly generated previews with committed file records
///
/// The store picks the final stored name at commit time and may rename on
/// collision, so previews are matched back by original file name: each
/// name gets a FIFO queue of the order's records, and pending entries pop
/// from their queue in submission order. When a queue is empty the entry
/// falls back to the caller's list of records appended by the same request,
/// by position. A record is never paired twice.
///
/// Previews are persisted one at a time; each write returns the snapshot
/// the next one builds on.
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use super::data::{Order, OrderFileRecord, PendingFile};
use crate::error::StorageError;
use crate::preview::{PreviewCache, PreviewImage};
use crate::storage::OrderStore;

/// What happened to one pending entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Preview paired with (and written for) this stored name
    Paired { stored_name: String },
    /// Entry had a preview but no record was left to pair it with
    Mismatch,
    /// Entry had no preview
    NoPreview,
}

/// A preview assigned to a stored file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing<'a> {
    /// Position of the pending entry in the batch
    pub index: usize,
    pub stored_name: &'a str,
    pub preview: &'a PreviewImage,
}

/// Result of a reconciliation pass
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Latest order snapshot after all preview writes
    pub order: Order,
    /// One outcome per batch entry, in batch order
    pub outcomes: Vec<MatchOutcome>,
}

impl Reconciliation {
    /// Number of previews that found a record
    pub fn paired_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, MatchOutcome::Paired { .. }))
            .count()
    }
}

/// Match previews to records without touching storage
///
/// Returns the pairings plus one outcome per batch entry.
pub fn pair_previews<'a>(
    files: &'a [OrderFileRecord],
    batch: &'a [PendingFile],
    fallback: &'a [OrderFileRecord],
) -> (Vec<Pairing<'a>>, Vec<MatchOutcome>) {
    // Records grouped by original name, in manifest order
    let mut buckets: HashMap<&str, VecDeque<&OrderFileRecord>> = HashMap::new();
    for record in files {
        buckets.entry(record.name.as_str()).or_default().push_back(record);
    }

    // Stored names already given a preview
    let mut consumed: HashSet<&str> = HashSet::new();
    let mut pairings = Vec::new();
    let mut outcomes = Vec::with_capacity(batch.len());

    for (index, entry) in batch.iter().enumerate() {
        let Some(preview) = &entry.preview else {
            outcomes.push(MatchOutcome::NoPreview);
            continue;
        };

        let mut record = None;
        // Oldest unclaimed record with the same original name
        if let Some(queue) = buckets.get_mut(entry.name.as_str()) {
            while let Some(candidate) = queue.pop_front() {
                if !consumed.contains(candidate.saved_as.as_str()) {
                    record = Some(candidate);
                    break;
                }
            }
        }
        // Otherwise the record at the same position in this request
        if record.is_none() {
            record = fallback
                .get(index)
                .filter(|r| !consumed.contains(r.saved_as.as_str()));
        }

        match record {
            Some(record) => {
                consumed.insert(record.saved_as.as_str());
                outcomes.push(MatchOutcome::Paired {
                    stored_name: record.saved_as.clone(),
                });
                pairings.push(Pairing {
                    index,
                    stored_name: record.saved_as.as_str(),
                    preview,
                });
            }
            None => {
                debug!(name = %entry.name, "no record left for preview");
                outcomes.push(MatchOutcome::Mismatch);
            }
        }
    }

    (pairings, outcomes)
}

/// Persist each pending preview under its matched stored name
///
/// Writes are sequential and every written preview is also put in `cache`.
/// A storage failure aborts the pass and propagates.
pub async fn reconcile<S: OrderStore>(
    store: &S,
    cache: &mut PreviewCache,
    committed: Order,
    batch: &[PendingFile],
    fallback: &[OrderFileRecord],
) -> Result<Reconciliation, StorageError> {
    let (pairings, outcomes) = pair_previews(&committed.files, batch, fallback);
    let dir_name = committed.dir_name.as_str();

    // Each write returns the manifest the next one builds on
    let mut latest: Option<Order> = None;
    for pairing in &pairings {
        let updated = store
            .persist_preview_image(dir_name, pairing.stored_name, pairing.preview)
            .await?;
        cache.insert_for_stored(dir_name, pairing.stored_name, pairing.preview.clone());
        debug!(dir = dir_name, stored = pairing.stored_name, "preview paired");
        latest = Some(updated);
    }

    if !pairings.is_empty() {
        info!(dir = dir_name, paired = pairings.len(), "previews reconciled");
    }

    // No writes: the committed snapshot is still current
    let order = match latest {
        Some(order) => order,
        None => committed,
    };
    Ok(Reconciliation { order, outcomes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::data::{FileUpload, OrderDraft, OrderPatch, PendingId, Quantities};
    use std::cell::RefCell;
    use std::path::Path;

    /// Record with default quantities and no preview
    fn record(name: &str, saved_as: &str) -> OrderFileRecord {
        OrderFileRecord {
            name: name.to_string(),
            saved_as: saved_as.to_string(),
            note: String::new(),
            preview_image: None,
            print_qty: 1,
            printed_qty: 0,
            added_at: String::new(),
        }
    }

    /// Pending entry whose preview bytes are just `[tag]`; the tag also keeps ids apart
    fn pending(name: &str, preview: Option<u8>) -> PendingFile {
        let mut file = PendingFile::from_path(&format!("/in/{}/{}", preview.unwrap_or(0), name));
        file.preview = preview.map(|tag| PreviewImage::from_png(vec![tag]));
        file
    }

    /// Fixed order holding `files`
    fn order(files: Vec<OrderFileRecord>) -> Order {
        Order {
            dir_name: "250101_box_bob_0001".to_string(),
            order_no: 1,
            date_prefix: "250101".to_string(),
            customer_name: "bob".to_string(),
            title: "box".to_string(),
            material: String::new(),
            quantity: 1,
            due_date: String::new(),
            status: Default::default(),
            note: String::new(),
            folder_note: String::new(),
            shipping_info: String::new(),
            created_at: String::new(),
            files,
        }
    }

    /// Records every preview write and applies it to its own manifest copy
    struct RecordingStore {
        order: RefCell<Order>,
        writes: RefCell<Vec<(String, Vec<u8>)>>,
        /// Stored name whose preview write fails
        fail_on: Option<&'static str>,
    }

    impl RecordingStore {
        fn new(order: Order) -> Self {
            Self {
                order: RefCell::new(order),
                writes: RefCell::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    impl OrderStore for RecordingStore {
        // Reconciliation only writes and reads previews
        async fn create_order(&self, _draft: &OrderDraft) -> Result<Order, StorageError> {
            unreachable!()
        }

        async fn list_orders(&self) -> Result<Vec<Order>, StorageError> {
            Ok(vec![self.order.borrow().clone()])
        }

        async fn update_order(&self, _: &str, _: &OrderPatch) -> Result<Order, StorageError> {
            unreachable!()
        }

        async fn copy_order(&self, _: &str) -> Result<Order, StorageError> {
            unreachable!()
        }

        async fn delete_order(&self, _: &str) -> Result<bool, StorageError> {
            unreachable!()
        }

        async fn persist_files(&self, _dir: &str, _uploads: &[FileUpload]) -> Result<Order, StorageError> {
            unreachable!()
        }

        async fn persist_preview_image(
            &self,
            _dir: &str,
            stored_name: &str,
            image: &PreviewImage,
        ) -> Result<Order, StorageError> {
            // Simulated disk failure for one stored name
            if self.fail_on == Some(stored_name) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.writes
                .borrow_mut()
                .push((stored_name.to_string(), image.as_bytes().to_vec()));
            let mut order = self.order.borrow_mut();
            if let Some(record) = order.file_mut(stored_name) {
                record.preview_image = Some(format!("{}.preview.png", stored_name));
            }
            Ok(order.clone())
        }

        async fn update_file_quantities(&self, _: &str, _: &str, _: Quantities) -> Result<Order, StorageError> {
            unreachable!()
        }

        async fn update_file_note(&self, _: &str, _: &str, _: &str) -> Result<Order, StorageError> {
            unreachable!()
        }

        async fn replace_file(&self, _: &str, _: &str, _: &Path) -> Result<Order, StorageError> {
            unreachable!()
        }

        async fn delete_file(&self, _: &str, _: &str) -> Result<Order, StorageError> {
            unreachable!()
        }

        async fn delete_preview_image(&self, _: &str, _: &str) -> Result<Order, StorageError> {
            unreachable!()
        }

        async fn read_preview(&self, _: &str, _: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(None)
        }
    }

    #[test]
    fn test_same_name_pairs_fifo() {
        let files = vec![record("a.stl", "a.stl"), record("a.stl", "a (1).stl"), record("b.stl", "b.stl")];
        let batch = vec![pending("a.stl", Some(1)), pending("a.stl", Some(2))];

        let (pairings, outcomes) = pair_previews(&files, &batch, &[]);

        assert_eq!(pairings.len(), 2);
        assert_eq!((pairings[0].stored_name, pairings[0].preview.as_bytes()), ("a.stl", &[1u8][..]));
        assert_eq!((pairings[1].stored_name, pairings[1].preview.as_bytes()), ("a (1).stl", &[2u8][..]));
        assert_eq!(outcomes.len(), 2);
    }

    #[test]
    fn test_entries_without_preview_are_skipped() {
        let files = vec![record("a.stl", "a.stl"), record("b.stl", "b.stl")];
        let batch = vec![pending("a.stl", None), pending("b.stl", Some(7))];

        let (pairings, outcomes) = pair_previews(&files, &batch, &[]);

        assert_eq!(pairings.len(), 1);
        assert_eq!(pairings[0].stored_name, "b.stl");
        // a.stl had nothing to pair
        assert_eq!(outcomes[0], MatchOutcome::NoPreview);
    }

    #[test]
    fn test_more_previews_than_records_is_mismatch() {
        let files = vec![record("a.stl", "a.stl")];
        let batch = vec![pending("a.stl", Some(1)), pending("a.stl", Some(2)), pending("c.stl", Some(3))];

        let (pairings, outcomes) = pair_previews(&files, &batch, &[]);

        assert_eq!(pairings.len(), 1);
        assert_eq!(outcomes[1], MatchOutcome::Mismatch);
        assert_eq!(outcomes[2], MatchOutcome::Mismatch);
    }

    #[test]
    fn test_fallback_is_positional_and_never_reused() {
        // The store renamed the file; its record does not carry the pending name
        let files = vec![record("other.stl", "renamed.stl"), record("b.stl", "b.stl")];
        let fallback = files.clone();
        let batch = vec![pending("a.stl", Some(1)), pending("z.stl", Some(2))];

        let (pairings, outcomes) = pair_previews(&files, &batch, &fallback);

        assert_eq!(pairings.len(), 2);
        assert_eq!(pairings[0].stored_name, "renamed.stl");
        assert_eq!(pairings[1].stored_name, "b.stl");

        // b.stl was taken by position; a later b.stl entry gets nothing
        let batch = vec![pending("a.stl", Some(1)), pending("z.stl", Some(2)), pending("b.stl", Some(3))];
        let (_, outcomes_again) = pair_previews(&files, &batch, &fallback);
        assert_eq!(outcomes_again[2], MatchOutcome::Mismatch);
        assert!(matches!(outcomes[0], MatchOutcome::Paired { .. }));
    }

    #[test]
    fn test_record_taken_by_fallback_is_not_reused() {
        let files = vec![record("a.stl", "a.stl")];
        let fallback = files.clone();
        // q.stl takes a.stl by position, so the real a.stl entry finds its queue drained
        let batch = vec![pending("q.stl", Some(2)), pending("a.stl", Some(1))];

        let (pairings, outcomes) = pair_previews(&files, &batch, &fallback);
        assert_eq!(pairings.len(), 1);
        assert_eq!(pairings[0].stored_name, "a.stl");
        assert_eq!(outcomes[1], MatchOutcome::Mismatch);
    }

    #[tokio::test]
    async fn test_reconcile_writes_sequentially_and_caches() {
        let committed = order(vec![
            record("a.stl", "a.stl"),
            record("a.stl", "a (1).stl"),
            record("b.stl", "b.stl"),
        ]);
        let store = RecordingStore::new(committed.clone());
        let mut cache = PreviewCache::new();
        let batch = vec![pending("a.stl", Some(1)), pending("a.stl", Some(2))];

        let result = reconcile(&store, &mut cache, committed, &batch, &[]).await.unwrap();

        // One write per pairing, in batch order
        let writes = store.writes.borrow();
        assert_eq!(*writes, vec![("a.stl".to_string(), vec![1]), ("a (1).stl".to_string(), vec![2])]);

        // Snapshot reflects both writes, not just the last
        assert!(result.order.file("a.stl").unwrap().preview_image.is_some());
        assert!(result.order.file("a (1).stl").unwrap().preview_image.is_some());
        assert!(result.order.file("b.stl").unwrap().preview_image.is_none());
        assert_eq!(result.paired_count(), 2);

        // Written previews are cached under their preview file name
        assert!(cache.contains("250101_box_bob_0001", "a.stl.preview.png"));
        assert!(cache.contains("250101_box_bob_0001", "a (1).stl.preview.png"));
    }

    #[tokio::test]
    async fn test_no_previews_returns_committed_snapshot() {
        let committed = order(vec![record("a.stl", "a.stl")]);
        let store = RecordingStore::new(committed.clone());
        let mut cache = PreviewCache::new();

        let result = reconcile(&store, &mut cache, committed.clone(), &[pending("a.stl", None)], &[])
            .await
            .unwrap();

        // Nothing to write, the manifest comes back unchanged
        assert_eq!(result.order, committed);
        assert!(store.writes.borrow().is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let committed = order(vec![record("a.stl", "a.stl"), record("b.stl", "b.stl")]);
        let mut store = RecordingStore::new(committed.clone());
        // Second write hits the disk error
        store.fail_on = Some("b.stl");
        let mut cache = PreviewCache::new();
        let batch = vec![pending("a.stl", Some(1)), pending("b.stl", Some(2))];

        let result = reconcile(&store, &mut cache, committed, &batch, &[]).await;

        assert!(matches!(result, Err(StorageError::Io(_))));
        // a.stl was written before b.stl failed
        assert_eq!(store.writes.borrow().len(), 1);
    }

    #[test]
    fn test_pending_helper_ids_are_distinct() {
        assert_ne!(pending("a.stl", Some(1)).id, pending("a.stl", Some(2)).id);
        assert!(matches!(pending("a.stl", None).id, PendingId::Path(_)));
    }
}
