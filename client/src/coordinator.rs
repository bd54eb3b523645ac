//! Mutation Coordinator.
//!
//! Holds the in-process mirror of every record and is the only component
//! that writes to it. An edit is validated, applied to the mirror and
//! published synchronously, then handed to a single ordered writer task for
//! the durable write. Per-record submission order is therefore the order in
//! which writes reach the local store.
//!
//! Field history goes through a bounded queue. When it is full the entry is
//! dropped and counted; history never blocks an edit.

use chartsync_engine::{
    ClinicalRecord, Field, FieldHistoryEntry, FieldValue, Modified, ModifiedClock, Origin,
    RecordId, RecordQuery, RecordSchema, SyncEvent,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::now_millis;
use crate::publisher::EventSender;
use crate::store::{LocalStore, LocalWrite, RecordChange};

/// Capacity of the mirror update channel.
const UPDATE_CAPACITY: usize = 1024;

enum WriteJob {
    Write {
        record: ClinicalRecord,
        previous_modified: Option<Modified>,
    },
    Flush(oneshot::Sender<()>),
}

enum HistoryJob {
    Entry(FieldHistoryEntry),
    Flush(oneshot::Sender<()>),
}

/// State shared with the background tasks.
struct Shared {
    store: LocalStore,
    mirror: DashMap<RecordId, ClinicalRecord>,
    /// Queued durable writes per record
    in_flight: DashMap<RecordId, usize>,
    clock: Mutex<ModifiedClock>,
    updates: broadcast::Sender<ClinicalRecord>,
    events: EventSender,
    #[cfg(test)]
    hooks: WriteHooks,
}

/// Lets tests hold or fail durable writes.
#[cfg(test)]
#[derive(Default)]
struct WriteHooks {
    hold: tokio::sync::RwLock<()>,
    fail: std::sync::atomic::AtomicBool,
}

impl Shared {
    fn publish(&self, record: &ClinicalRecord) {
        // no subscribers is fine
        let _ = self.updates.send(record.clone());
    }

    fn has_in_flight(&self, id: &str) -> bool {
        self.in_flight.get(id).is_some_and(|n| *n > 0)
    }

    fn begin_write(&self, id: &str) {
        *self.in_flight.entry(id.to_string()).or_insert(0) += 1;
    }

    fn end_write(&self, id: &str) {
        self.in_flight.remove_if_mut(id, |_, n| {
            *n = n.saturating_sub(1);
            *n == 0
        });
    }

    /// Replace a mirror entry unless local writes for it are still queued.
    ///
    /// The check runs under the entry lock, which is also held while an
    /// edit is queued, so an edit cannot slip in between.
    fn replace_if_idle(&self, id: &str, stored: Option<ClinicalRecord>) -> bool {
        use dashmap::mapref::entry::Entry;

        let entry = self.mirror.entry(id.to_string());
        if self.has_in_flight(id) {
            return false;
        }
        let published = match (entry, stored) {
            (Entry::Occupied(mut existing), Some(record)) => {
                if *existing.get() == record {
                    return true;
                }
                existing.insert(record.clone());
                Some(record)
            }
            (Entry::Vacant(vacant), Some(record)) => {
                vacant.insert(record.clone());
                Some(record)
            }
            (Entry::Occupied(existing), None) => {
                existing.remove();
                None
            }
            (Entry::Vacant(_), None) => None,
        };
        if let Some(record) = published {
            self.clock.lock().observe(record.modified);
            self.publish(&record);
        }
        true
    }

    /// Replace a mirror entry with what the store holds, queued writes or not.
    fn replace(&self, id: &str, stored: Option<ClinicalRecord>) {
        match stored {
            Some(record) => {
                self.clock.lock().observe(record.modified);
                self.mirror.insert(id.to_string(), record.clone());
                self.publish(&record);
            }
            None => {
                self.mirror.remove(id);
            }
        }
    }

    async fn restore(&self, id: &str) -> Result<()> {
        let stored = self.store.get(id).await?;
        self.replace(id, stored);
        Ok(())
    }

    async fn report_pending(&self) {
        match self.store.pending_count().await {
            Ok(count) => self.events.send(SyncEvent::PendingChanged(count)),
            Err(e) => warn!(error = %e, "could not count pending records"),
        }
    }
}

/// Serializes record edits.
pub struct MutationCoordinator {
    shared: Arc<Shared>,
    schema: RecordSchema,
    actor_id: String,
    writes: mpsc::UnboundedSender<WriteJob>,
    history: mpsc::Sender<HistoryJob>,
    dropped_history: AtomicU64,
}

impl MutationCoordinator {
    /// Load the mirror from the store and start the writer tasks.
    pub async fn open(
        store: LocalStore,
        events: EventSender,
        actor_id: impl Into<String>,
        history_capacity: usize,
    ) -> Result<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let shared = Arc::new(Shared {
            store,
            mirror: DashMap::new(),
            in_flight: DashMap::new(),
            clock: Mutex::new(ModifiedClock::new()),
            updates,
            events,
            #[cfg(test)]
            hooks: WriteHooks::default(),
        });

        let (writes, write_rx) = mpsc::unbounded_channel();
        let (history, history_rx) = mpsc::channel(history_capacity.max(1));
        tokio::spawn(run_writer(shared.clone(), write_rx));
        tokio::spawn(run_history(shared.store.clone(), history_rx));
        tokio::spawn(run_listener(
            Arc::downgrade(&shared),
            shared.store.subscribe_changes(),
        ));

        let coordinator = Self {
            shared,
            schema: RecordSchema::clinical(),
            actor_id: actor_id.into(),
            writes,
            history,
            dropped_history: AtomicU64::new(0),
        };
        coordinator.refresh_all().await?;
        Ok(coordinator)
    }

    /// Set one field.
    ///
    /// `path` is a top-level field (`clinicalSummary`) or a dotted sub-field
    /// (`systems.neuro`, `medications.prn`). Nothing changes if the path,
    /// the value's type or its length is invalid.
    pub fn apply(
        &self,
        record_id: &str,
        path: &str,
        value: impl Into<FieldValue>,
    ) -> Result<ClinicalRecord> {
        let field = Field::parse(path)?;
        let value = value.into();
        self.schema.validate_field(field, &value)?;
        let now = now_millis();

        let record = {
            let mut entry = self
                .shared
                .mirror
                .get_mut(record_id)
                .filter(|r| !r.deleted)
                .ok_or_else(|| ClientError::RecordNotFound(record_id.to_string()))?;

            let previous = entry.modified;
            let mut next = entry.value().clone();
            let old = next.set(field, value.clone())?;
            next.touch(field, now);
            next.modified = self.shared.clock.lock().next(now, previous);

            *entry = next.clone();
            // queue under the entry lock so queue order matches mirror order
            self.enqueue(next.clone(), Some(previous))?;
            if field.is_trackable() && old != value {
                self.offer_history(FieldHistoryEntry::new(
                    record_id,
                    field.path(),
                    old.to_history_string(),
                    value.to_history_string(),
                    self.actor_id.clone(),
                    now,
                ));
            }
            next
        };

        self.shared.publish(&record);
        Ok(record)
    }

    /// Insert a new record.
    pub fn create(&self, mut record: ClinicalRecord) -> Result<ClinicalRecord> {
        self.schema.validate_document(&record.to_document())?;
        let now = now_millis();

        match self.shared.mirror.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) if !existing.get().deleted => {
                return Err(ClientError::RecordAlreadyExists(record.id));
            }
            entry => {
                let previous = match &entry {
                    dashmap::mapref::entry::Entry::Occupied(existing) => {
                        Some(existing.get().modified)
                    }
                    dashmap::mapref::entry::Entry::Vacant(_) => None,
                };
                record.deleted = false;
                record.modified = self
                    .shared
                    .clock
                    .lock()
                    .next(now, previous.unwrap_or(record.modified));
                let inserted = entry.insert(record.clone());
                self.enqueue(record.clone(), previous)?;
                drop(inserted);
            }
        }

        self.shared.publish(&record);
        debug!(record_id = %record.id, "record created");
        Ok(record)
    }

    /// Tombstone a record.
    pub fn remove(&self, record_id: &str) -> Result<ClinicalRecord> {
        let now = now_millis();
        let record = {
            let mut entry = self
                .shared
                .mirror
                .get_mut(record_id)
                .filter(|r| !r.deleted)
                .ok_or_else(|| ClientError::RecordNotFound(record_id.to_string()))?;
            let previous = entry.modified;
            let modified = self.shared.clock.lock().next(now, previous);
            entry.mark_deleted(modified);
            let record = entry.value().clone();
            self.enqueue(record.clone(), Some(previous))?;
            record
        };

        self.shared.publish(&record);
        debug!(record_id, "record removed");
        Ok(record)
    }

    /// A live record from the mirror.
    pub fn get(&self, record_id: &str) -> Option<ClinicalRecord> {
        self.shared
            .mirror
            .get(record_id)
            .filter(|r| !r.deleted)
            .map(|r| r.value().clone())
    }

    /// Live records, ordered by (`order`, `id`).
    pub fn records(&self, query: &RecordQuery) -> Vec<ClinicalRecord> {
        let snapshot: Vec<ClinicalRecord> =
            self.shared.mirror.iter().map(|r| r.value().clone()).collect();
        query.run(&snapshot)
    }

    /// Mirror updates, one per change.
    pub fn subscribe(&self) -> broadcast::Receiver<ClinicalRecord> {
        self.shared.updates.subscribe()
    }

    /// Replace one mirror entry with the stored record. An entry with queued
    /// local writes is left alone; those writes bring it in line.
    pub async fn reload(&self, record_id: &str) -> Result<Option<ClinicalRecord>> {
        let stored = self.shared.store.get(record_id).await?;
        if !self.shared.replace_if_idle(record_id, stored.clone()) {
            debug!(record_id, "reload skipped, local writes queued");
        }
        Ok(stored)
    }

    /// Rebuild the mirror from the store. Entries with queued writes are kept.
    pub async fn refresh_all(&self) -> Result<()> {
        let stored = self.shared.store.query(&RecordQuery::new().include_deleted()).await?;
        let mut seen = std::collections::HashSet::with_capacity(stored.len());

        for record in stored {
            seen.insert(record.id.clone());
            let id = record.id.clone();
            self.shared.replace_if_idle(&id, Some(record));
        }
        self.shared
            .mirror
            .retain(|id, _| seen.contains(id) || self.shared.has_in_flight(id));

        debug!(records = self.shared.mirror.len(), "mirror refreshed");
        Ok(())
    }

    /// Wait for every queued durable and history write.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.writes.send(WriteJob::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.history.send(HistoryJob::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// History entries dropped because the queue was full.
    pub fn dropped_history(&self) -> u64 {
        self.dropped_history.load(Ordering::Relaxed)
    }

    fn enqueue(&self, record: ClinicalRecord, previous_modified: Option<Modified>) -> Result<()> {
        let id = record.id.clone();
        self.shared.begin_write(&id);
        if self
            .writes
            .send(WriteJob::Write {
                record,
                previous_modified,
            })
            .is_err()
        {
            self.shared.end_write(&id);
            return Err(ClientError::Cancelled);
        }
        Ok(())
    }

    fn offer_history(&self, entry: FieldHistoryEntry) {
        match self.history.try_send(HistoryJob::Entry(entry)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(HistoryJob::Entry(entry))) => {
                let dropped = self.dropped_history.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    record_id = %entry.record_id,
                    field = %entry.field,
                    dropped,
                    "history queue full, entry dropped"
                );
            }
            Err(_) => warn!("history writer stopped, entry dropped"),
        }
    }
}

/// Applies durable writes one at a time, in submission order.
async fn run_writer(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<WriteJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            WriteJob::Write {
                record,
                previous_modified,
            } => {
                let id = record.id.clone();
                match durable_write(&shared, &record, previous_modified).await {
                    Ok(write) => {
                        if write.conflict.is_some() {
                            match shared.store.open_conflicts().await {
                                Ok(open) => shared.events.send(SyncEvent::ConflictsChanged(open)),
                                Err(e) => warn!(error = %e, "could not load open conflicts"),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(record_id = %id, error = %e, "durable write failed, restoring mirror entry");
                        if let Err(e) = shared.restore(&id).await {
                            warn!(record_id = %id, error = %e, "could not restore mirror entry");
                        }
                    }
                }
                shared.end_write(&id);
                shared.report_pending().await;
            }
            WriteJob::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("coordinator writer stopped");
}

async fn durable_write(
    shared: &Shared,
    record: &ClinicalRecord,
    previous_modified: Option<Modified>,
) -> Result<LocalWrite> {
    #[cfg(test)]
    {
        let _held = shared.hooks.hold.read().await;
        if shared.hooks.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Storage(sqlx::Error::PoolClosed));
        }
    }
    shared.store.write_local(record, previous_modified).await
}

/// Appends history entries; failures are logged and dropped.
async fn run_history(store: LocalStore, mut rx: mpsc::Receiver<HistoryJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            HistoryJob::Entry(entry) => {
                if let Err(e) = store.append_history(&entry).await {
                    warn!(record_id = %entry.record_id, field = %entry.field, error = %e, "history write failed");
                }
            }
            HistoryJob::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("history writer stopped");
}

/// Refreshes mirror entries changed by replication or resolution.
async fn run_listener(shared: Weak<Shared>, mut changes: broadcast::Receiver<RecordChange>) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "mirror listener lagged, reloading everything");
                let Some(shared) = shared.upgrade() else { break };
                if let Ok(records) = shared.store.query(&RecordQuery::new().include_deleted()).await {
                    for record in records {
                        let id = record.id.clone();
                        shared.replace_if_idle(&id, Some(record));
                    }
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if change.origin == Origin::Local {
            continue;
        }
        let Some(shared) = shared.upgrade() else { break };
        if !shared.replace_if_idle(&change.record_id, change.record) {
            debug!(record_id = %change.record_id, "skipping refresh, local writes queued");
        }
    }
    debug!("mirror listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::SyncStatePublisher;

    async fn coordinator(capacity: usize) -> (MutationCoordinator, LocalStore, SyncStatePublisher) {
        let store = LocalStore::in_memory("records").await.unwrap();
        let publisher = SyncStatePublisher::start();
        let coordinator = MutationCoordinator::open(store.clone(), publisher.events(), "nurse", capacity)
            .await
            .unwrap();
        (coordinator, store, publisher)
    }

    fn patient(id: &str) -> ClinicalRecord {
        ClinicalRecord::new(id, "u1", "Bed 1", 0, 0)
    }

    #[tokio::test]
    async fn apply_updates_mirror_synchronously() {
        let (c, store, _p) = coordinator(16).await;
        c.create(patient("p1")).unwrap();

        let record = c.apply("p1", "systems.neuro", "GCS 15").unwrap();
        assert_eq!(record.systems.neuro, "GCS 15");
        assert_eq!(c.get("p1").unwrap().systems.neuro, "GCS 15");
        assert!(record.field_timestamps.contains_key("systems.neuro"));

        c.flush().await;
        assert_eq!(store.get("p1").await.unwrap().unwrap().systems.neuro, "GCS 15");
    }

    #[tokio::test]
    async fn rejects_unknown_path_before_any_change() {
        let (c, _store, _p) = coordinator(16).await;
        let before = c.create(patient("p1")).unwrap();

        assert!(matches!(
            c.apply("p1", "vitals.hr", "80"),
            Err(ClientError::Engine(_))
        ));
        assert!(matches!(
            c.apply("p1", "systems.liver", "ok"),
            Err(ClientError::Engine(_))
        ));
        assert!(matches!(
            c.apply("p1", "order", "first"),
            Err(ClientError::Validation(_))
        ));
        assert_eq!(c.get("p1").unwrap(), before);
    }

    #[tokio::test]
    async fn modified_never_decreases() {
        let (c, _store, _p) = coordinator(16).await;
        let mut last = c.create(patient("p1")).unwrap().modified;
        for i in 0..20 {
            let record = c.apply("p1", "labs", format!("lab {i}")).unwrap();
            assert!(record.modified > last);
            last = record.modified;
        }
    }

    #[tokio::test]
    async fn non_trackable_field_has_no_history() {
        let (c, store, _p) = coordinator(16).await;
        c.create(patient("p1")).unwrap();
        let record = c.apply("p1", "collapsed", true).unwrap();
        assert!(record.field_timestamps.is_empty());
        assert_eq!(record.last_modified, None);

        c.flush().await;
        assert!(store.history("p1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_history_queue_drops_and_counts() {
        let (c, store, _p) = coordinator(2).await;
        c.create(patient("p1")).unwrap();
        for text in ["a", "b", "c", "d", "e"] {
            c.apply("p1", "imaging", text).unwrap();
        }
        assert_eq!(c.dropped_history(), 3);
        assert_eq!(c.get("p1").unwrap().imaging, "e");

        c.flush().await;
        assert_eq!(store.history("p1", Some("imaging")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_tombstones_and_hides() {
        let (c, store, _p) = coordinator(16).await;
        c.create(patient("p1")).unwrap();
        c.remove("p1").unwrap();

        assert!(c.get("p1").is_none());
        assert!(matches!(c.apply("p1", "labs", "x"), Err(ClientError::RecordNotFound(_))));
        c.flush().await;
        assert!(store.get("p1").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (c, _store, _p) = coordinator(16).await;
        c.create(patient("p1")).unwrap();
        assert!(matches!(
            c.create(patient("p1")),
            Err(ClientError::RecordAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn edits_queue_behind_pending_write() {
        let (c, store, _p) = coordinator(16).await;
        c.create(patient("p1")).unwrap();
        c.flush().await;

        let held = c.shared.hooks.hold.write().await;
        c.apply("p1", "clinicalSummary", "A").unwrap();
        c.apply("p1", "clinicalSummary", "B").unwrap();
        assert_eq!(c.get("p1").unwrap().clinical_summary, "B");
        assert_eq!(store.get("p1").await.unwrap().unwrap().clinical_summary, "");

        drop(held);
        c.flush().await;
        assert_eq!(store.get("p1").await.unwrap().unwrap().clinical_summary, "B");
        let pairs: Vec<(String, String)> = store
            .history("p1", Some("clinicalSummary"))
            .await
            .unwrap()
            .into_iter()
            .map(|h| (h.old_value, h.new_value))
            .collect();
        assert_eq!(
            pairs,
            vec![("".into(), "A".into()), ("A".into(), "B".into())]
        );
    }

    #[tokio::test]
    async fn failed_write_restores_mirror_from_store() {
        let (c, store, _p) = coordinator(16).await;
        c.create(patient("p1")).unwrap();
        c.flush().await;
        let stored = store.get("p1").await.unwrap().unwrap();

        c.shared.hooks.fail.store(true, Ordering::SeqCst);
        let edited = c.apply("p1", "labs", "K 4.1").unwrap();
        assert_eq!(edited.labs, "K 4.1");

        c.flush().await;
        assert_eq!(c.get("p1").unwrap(), stored);
        assert_eq!(store.get("p1").await.unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn reload_keeps_queued_local_edit() {
        let (c, store, _p) = coordinator(16).await;
        c.create(patient("p1")).unwrap();
        c.flush().await;

        let held = c.shared.hooks.hold.write().await;
        c.apply("p1", "labs", "mine").unwrap();
        let stored = c.reload("p1").await.unwrap().unwrap();
        assert_eq!(stored.labs, "");
        assert_eq!(c.get("p1").unwrap().labs, "mine");

        drop(held);
        c.flush().await;
        assert_eq!(store.get("p1").await.unwrap().unwrap().labs, "mine");

        // once the queue is empty a reload replaces the entry again
        c.reload("p1").await.unwrap();
        assert_eq!(c.get("p1").unwrap().labs, "mine");
    }

    #[tokio::test]
    async fn mirror_subscribers_see_updates() {
        let (c, _store, _p) = coordinator(16).await;
        let mut rx = c.subscribe();
        c.create(patient("p1")).unwrap();
        c.apply("p1", "name", "Bed 2").unwrap();

        assert_eq!(rx.recv().await.unwrap().name, "Bed 1");
        assert_eq!(rx.recv().await.unwrap().name, "Bed 2");
    }
}
