//! Local Store: the durable, schema-validated replica.
//!
//! Everything the client knows lives here: records, their outbound state,
//! pull checkpoints, conflicts and field history. Operations that must be
//! atomic (a pulled batch and its checkpoint, a conflict resolution) run in a
//! single SQLite transaction. Committed writes are announced on the
//! [`ChangeFeed`].

pub mod conflicts;
pub mod feed;
pub mod meta;
mod pool;
pub mod records;

pub use feed::{ChangeFeed, RecordChange};
pub use pool::MIGRATOR;

use chartsync_engine::{
    decide_pull, Checkpoint, ClinicalRecord, ConflictRecord, FieldHistoryEntry, Modified, Origin,
    PullBatch, PullDecision, PushDocument, RecordId, RecordQuery, RecordSchema, RejectReason,
    RejectedDocument, ReplicationIdentity, Resolution, ResolutionPolicy,
};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::now_millis;

/// Outcome of a local durable write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalWrite {
    /// Conflict opened because the remote replaced the record underneath
    pub conflict: Option<ConflictRecord>,
}

/// Outcome of applying one pulled batch.
#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    /// Documents written to the replica
    pub applied: usize,
    /// Documents that were malformed or belonged to another owner
    pub skipped: usize,
    /// Conflicts opened or refreshed by this batch
    pub conflicts: Vec<ConflictRecord>,
}

/// SQLite-backed local replica.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    feed: ChangeFeed,
    collection: String,
    schema: RecordSchema,
}

impl LocalStore {
    /// Open (and migrate) the database at `database_url`.
    pub async fn open(database_url: &str, collection: &str, window: Duration) -> Result<Self> {
        let pool = pool::connect(database_url).await?;
        Ok(Self {
            pool,
            feed: ChangeFeed::start(window),
            collection: collection.to_string(),
            schema: RecordSchema::clinical(),
        })
    }

    /// Fresh in-memory store.
    pub async fn in_memory(collection: &str) -> Result<Self> {
        Self::open("sqlite::memory:", collection, Duration::from_millis(25)).await
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn validate(&self, record: &ClinicalRecord) -> Result<()> {
        self.schema.validate_document(&record.to_document())?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ---- Records ----

    /// Validate and store a record as-is, leaving its outbound state alone.
    pub async fn put(&self, record: &ClinicalRecord) -> Result<()> {
        self.validate(record)?;
        records::upsert_record(&self.pool, record).await?;
        self.feed.publish(RecordChange::written(record, Origin::Local));
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ClinicalRecord>> {
        Ok(records::fetch_record(&self.pool, id).await?)
    }

    /// Run a query; results are ordered by (`order`, `id`).
    pub async fn query(&self, query: &RecordQuery) -> Result<Vec<ClinicalRecord>> {
        let rows =
            records::fetch_records(&self.pool, query.owner_filter(), query.includes_deleted())
                .await?;
        Ok(query.run(&rows))
    }

    /// Durable write of a locally edited record; marks it dirty.
    ///
    /// `previous_modified` is the `_modified` the writer last saw. If the
    /// stored record is clean and carries a different counter, a remote
    /// version replaced it in between: the write still lands, and a conflict
    /// holding the replaced remote version is opened.
    pub async fn write_local(
        &self,
        record: &ClinicalRecord,
        previous_modified: Option<Modified>,
    ) -> Result<LocalWrite> {
        self.validate(record)?;
        let now = now_millis();
        let mut tx = self.begin().await?;

        let stored = records::fetch_record(&mut *tx, &record.id).await?;
        let sync = records::fetch_sync_row(&mut *tx, &record.id).await?;
        let dirty = sync.as_ref().is_some_and(|s| s.dirty);

        let mut result = LocalWrite::default();
        if let Some(stored) = stored {
            if !dirty && Some(stored.modified) != previous_modified {
                let conflict = self
                    .open_or_refresh(&mut tx, record.clone(), stored, now)
                    .await?;
                warn!(record_id = %record.id, "local write raced a remote update, conflict opened");
                result.conflict = Some(conflict);
            }
        }

        records::upsert_record(&mut *tx, record).await?;
        records::mark_dirty(&mut *tx, &record.id, now).await?;
        tx.commit().await?;

        self.feed.publish(RecordChange::written(record, Origin::Local));
        Ok(result)
    }

    async fn open_or_refresh(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        local: ClinicalRecord,
        remote: ClinicalRecord,
        now: u64,
    ) -> Result<ConflictRecord> {
        match conflicts::fetch_open_for_record(&mut **tx, &local.id).await? {
            Some(mut open) => {
                open.local = local;
                open.remote = remote;
                open.detected_at = now;
                conflicts::update_versions(&mut **tx, &open).await?;
                Ok(open)
            }
            None => {
                let conflict = ConflictRecord::new(
                    uuid::Uuid::new_v4().to_string(),
                    self.collection.clone(),
                    local,
                    remote,
                    now,
                );
                conflicts::insert(&mut **tx, &conflict).await?;
                Ok(conflict)
            }
        }
    }

    // ---- Replication ----

    /// Apply one pulled batch and advance the checkpoint atomically.
    pub async fn apply_pull(
        &self,
        identity: &ReplicationIdentity,
        batch: &PullBatch,
    ) -> Result<PullOutcome> {
        let now = now_millis();
        let mut outcome = PullOutcome::default();
        let mut changes = Vec::new();
        let mut tx = self.begin().await?;

        for document in &batch.documents {
            let remote = match ClinicalRecord::from_document(document.clone()) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "skipping malformed remote document");
                    outcome.skipped += 1;
                    continue;
                }
            };
            if remote.owner_id != identity.owner_id {
                warn!(record_id = %remote.id, owner_id = %remote.owner_id, "skipping document of another owner");
                outcome.skipped += 1;
                continue;
            }

            let local = records::fetch_record(&mut *tx, &remote.id).await?;
            if let Some(mut open) = conflicts::fetch_open_for_record(&mut *tx, &remote.id).await? {
                // still unresolved; keep the newest remote for review
                open.remote = remote;
                open.detected_at = now;
                if let Some(local) = local {
                    open.local = local;
                }
                conflicts::update_versions(&mut *tx, &open).await?;
                outcome.conflicts.push(open);
                continue;
            }

            let sync = records::fetch_sync_row(&mut *tx, &remote.id).await?;
            let pending = sync.as_ref().and_then(|s| s.pending());

            match decide_pull(local.as_ref(), pending.as_ref(), &remote) {
                PullDecision::Apply | PullDecision::Converged => {
                    records::upsert_record(&mut *tx, &remote).await?;
                    records::mark_clean(&mut *tx, &remote.id, remote.modified).await?;
                    changes.push(RecordChange::written(&remote, Origin::Remote));
                    outcome.applied += 1;
                }
                PullDecision::Ignore | PullDecision::KeepLocal => {
                    debug!(record_id = %remote.id, "remote version not applied");
                }
                PullDecision::Conflict => {
                    let Some(local) = local else { continue };
                    let conflict = ConflictRecord::new(
                        uuid::Uuid::new_v4().to_string(),
                        self.collection.clone(),
                        local,
                        remote,
                        now,
                    );
                    conflicts::insert(&mut *tx, &conflict).await?;
                    info!(record_id = %conflict.record_id, conflict_id = %conflict.id, "conflict detected");
                    outcome.conflicts.push(conflict);
                }
            }
        }

        if let Some(checkpoint) = batch.checkpoint {
            meta::save_checkpoint(&mut *tx, &identity.key(), checkpoint, now).await?;
        }
        tx.commit().await?;

        self.feed.publish_all(changes);
        Ok(outcome)
    }

    /// Dirty records ready to push, oldest first.
    pub async fn outbound(&self, owner: &str, limit: usize) -> Result<Vec<PushDocument>> {
        let rows = records::fetch_outbound(&self.pool, owner, limit).await?;
        Ok(rows
            .into_iter()
            .map(|(record, sync)| PushDocument {
                record,
                base_modified: sync.remote_modified,
                force: sync.force_push,
            })
            .collect())
    }

    /// Record acknowledgements; returns how many records became clean.
    pub async fn acknowledge(&self, acked: &[(RecordId, Modified)]) -> Result<usize> {
        let mut tx = self.begin().await?;
        let mut cleared = 0;
        for (id, modified) in acked {
            if records::acknowledge(&mut *tx, id, *modified).await? {
                cleared += 1;
            }
        }
        tx.commit().await?;
        Ok(cleared)
    }

    /// Handle a rejected push. A conflict rejection carrying the remote's
    /// version opens (or refreshes) a conflict; the record stays dirty.
    pub async fn record_push_rejection(
        &self,
        rejected: &RejectedDocument,
    ) -> Result<Option<ConflictRecord>> {
        let current = match (rejected.reason, &rejected.current) {
            (RejectReason::Conflict, Some(current)) => current.clone(),
            (reason, _) => {
                warn!(
                    record_id = %rejected.id,
                    ?reason,
                    message = rejected.message.as_deref().unwrap_or(""),
                    "push rejected"
                );
                return Ok(None);
            }
        };

        let mut tx = self.begin().await?;
        let Some(local) = records::fetch_record(&mut *tx, &rejected.id).await? else {
            return Ok(None);
        };
        let conflict = self
            .open_or_refresh(&mut tx, local, current, now_millis())
            .await?;
        tx.commit().await?;

        info!(record_id = %conflict.record_id, conflict_id = %conflict.id, "push rejected, conflict opened");
        Ok(Some(conflict))
    }

    pub async fn checkpoint(&self, identity: &ReplicationIdentity) -> Result<Option<Checkpoint>> {
        Ok(meta::fetch_checkpoint(&self.pool, &identity.key()).await?)
    }

    /// Forget the pull cursor so the next pull starts from the beginning.
    pub async fn reset_checkpoint(&self, identity: &ReplicationIdentity) -> Result<()> {
        meta::delete_checkpoint(&self.pool, &identity.key()).await?;
        Ok(())
    }

    /// Number of dirty records.
    pub async fn pending_count(&self) -> Result<u64> {
        Ok(records::count_dirty(&self.pool).await?)
    }

    /// Delete acknowledged tombstones.
    pub async fn purge_tombstones(&self) -> Result<Vec<RecordId>> {
        let mut tx = self.begin().await?;
        let ids = records::purge_tombstones(&mut *tx).await?;
        for id in &ids {
            records::delete_sync_row(&mut *tx, id).await?;
        }
        tx.commit().await?;

        if !ids.is_empty() {
            debug!(count = ids.len(), "purged tombstones");
            self.feed
                .publish_all(ids.iter().map(|id| RecordChange::purged(id.clone())));
        }
        Ok(ids)
    }

    // ---- Conflicts ----

    pub async fn open_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        Ok(conflicts::fetch_all_open(&self.pool).await?)
    }

    /// An open conflict by id.
    pub async fn conflict(&self, id: &str) -> Result<ConflictRecord> {
        conflicts::fetch_open(&self.pool, id)
            .await?
            .ok_or_else(|| ClientError::ConflictNotFound(id.to_string()))
    }

    /// Settle a conflict in one transaction: record content, outbound state,
    /// conflict status and the audit entry.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        policy: ResolutionPolicy,
        actor_id: &str,
    ) -> Result<Resolution> {
        let now = now_millis();
        let mut tx = self.begin().await?;

        let conflict = conflicts::fetch_open(&mut *tx, id)
            .await?
            .ok_or_else(|| ClientError::ConflictNotFound(id.to_string()))?;
        let current = records::fetch_record(&mut *tx, &conflict.record_id)
            .await?
            .unwrap_or_else(|| conflict.local.clone());

        let resolution = conflict.resolve(&current, policy, actor_id, now);
        records::upsert_record(&mut *tx, &resolution.record).await?;
        records::set_pending(
            &mut *tx,
            &conflict.record_id,
            resolution.pending,
            resolution.remote_modified,
            now,
        )
        .await?;
        conflicts::mark_resolved(&mut *tx, id, policy, now).await?;
        meta::append_history(&mut *tx, &resolution.history).await?;
        tx.commit().await?;

        info!(conflict_id = %id, record_id = %conflict.record_id, %policy, "conflict resolved");
        self.feed
            .publish(RecordChange::written(&resolution.record, Origin::Resolution));
        Ok(resolution)
    }

    // ---- History ----

    pub async fn append_history(&self, entry: &FieldHistoryEntry) -> Result<()> {
        meta::append_history(&self.pool, entry).await?;
        Ok(())
    }

    /// Field history of a record, optionally for one field.
    pub async fn history(&self, record_id: &str, field: Option<&str>) -> Result<Vec<FieldHistoryEntry>> {
        Ok(meta::fetch_history(&self.pool, record_id, field).await?)
    }

    // ---- Notifications ----

    pub fn subscribe_changes(&self) -> broadcast::Receiver<RecordChange> {
        self.feed.subscribe()
    }

    /// Deliver pending change notifications now.
    pub async fn flush_changes(&self) {
        self.feed.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartsync_engine::{PendingWrite, PullBatch};

    fn record(id: &str, modified: Modified, summary: &str) -> ClinicalRecord {
        let mut r = ClinicalRecord::new(id, "u1", "Bed 1", 0, 0);
        r.modified = modified;
        r.clinical_summary = summary.into();
        r
    }

    fn identity() -> ReplicationIdentity {
        ReplicationIdentity::new("mem://", "records", "u1")
    }

    fn batch(docs: Vec<serde_json::Value>, checkpoint: u64) -> PullBatch {
        PullBatch {
            documents: docs,
            checkpoint: Some(Checkpoint(checkpoint)),
            has_more: false,
        }
    }

    #[tokio::test]
    async fn put_rejects_invalid_record() {
        let store = LocalStore::in_memory("records").await.unwrap();
        let mut bad = record("p1", 1, "x");
        bad.name.clear();

        let err = store.put(&bad).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(v) if v.fields() == vec!["name"]));
        assert!(store.get("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_orders_by_order_then_id() {
        let store = LocalStore::in_memory("records").await.unwrap();
        let mut a = record("b", 1, "");
        a.order = 1;
        let mut b = record("a", 1, "");
        b.order = 1;
        let mut c = record("z", 1, "");
        c.order = 0;
        for r in [&a, &b, &c] {
            store.put(r).await.unwrap();
        }

        let ids: Vec<_> = store
            .query(&RecordQuery::for_owner("u1"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[tokio::test]
    async fn write_local_marks_dirty() {
        let store = LocalStore::in_memory("records").await.unwrap();
        let r = record("p1", 1, "a");
        let result = store.write_local(&r, None).await.unwrap();

        assert!(result.conflict.is_none());
        assert_eq!(store.pending_count().await.unwrap(), 1);
        let out = store.outbound("u1", 10).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].base_modified, None);
    }

    #[tokio::test]
    async fn write_local_over_replaced_record_opens_conflict() {
        let store = LocalStore::in_memory("records").await.unwrap();
        store
            .apply_pull(&identity(), &batch(vec![record("p1", 5, "remote").to_document()], 1))
            .await
            .unwrap();

        // writer still believed the record was at 3
        let result = store.write_local(&record("p1", 6, "mine"), Some(3)).await.unwrap();
        let conflict = result.conflict.unwrap();
        assert_eq!(conflict.remote.clinical_summary, "remote");
        assert_eq!(store.get("p1").await.unwrap().unwrap().clinical_summary, "mine");
        assert!(store.outbound("u1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pull_applies_and_advances_checkpoint() {
        let store = LocalStore::in_memory("records").await.unwrap();
        let docs = vec![
            record("p1", 5, "a").to_document(),
            serde_json::json!({"id": 42}),
            record("p2", 6, "b").to_document(),
        ];
        let outcome = store.apply_pull(&identity(), &batch(docs, 9)).await.unwrap();

        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(store.checkpoint(&identity()).await.unwrap(), Some(Checkpoint(9)));
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pull_over_dirty_record_conflicts() {
        let store = LocalStore::in_memory("records").await.unwrap();
        store
            .apply_pull(&identity(), &batch(vec![record("p1", 5, "base").to_document()], 1))
            .await
            .unwrap();
        store.write_local(&record("p1", 6, "mine"), Some(5)).await.unwrap();

        let outcome = store
            .apply_pull(&identity(), &batch(vec![record("p1", 7, "theirs").to_document()], 2))
            .await
            .unwrap();
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(store.get("p1").await.unwrap().unwrap().clinical_summary, "mine");
        assert_eq!(store.open_conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn acknowledge_keeps_newer_write_dirty() {
        let store = LocalStore::in_memory("records").await.unwrap();
        store.write_local(&record("p1", 5, "a"), None).await.unwrap();
        store.write_local(&record("p1", 6, "ab"), Some(5)).await.unwrap();

        let cleared = store.acknowledge(&[("p1".into(), 5)]).await.unwrap();
        assert_eq!(cleared, 0);
        let out = store.outbound("u1", 10).await.unwrap();
        assert_eq!(out[0].base_modified, Some(5));

        assert_eq!(store.acknowledge(&[("p1".into(), 6)]).await.unwrap(), 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn server_wins_resolution_is_atomic() {
        let store = LocalStore::in_memory("records").await.unwrap();
        store
            .apply_pull(&identity(), &batch(vec![record("p1", 5, "base").to_document()], 1))
            .await
            .unwrap();
        store.write_local(&record("p1", 6, "mine"), Some(5)).await.unwrap();
        let outcome = store
            .apply_pull(&identity(), &batch(vec![record("p1", 7, "theirs").to_document()], 2))
            .await
            .unwrap();
        let id = outcome.conflicts[0].id.clone();

        store
            .resolve_conflict(&id, ResolutionPolicy::ServerWins, "nurse")
            .await
            .unwrap();

        assert_eq!(store.get("p1").await.unwrap().unwrap().clinical_summary, "theirs");
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store.open_conflicts().await.unwrap().is_empty());
        let history = store.history("p1", Some("_conflict")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(matches!(
            store.resolve_conflict(&id, ResolutionPolicy::ServerWins, "nurse").await,
            Err(ClientError::ConflictNotFound(_))
        ));
    }

    #[tokio::test]
    async fn client_wins_forces_next_push() {
        let store = LocalStore::in_memory("records").await.unwrap();
        store
            .apply_pull(&identity(), &batch(vec![record("p1", 5, "base").to_document()], 1))
            .await
            .unwrap();
        store.write_local(&record("p1", 6, "mine"), Some(5)).await.unwrap();
        let outcome = store
            .apply_pull(&identity(), &batch(vec![record("p1", 9, "theirs").to_document()], 2))
            .await
            .unwrap();

        store
            .resolve_conflict(&outcome.conflicts[0].id, ResolutionPolicy::ClientWins, "nurse")
            .await
            .unwrap();

        let out = store.outbound("u1", 10).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record.clinical_summary, "mine");
        assert!(out[0].record.modified > 9);
        assert_eq!(
            PendingWrite {
                base_modified: out[0].base_modified,
                force: out[0].force
            },
            PendingWrite {
                base_modified: Some(9),
                force: true
            }
        );
    }

    #[tokio::test]
    async fn purge_removes_acknowledged_tombstones_only() {
        let store = LocalStore::in_memory("records").await.unwrap();
        let mut gone = record("p1", 5, "a");
        gone.mark_deleted(6);
        store.write_local(&gone, None).await.unwrap();
        assert!(store.purge_tombstones().await.unwrap().is_empty());

        store.acknowledge(&[("p1".into(), 6)]).await.unwrap();
        assert_eq!(store.purge_tombstones().await.unwrap(), vec!["p1".to_string()]);
        assert!(store.get("p1").await.unwrap().is_none());
    }
}
