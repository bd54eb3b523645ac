//! In-process remote store.
//!
//! Applies the same acceptance rule as the server ([`decide_push`]) and keeps
//! a change sequence, so several clients can replicate against one instance.
//! Connectivity can be toggled and every call can be delayed to exercise
//! offline and slow-network behaviour.

use async_trait::async_trait;
use chartsync_engine::{
    decide_push, Checkpoint, ClinicalRecord, PullBatch, PushDecision, PushDocument, PushResult,
    RecordSchema, RejectReason, RejectedDocument, ReplicationIdentity,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{RemoteSignal, RemoteStore};
use crate::error::NetworkError;

const ENDPOINT: &str = "memory://";
const SIGNAL_BUFFER: usize = 16;

struct StoredDocument {
    owner_id: String,
    document: serde_json::Value,
    sequence: u64,
}

struct Watcher {
    collection: String,
    owner_id: String,
    tx: mpsc::Sender<RemoteSignal>,
}

struct Inner {
    documents: HashMap<(String, String), StoredDocument>,
    sequence: u64,
    online: bool,
    latency: Duration,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn store(&mut self, collection: &str, id: &str, owner_id: &str, document: serde_json::Value) -> u64 {
        self.sequence += 1;
        self.documents.insert(
            (collection.to_string(), id.to_string()),
            StoredDocument {
                owner_id: owner_id.to_string(),
                document,
                sequence: self.sequence,
            },
        );
        self.sequence
    }

    fn notify(&mut self, collection: &str, owner_id: &str, checkpoint: Checkpoint) {
        self.watchers.retain(|w| {
            if w.collection != collection || w.owner_id != owner_id {
                return !w.tx.is_closed();
            }
            // a full buffer already guarantees a pull
            !matches!(
                w.tx.try_send(RemoteSignal::ChangesAvailable { checkpoint }),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }
}

/// Remote store held in memory.
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    schema: RecordSchema,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                documents: HashMap::new(),
                sequence: 0,
                online: true,
                latency: Duration::ZERO,
                watchers: Vec::new(),
            }),
            schema: RecordSchema::clinical(),
        }
    }

    /// Toggle reachability. Going offline drops every live channel.
    pub fn set_online(&self, online: bool) {
        let mut inner = self.inner.lock();
        inner.online = online;
        if !online {
            inner.watchers.clear();
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().online
    }

    /// Delay applied before every pull, push and watch.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    async fn delay(&self) {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Stored version of a record.
    pub fn document(&self, collection: &str, id: &str) -> Option<ClinicalRecord> {
        let inner = self.inner.lock();
        let stored = inner.documents.get(&(collection.to_string(), id.to_string()))?;
        ClinicalRecord::from_document(stored.document.clone()).ok()
    }

    /// Number of stored documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .documents
            .keys()
            .filter(|(c, _)| c == collection)
            .count()
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Store an arbitrary document, bypassing validation.
    pub fn inject_raw(&self, collection: &str, id: &str, owner_id: &str, document: serde_json::Value) {
        let mut inner = self.inner.lock();
        let sequence = inner.store(collection, id, owner_id, document);
        inner.notify(collection, owner_id, Checkpoint(sequence));
    }

    fn push_one(
        &self,
        inner: &mut Inner,
        identity: &ReplicationIdentity,
        document: PushDocument,
    ) -> Result<Option<u64>, RejectedDocument> {
        let id = document.record.id.clone();
        let invalid = |message: String| RejectedDocument {
            id: id.clone(),
            reason: RejectReason::Invalid,
            message: Some(message),
            current: None,
        };

        let body = document.record.to_document();
        self.schema
            .validate_document(&body)
            .map_err(|e| invalid(e.to_string()))?;
        if document.record.owner_id != identity.owner_id {
            return Err(invalid("owner mismatch".into()));
        }

        let key = (identity.collection.clone(), id.clone());
        let stored = inner
            .documents
            .get(&key)
            .and_then(|s| ClinicalRecord::from_document(s.document.clone()).ok());

        match decide_push(stored.as_ref(), &document) {
            PushDecision::Accept => Ok(Some(inner.store(
                &identity.collection,
                &id,
                &identity.owner_id,
                body,
            ))),
            PushDecision::AlreadyApplied => Ok(None),
            PushDecision::Reject => Err(RejectedDocument {
                id: id.clone(),
                reason: RejectReason::Conflict,
                message: None,
                current: stored,
            }),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn endpoint(&self) -> &str {
        ENDPOINT
    }

    async fn pull(
        &self,
        identity: &ReplicationIdentity,
        since: Option<Checkpoint>,
        limit: usize,
    ) -> Result<PullBatch, NetworkError> {
        self.delay().await;
        let inner = self.inner.lock();
        if !inner.online {
            return Err(NetworkError::Offline);
        }
        let after = since.map_or(0, |c| c.0);

        let mut matching: Vec<&StoredDocument> = inner
            .documents
            .iter()
            .filter(|((collection, _), stored)| {
                *collection == identity.collection
                    && stored.owner_id == identity.owner_id
                    && stored.sequence > after
            })
            .map(|(_, stored)| stored)
            .collect();
        matching.sort_by_key(|stored| stored.sequence);

        let has_more = matching.len() > limit;
        matching.truncate(limit);

        Ok(PullBatch {
            checkpoint: matching.last().map(|s| Checkpoint(s.sequence)),
            documents: matching.into_iter().map(|s| s.document.clone()).collect(),
            has_more,
        })
    }

    async fn push(
        &self,
        identity: &ReplicationIdentity,
        documents: Vec<PushDocument>,
    ) -> Result<PushResult, NetworkError> {
        self.delay().await;
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(NetworkError::Offline);
        }

        let mut result = PushResult::default();
        let mut latest = None;
        for document in documents {
            let id = document.record.id.clone();
            match self.push_one(&mut inner, identity, document) {
                Ok(sequence) => {
                    latest = sequence.or(latest);
                    result.accepted.push(id);
                }
                Err(rejected) => result.rejected.push(rejected),
            }
        }

        if let Some(sequence) = latest {
            inner.notify(&identity.collection, &identity.owner_id, Checkpoint(sequence));
        }
        debug!(
            accepted = result.accepted.len(),
            rejected = result.rejected.len(),
            "memory remote push"
        );
        Ok(result)
    }

    async fn watch(
        &self,
        identity: &ReplicationIdentity,
    ) -> Result<mpsc::Receiver<RemoteSignal>, NetworkError> {
        self.delay().await;
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(NetworkError::Offline);
        }
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        inner.watchers.push(Watcher {
            collection: identity.collection.clone(),
            owner_id: identity.owner_id.clone(),
            tx,
        });
        Ok(rx)
    }
}
