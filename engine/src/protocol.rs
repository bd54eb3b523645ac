//! Replication protocol types shared by clients and the authoritative store.
//!
//! Pull is cursor based: the remote keeps a monotonically increasing change
//! sequence and every stored document carries the sequence of its latest
//! write. Push is optimistic: each document names the remote `_modified` it
//! was based on, and the remote accepts it only if that is still current.

use crate::{ClinicalRecord, CollectionName, Modified, OwnerId, RecordId};
use serde::{Deserialize, Serialize};

/// Default pull batch size.
pub const DEFAULT_PULL_BATCH: usize = 100;
/// Default push batch size.
pub const DEFAULT_PUSH_BATCH: usize = 50;

/// Who is replicating what, against which remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationIdentity {
    pub endpoint: String,
    pub collection: CollectionName,
    pub owner_id: OwnerId,
}

impl ReplicationIdentity {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<CollectionName>,
        owner_id: impl Into<OwnerId>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            collection: collection.into(),
            owner_id: owner_id.into(),
        }
    }

    /// Canonical key checkpoints are stored under.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.endpoint, self.collection, self.owner_id)
    }
}

impl std::fmt::Display for ReplicationIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.endpoint, self.collection, self.owner_id)
    }
}

/// Position in the remote's change sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub u64);

/// One page of remote changes.
///
/// Documents are raw JSON so that a malformed one can be skipped without
/// failing the whole batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullBatch {
    pub documents: Vec<serde_json::Value>,
    /// Sequence of the last document in the batch; `None` when empty
    pub checkpoint: Option<Checkpoint>,
    pub has_more: bool,
}

/// Query parameters of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    pub owner: OwnerId,
    #[serde(default)]
    pub since: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// A document offered to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushDocument {
    pub record: ClinicalRecord,
    /// Remote `_modified` this version was based on; `None` for new records
    pub base_modified: Option<Modified>,
    /// Overwrite regardless of the remote's current version
    #[serde(default)]
    pub force: bool,
}

/// Body of a push request.
///
/// Documents are raw JSON so that the remote can reject one without failing
/// the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub owner_id: OwnerId,
    pub documents: Vec<serde_json::Value>,
}

/// Why a pushed document was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The remote moved past `baseModified`
    Conflict,
    /// The document failed validation
    Invalid,
}

/// A pushed document the remote refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedDocument {
    /// Empty when the document was too malformed to carry an id
    pub id: RecordId,
    pub reason: RejectReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The remote's current version, for conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ClinicalRecord>,
}

/// Outcome of a push request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub accepted: Vec<RecordId>,
    pub rejected: Vec<RejectedDocument>,
}

/// Remote-side verdict for one pushed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushDecision {
    /// Store the document.
    Accept,
    /// Same document already stored; acknowledge without writing.
    AlreadyApplied,
    /// Refuse; the stored version is returned to the client.
    Reject,
}

/// Decide whether the remote takes a pushed document.
///
/// A push is accepted when nothing is stored yet, when it is forced, or when
/// its base is the stored `_modified`. Resubmitting the stored document is
/// acknowledged so retries are idempotent.
pub fn decide_push(stored: Option<&ClinicalRecord>, document: &PushDocument) -> PushDecision {
    let Some(stored) = stored else {
        return PushDecision::Accept;
    };
    if stored.modified == document.record.modified && stored.same_content(&document.record) {
        return PushDecision::AlreadyApplied;
    }
    if document.force || document.base_modified == Some(stored.modified) {
        return PushDecision::Accept;
    }
    PushDecision::Reject
}

/// Notifications on the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    /// New changes are available for pull.
    ChangesAvailable {
        collection: CollectionName,
        checkpoint: Checkpoint,
    },
    /// Reply to a client ping.
    Pong,
    /// Protocol error.
    Error { message: String },
}

/// Client messages on the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveRequest {
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(modified: Modified, labs: &str) -> ClinicalRecord {
        let mut r = ClinicalRecord::new("p1", "u1", "Bed 1", 0, 0);
        r.modified = modified;
        r.labs = labs.into();
        r
    }

    fn push(record: ClinicalRecord, base: Option<Modified>, force: bool) -> PushDocument {
        PushDocument {
            record,
            base_modified: base,
            force,
        }
    }

    #[test]
    fn identity_key() {
        let id = ReplicationIdentity::new("https://remote", "records", "u1");
        assert_eq!(id.key(), "https://remote|records|u1");
    }

    #[test]
    fn push_new_document_accepted() {
        let doc = push(record(5, "a"), None, false);
        assert_eq!(decide_push(None, &doc), PushDecision::Accept);
    }

    #[test]
    fn push_on_current_base_accepted() {
        let stored = record(5, "a");
        let doc = push(record(9, "b"), Some(5), false);
        assert_eq!(decide_push(Some(&stored), &doc), PushDecision::Accept);
    }

    #[test]
    fn push_on_stale_base_rejected() {
        let stored = record(7, "theirs");
        let doc = push(record(9, "mine"), Some(5), false);
        assert_eq!(decide_push(Some(&stored), &doc), PushDecision::Reject);
    }

    #[test]
    fn forced_push_accepted() {
        let stored = record(7, "theirs");
        let doc = push(record(9, "mine"), Some(5), true);
        assert_eq!(decide_push(Some(&stored), &doc), PushDecision::Accept);
    }

    #[test]
    fn resubmission_is_idempotent() {
        let stored = record(9, "mine");
        let doc = push(record(9, "mine"), Some(5), false);
        assert_eq!(decide_push(Some(&stored), &doc), PushDecision::AlreadyApplied);
    }

    #[test]
    fn pull_batch_wire_format() {
        let batch = PullBatch {
            documents: vec![json!({"id": "p1"})],
            checkpoint: Some(Checkpoint(42)),
            has_more: true,
        };
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["checkpoint"], json!(42));
        assert_eq!(value["hasMore"], json!(true));
    }

    #[test]
    fn live_message_wire_format() {
        let msg = LiveMessage::ChangesAvailable {
            collection: "records".into(),
            checkpoint: Checkpoint(3),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"changes_available\""));
        let parsed: LiveMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn rejected_document_omits_empty_fields() {
        let rejected = RejectedDocument {
            id: "p1".into(),
            reason: RejectReason::Invalid,
            message: None,
            current: None,
        };
        let value = serde_json::to_value(&rejected).unwrap();
        assert_eq!(value, json!({"id": "p1", "reason": "invalid"}));
    }
}
