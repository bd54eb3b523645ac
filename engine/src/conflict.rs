//! Conflict detection and resolution planning.
//!
//! Replication hands every pulled document to [`decide_pull`] together with
//! the local version and its outbound state. A conflict exists when the
//! remote moved past the version the local edits were based on while those
//! edits are still unpushed. Resolution is whole-document:
//! [`ResolutionPolicy::ServerWins`] or [`ResolutionPolicy::ClientWins`].
//!
//! All functions here are pure; callers persist the outcome atomically.

use crate::{
    history::{FieldHistoryEntry, RESOLUTION_FIELD},
    ActorId, ClinicalRecord, CollectionName, ConflictId, Error, Modified, RecordId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Outbound state of a dirty record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    /// `_modified` of the last remote version this record was based on
    pub base_modified: Option<Modified>,
    /// Push regardless of the remote's current counter
    pub force: bool,
}

/// What to do with one pulled document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    /// Upsert the remote version and mark it clean.
    Apply,
    /// Nothing to do: stale copy, or a tombstone for a record never seen.
    Ignore,
    /// Local edits are newer than a remote that has not moved; push later.
    KeepLocal,
    /// Local edits already match the remote; adopt it and clear dirty.
    Converged,
    /// Both sides changed; open a conflict.
    Conflict,
}

/// Decide how a pulled document affects the local replica.
pub fn decide_pull(
    local: Option<&ClinicalRecord>,
    pending: Option<&PendingWrite>,
    remote: &ClinicalRecord,
) -> PullDecision {
    let Some(local) = local else {
        return if remote.deleted {
            PullDecision::Ignore
        } else {
            PullDecision::Apply
        };
    };

    match pending {
        None if remote.modified >= local.modified => PullDecision::Apply,
        None => PullDecision::Ignore,
        Some(_) if local.same_content(remote) => PullDecision::Converged,
        Some(p) if p.base_modified.is_some_and(|base| remote.modified <= base) => {
            PullDecision::KeepLocal
        }
        Some(_) => PullDecision::Conflict,
    }
}

/// Lifecycle of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Open => "open",
            ConflictStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ConflictStatus::Open),
            "resolved" => Some(ConflictStatus::Resolved),
            _ => None,
        }
    }
}

/// A divergence between an unpushed local version and a newer remote one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    /// Collection (table) the record belongs to
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub local: ClinicalRecord,
    pub remote: ClinicalRecord,
    pub detected_at: Timestamp,
    pub status: ConflictStatus,
}

impl ConflictRecord {
    pub fn new(
        id: impl Into<ConflictId>,
        collection: impl Into<CollectionName>,
        local: ClinicalRecord,
        remote: ClinicalRecord,
        detected_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            record_id: local.id.clone(),
            local,
            remote,
            detected_at,
            status: ConflictStatus::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ConflictStatus::Open
    }

    /// Field-by-field comparison of the two versions.
    pub fn diff(&self) -> Vec<FieldDiff> {
        diff(&self.local, &self.remote)
    }

    /// Plan a resolution against the record's current local state.
    ///
    /// `current_local` may have moved on since detection; client-wins keeps
    /// whatever the local replica holds now, server-wins takes the remote
    /// snapshot.
    pub fn resolve(
        &self,
        current_local: &ClinicalRecord,
        policy: ResolutionPolicy,
        actor_id: impl Into<ActorId>,
        now: Timestamp,
    ) -> Resolution {
        let (record, pending) = match policy {
            ResolutionPolicy::ServerWins => (self.remote.clone(), None),
            ResolutionPolicy::ClientWins => {
                let mut record = current_local.clone();
                record.modified = current_local
                    .modified
                    .max(self.remote.modified)
                    .saturating_add(1)
                    .max(now);
                let pending = PendingWrite {
                    base_modified: Some(self.remote.modified),
                    force: true,
                };
                (record, Some(pending))
            }
        };

        let history = FieldHistoryEntry::new(
            self.record_id.clone(),
            RESOLUTION_FIELD,
            ConflictStatus::Open.as_str(),
            policy.to_string(),
            actor_id,
            now,
        );

        Resolution {
            record,
            pending,
            remote_modified: self.remote.modified,
            history,
        }
    }
}

/// How to settle a conflict.
///
/// Per-field three-way merge would be a further variant; it is not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ResolutionPolicy {
    /// Replace the local version with the remote snapshot.
    ServerWins,
    /// Keep the local version and force it onto the remote.
    ClientWins,
}

impl std::fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionPolicy::ServerWins => write!(f, "server-wins"),
            ResolutionPolicy::ClientWins => write!(f, "client-wins"),
        }
    }
}

impl std::str::FromStr for ResolutionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server-wins" => Ok(ResolutionPolicy::ServerWins),
            "client-wins" => Ok(ResolutionPolicy::ClientWins),
            other => Err(Error::InvalidPayload(format!(
                "unknown resolution policy: {other}"
            ))),
        }
    }
}

/// The planned outcome of a resolution, to be persisted in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Record content after resolution
    pub record: ClinicalRecord,
    /// Outbound state; `None` means clean
    pub pending: Option<PendingWrite>,
    /// Remote counter now known to the local replica
    pub remote_modified: Modified,
    /// Audit entry for the resolution
    pub history: FieldHistoryEntry,
}

/// One row of a local/remote comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    pub path: String,
    pub local: Option<serde_json::Value>,
    pub remote: Option<serde_json::Value>,
    pub differs: bool,
}

/// Symmetric comparison over the union of both versions' flattened keys.
pub fn diff(local: &ClinicalRecord, remote: &ClinicalRecord) -> Vec<FieldDiff> {
    let local = local.flatten();
    let remote = remote.flatten();
    let keys: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();

    keys.into_iter()
        .map(|key| {
            let l = local.get(key).cloned();
            let r = remote.get(key).cloned();
            FieldDiff {
                path: key.clone(),
                differs: l != r,
                local: l,
                remote: r,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(modified: Modified, summary: &str) -> ClinicalRecord {
        let mut r = ClinicalRecord::new("p1", "u1", "Bed 1", 0, 0);
        r.modified = modified;
        r.clinical_summary = summary.into();
        r
    }

    fn pending(base: Option<Modified>) -> PendingWrite {
        PendingWrite {
            base_modified: base,
            force: false,
        }
    }

    #[test]
    fn new_remote_record_is_applied() {
        let remote = record(5, "x");
        assert_eq!(decide_pull(None, None, &remote), PullDecision::Apply);
    }

    #[test]
    fn unknown_tombstone_is_ignored() {
        let mut remote = record(5, "x");
        remote.deleted = true;
        assert_eq!(decide_pull(None, None, &remote), PullDecision::Ignore);
    }

    #[test]
    fn clean_local_takes_newer_remote() {
        let local = record(5, "a");
        let remote = record(8, "b");
        assert_eq!(
            decide_pull(Some(&local), None, &remote),
            PullDecision::Apply
        );
    }

    #[test]
    fn clean_local_ignores_stale_remote() {
        let local = record(9, "a");
        let remote = record(8, "b");
        assert_eq!(
            decide_pull(Some(&local), None, &remote),
            PullDecision::Ignore
        );
    }

    #[test]
    fn dirty_local_with_unmoved_remote_is_kept() {
        let local = record(9, "edited");
        let remote = record(5, "orig");
        assert_eq!(
            decide_pull(Some(&local), Some(&pending(Some(5))), &remote),
            PullDecision::KeepLocal
        );
    }

    #[test]
    fn dirty_local_with_moved_remote_conflicts() {
        let local = record(9, "mine");
        let remote = record(7, "theirs");
        assert_eq!(
            decide_pull(Some(&local), Some(&pending(Some(5))), &remote),
            PullDecision::Conflict
        );
    }

    #[test]
    fn unpushed_create_colliding_with_remote_conflicts() {
        let local = record(9, "mine");
        let remote = record(3, "theirs");
        assert_eq!(
            decide_pull(Some(&local), Some(&pending(None)), &remote),
            PullDecision::Conflict
        );
    }

    #[test]
    fn identical_content_converges() {
        let local = record(9, "same");
        let remote = record(12, "same");
        assert_eq!(
            decide_pull(Some(&local), Some(&pending(Some(5))), &remote),
            PullDecision::Converged
        );
    }

    #[test]
    fn server_wins_takes_remote() {
        let conflict = ConflictRecord::new("c1", "records", record(9, "mine"), record(7, "theirs"), 100);
        let res = conflict.resolve(&conflict.local, ResolutionPolicy::ServerWins, "nurse", 200);
        assert_eq!(res.record, conflict.remote);
        assert_eq!(res.pending, None);
        assert_eq!(res.remote_modified, 7);
        assert!(res.history.is_resolution());
        assert_eq!(res.history.new_value, "server-wins");
    }

    #[test]
    fn client_wins_keeps_current_local_and_forces() {
        let conflict = ConflictRecord::new("c1", "records", record(9, "mine"), record(70, "theirs"), 100);
        let current = record(11, "mine, edited again");
        let res = conflict.resolve(&current, ResolutionPolicy::ClientWins, "nurse", 50);

        assert_eq!(res.record.clinical_summary, "mine, edited again");
        assert_eq!(res.record.modified, 71);
        assert_eq!(
            res.pending,
            Some(PendingWrite {
                base_modified: Some(70),
                force: true
            })
        );
    }

    #[test]
    fn diff_flags_differing_fields() {
        let mut local = record(9, "mine");
        local.systems.neuro = "GCS 15".into();
        let remote = record(7, "theirs");

        let rows = diff(&local, &remote);
        let changed: Vec<_> = rows.iter().filter(|d| d.differs).map(|d| d.path.as_str()).collect();
        assert_eq!(changed, vec!["_modified", "clinicalSummary", "systems.neuro"]);
        assert!(rows.iter().any(|d| d.path == "labs" && !d.differs));
    }

    #[test]
    fn diff_is_symmetric_over_key_union() {
        let mut local = record(1, "a");
        local.field_timestamps.insert("labs".into(), 10);
        let remote = record(1, "a");

        let rows = diff(&local, &remote);
        let stamp = rows.iter().find(|d| d.path == "fieldTimestamps.labs").unwrap();
        assert!(stamp.differs);
        assert!(stamp.remote.is_none());
    }

    #[test]
    fn policy_parse_and_display() {
        assert_eq!("client-wins".parse::<ResolutionPolicy>().unwrap(), ResolutionPolicy::ClientWins);
        assert!("merge".parse::<ResolutionPolicy>().is_err());
        assert_eq!(
            serde_json::to_string(&ResolutionPolicy::ServerWins).unwrap(),
            "\"server-wins\""
        );
    }
}
