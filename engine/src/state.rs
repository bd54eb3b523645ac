//! Synchronization status and the events that drive it.
//!
//! Every component reports progress as a [`SyncEvent`]; a single consumer
//! folds them into one [`SyncState`] snapshot with [`SyncState::apply`].

use crate::{ConflictRecord, Timestamp};
use serde::{Deserialize, Serialize};

/// Error text set while connectivity is down.
pub const OFFLINE_MESSAGE: &str = "offline: local changes are kept and will sync when connectivity returns";

/// Snapshot of replication status, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub online: bool,
    pub syncing: bool,
    /// Number of records with unacknowledged local writes
    pub pending_count: u64,
    pub last_synced_at: Option<Timestamp>,
    pub error: Option<String>,
    /// Open conflicts awaiting resolution
    pub conflicts: Vec<ConflictRecord>,
    /// Documents pulled or pushed since the process started
    pub documents_processed: u64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            online: true,
            syncing: false,
            pending_count: 0,
            last_synced_at: None,
            error: None,
            conflicts: Vec::new(),
            documents_processed: 0,
        }
    }
}

/// Internal status events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A replication cycle began.
    SyncStarted,
    /// A replication cycle ended, successfully or not.
    SyncStopped,
    /// A pulled batch of `n` documents was applied.
    BatchPulled(usize),
    /// `n` pushed documents were acknowledged.
    BatchPushed(usize),
    /// A cycle completed without error.
    Synced(Timestamp),
    /// Replication failed; the message is shown to the user.
    Error(String),
    /// Current number of dirty records.
    PendingChanged(u64),
    /// Current open conflicts.
    ConflictsChanged(Vec<ConflictRecord>),
    /// Connectivity flipped.
    ConnectivityChanged(bool),
    /// The replication run was torn down.
    ReplicationStopped,
}

impl SyncState {
    /// Fold one event into the snapshot.
    pub fn apply(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::SyncStarted => self.syncing = true,
            SyncEvent::SyncStopped | SyncEvent::ReplicationStopped => self.syncing = false,
            SyncEvent::BatchPulled(n) | SyncEvent::BatchPushed(n) => {
                self.documents_processed += n as u64;
            }
            SyncEvent::Synced(at) => {
                self.last_synced_at = Some(at);
                self.error = None;
            }
            SyncEvent::Error(message) => self.error = Some(message),
            SyncEvent::PendingChanged(count) => self.pending_count = count,
            SyncEvent::ConflictsChanged(conflicts) => self.conflicts = conflicts,
            SyncEvent::ConnectivityChanged(true) => {
                self.online = true;
                self.error = None;
            }
            SyncEvent::ConnectivityChanged(false) => {
                self.online = false;
                self.error = Some(OFFLINE_MESSAGE.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_events_toggle_syncing() {
        let mut state = SyncState::default();
        state.apply(SyncEvent::SyncStarted);
        assert!(state.syncing);
        state.apply(SyncEvent::BatchPulled(3));
        state.apply(SyncEvent::BatchPushed(2));
        state.apply(SyncEvent::SyncStopped);
        assert!(!state.syncing);
        assert_eq!(state.documents_processed, 5);
    }

    #[test]
    fn offline_keeps_pending_count() {
        let mut state = SyncState::default();
        state.apply(SyncEvent::PendingChanged(3));
        state.apply(SyncEvent::ConnectivityChanged(false));
        assert!(!state.online);
        assert_eq!(state.pending_count, 3);
        assert_eq!(state.error.as_deref(), Some(OFFLINE_MESSAGE));
    }

    #[test]
    fn online_clears_error() {
        let mut state = SyncState::default();
        state.apply(SyncEvent::Error("connection refused".into()));
        state.apply(SyncEvent::ConnectivityChanged(true));
        assert!(state.online);
        assert_eq!(state.error, None);
    }

    #[test]
    fn successful_sync_clears_error() {
        let mut state = SyncState::default();
        state.apply(SyncEvent::Error("timeout".into()));
        state.apply(SyncEvent::Synced(1234));
        assert_eq!(state.error, None);
        assert_eq!(state.last_synced_at, Some(1234));
    }

    #[test]
    fn serialization_format() {
        let json = serde_json::to_value(SyncState::default()).unwrap();
        assert_eq!(json["pendingCount"], 0);
        assert_eq!(json["lastSyncedAt"], serde_json::Value::Null);
    }
}
