//! Conflict Resolver.
//!
//! Detection happens in the store while replication applies pulls and push
//! rejections. This module settles conflicts: the store commits the
//! resolution in one transaction, then the mirror is reloaded and, for
//! client-wins, a push is requested.

use chartsync_engine::{ClinicalRecord, ConflictRecord, FieldDiff, ResolutionPolicy, SyncEvent};
use std::sync::Arc;
use tracing::info;

use crate::coordinator::MutationCoordinator;
use crate::error::Result;
use crate::publisher::EventSender;
use crate::replication::ReplicationEngine;
use crate::store::LocalStore;

pub struct ConflictResolver {
    store: LocalStore,
    coordinator: Arc<MutationCoordinator>,
    engine: Option<Arc<ReplicationEngine>>,
    events: EventSender,
    actor_id: String,
}

impl ConflictResolver {
    pub fn new(
        store: LocalStore,
        coordinator: Arc<MutationCoordinator>,
        engine: Option<Arc<ReplicationEngine>>,
        events: EventSender,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            coordinator,
            engine,
            events,
            actor_id: actor_id.into(),
        }
    }

    /// Settle an open conflict. Returns the record as it now stands.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        policy: ResolutionPolicy,
    ) -> Result<ClinicalRecord> {
        // queued local writes must land before the resolution reads the record
        self.coordinator.flush().await;

        let resolution = self
            .store
            .resolve_conflict(conflict_id, policy, &self.actor_id)
            .await?;
        let record_id = resolution.record.id.clone();
        self.coordinator.reload(&record_id).await?;

        self.events
            .send(SyncEvent::ConflictsChanged(self.store.open_conflicts().await?));
        self.events
            .send(SyncEvent::PendingChanged(self.store.pending_count().await?));

        if resolution.pending.is_some() {
            if let Some(engine) = &self.engine {
                if engine.is_running().await {
                    info!(%record_id, "client-wins resolution, requesting push");
                    engine.request_cycle().await;
                }
            }
        }
        self.events.barrier().await;
        Ok(resolution.record)
    }

    /// Field-by-field comparison for review.
    pub async fn diff(&self, conflict_id: &str) -> Result<Vec<FieldDiff>> {
        Ok(self.store.conflict(conflict_id).await?.diff())
    }

    pub async fn open_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.store.open_conflicts().await
    }
}
