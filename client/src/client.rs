//! The public client facade.
//!
//! [`SyncClient`] wires the local store, the mutation coordinator, the
//! replication engine, the conflict resolver and the state publisher
//! together. Each client owns its own engine; nothing is global.

use chartsync_engine::{
    ClinicalRecord, ConflictRecord, FieldDiff, FieldHistoryEntry, FieldValue, RecordId,
    RecordQuery, ReplicationIdentity, ResolutionPolicy, SyncEvent, SyncState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConfigError};
use crate::coordinator::MutationCoordinator;
use crate::error::{ClientError, Result};
use crate::publisher::{Subscription, SyncStatePublisher};
use crate::remote::{HttpRemote, RemoteStore};
use crate::replication::{CycleReport, ReplicationEngine, ReplicationSettings};
use crate::resolver::ConflictResolver;
use crate::store::LocalStore;

/// Local-first clinical record client.
pub struct SyncClient {
    store: LocalStore,
    publisher: SyncStatePublisher,
    coordinator: Arc<MutationCoordinator>,
    engine: Option<Arc<ReplicationEngine>>,
    resolver: ConflictResolver,
    /// Why replication cannot start, when no remote is configured
    config_error: Option<ConfigError>,
    config_error_reported: AtomicBool,
}

impl SyncClient {
    /// Open the local store and, if configured, the HTTP remote.
    pub async fn open(config: ClientConfig) -> Result<Self> {
        match config.remote() {
            Ok(settings) => {
                let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemote::new(settings)?);
                Self::build(config, Some(remote), None).await
            }
            Err(e) => {
                debug!(error = %e, "no remote configured, running local only");
                Self::build(config, None, Some(e)).await
            }
        }
    }

    /// Open with an explicit remote.
    pub async fn with_remote(config: ClientConfig, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        Self::build(config, Some(remote), None).await
    }

    async fn build(
        config: ClientConfig,
        remote: Option<Arc<dyn RemoteStore>>,
        config_error: Option<ConfigError>,
    ) -> Result<Self> {
        let store =
            LocalStore::open(&config.database_url, &config.collection, config.change_window)
                .await?;
        let publisher = SyncStatePublisher::start();
        let events = publisher.events();

        let coordinator = Arc::new(
            MutationCoordinator::open(
                store.clone(),
                events.clone(),
                config.actor_id.clone(),
                config.history_capacity,
            )
            .await?,
        );
        let engine = remote.map(|remote| {
            Arc::new(ReplicationEngine::new(
                store.clone(),
                remote,
                events.clone(),
                ReplicationSettings::from(&config),
            ))
        });
        let resolver = ConflictResolver::new(
            store.clone(),
            coordinator.clone(),
            engine.clone(),
            events.clone(),
            config.actor_id.clone(),
        );

        events.send(SyncEvent::PendingChanged(store.pending_count().await?));
        events.send(SyncEvent::ConflictsChanged(store.open_conflicts().await?));
        events.barrier().await;
        info!(collection = %config.collection, remote = engine.is_some(), "client opened");

        Ok(Self {
            store,
            publisher,
            coordinator,
            engine,
            resolver,
            config_error,
            config_error_reported: AtomicBool::new(false),
        })
    }

    // ---- Lifecycle ----

    /// Start replicating for `owner_id`.
    ///
    /// Without a configured remote this reports the configuration problem
    /// once through the sync state and returns; the client keeps working
    /// locally.
    pub async fn start(&self, owner_id: &str) -> Result<()> {
        let Some(engine) = &self.engine else {
            if !self.config_error_reported.swap(true, Ordering::SeqCst) {
                let reason = self
                    .config_error
                    .as_ref()
                    .map_or_else(|| "no remote configured".to_string(), |e| e.to_string());
                warn!(%reason, "replication not started");
                let events = self.publisher.events();
                events.send(SyncEvent::Error(format!("replication not started: {reason}")));
                events.barrier().await;
            }
            return Ok(());
        };
        engine.start(owner_id).await?;
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(engine) = &self.engine {
            engine.stop().await;
        }
        self.flush().await;
    }

    /// Discard the checkpoint, replicate from the beginning and refresh the
    /// mirror. Waits for the cycle.
    pub async fn force_resync(&self) -> Result<CycleReport> {
        let engine = self.engine()?;
        self.coordinator.flush().await;
        let report = engine.force_resync().await?;
        self.coordinator.refresh_all().await?;
        Ok(report)
    }

    /// Run a full cycle now and refresh the mirror.
    pub async fn sync_now(&self) -> Result<CycleReport> {
        let engine = self.engine()?;
        self.coordinator.flush().await;
        let report = engine.sync_now().await?;
        self.coordinator.refresh_all().await?;
        Ok(report)
    }

    /// Connectivity signal from the platform.
    ///
    /// Going online clears the error and forces a resync of a running
    /// replication; going offline keeps pending writes for later.
    pub async fn set_online(&self, online: bool) {
        let events = self.publisher.events();
        if let Some(engine) = &self.engine {
            engine.set_online(online);
        }
        events.send(SyncEvent::ConnectivityChanged(online));
        events.barrier().await;
        info!(online, "connectivity changed");

        if !online {
            return;
        }
        if let Some(engine) = &self.engine {
            if engine.is_running().await {
                if let Err(e) = self.force_resync().await {
                    // already reported through the sync state
                    debug!(error = %e, "resync after reconnect failed");
                }
            }
        }
    }

    pub async fn identity(&self) -> Option<ReplicationIdentity> {
        match &self.engine {
            Some(engine) => engine.identity().await,
            None => None,
        }
    }

    fn engine(&self) -> Result<&Arc<ReplicationEngine>> {
        match (&self.engine, &self.config_error) {
            (Some(engine), _) => Ok(engine),
            (None, Some(e)) => Err(ClientError::Configuration(e.clone())),
            (None, None) => Err(ClientError::NotStarted),
        }
    }

    // ---- State ----

    /// Register a state handler; it sees the current snapshot before this
    /// returns.
    pub async fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.publisher.subscribe(handler).await
    }

    pub fn get_state(&self) -> SyncState {
        self.publisher.state()
    }

    // ---- Records ----

    pub fn apply(
        &self,
        record_id: &str,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<ClinicalRecord> {
        self.coordinator.apply(record_id, field, value)
    }

    pub fn create(&self, record: ClinicalRecord) -> Result<ClinicalRecord> {
        self.coordinator.create(record)
    }

    pub fn remove(&self, record_id: &str) -> Result<ClinicalRecord> {
        self.coordinator.remove(record_id)
    }

    pub fn record(&self, record_id: &str) -> Option<ClinicalRecord> {
        self.coordinator.get(record_id)
    }

    /// Live records of an owner, ordered by (`order`, `id`).
    pub fn records(&self, owner_id: &str) -> Vec<ClinicalRecord> {
        self.coordinator.records(&RecordQuery::for_owner(owner_id))
    }

    /// Mirror updates.
    pub fn watch_records(&self) -> broadcast::Receiver<ClinicalRecord> {
        self.coordinator.subscribe()
    }

    /// Field history of a record, optionally for one field.
    pub async fn history(
        &self,
        record_id: &str,
        field: Option<&str>,
    ) -> Result<Vec<FieldHistoryEntry>> {
        self.coordinator.flush().await;
        self.store.history(record_id, field).await
    }

    /// Wait for queued local writes and their state events.
    pub async fn flush(&self) {
        self.coordinator.flush().await;
        self.publisher.events().barrier().await;
    }

    pub fn dropped_history(&self) -> u64 {
        self.coordinator.dropped_history()
    }

    /// Delete tombstones the remote has acknowledged.
    pub async fn purge_tombstones(&self) -> Result<Vec<RecordId>> {
        self.coordinator.flush().await;
        self.store.purge_tombstones().await
    }

    // ---- Conflicts ----

    pub async fn resolve(
        &self,
        conflict_id: &str,
        policy: ResolutionPolicy,
    ) -> Result<ClinicalRecord> {
        self.resolver.resolve(conflict_id, policy).await
    }

    pub async fn diff(&self, conflict_id: &str) -> Result<Vec<FieldDiff>> {
        self.resolver.diff(conflict_id).await
    }

    pub async fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.resolver.open_conflicts().await
    }

    /// The underlying local store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }
}
