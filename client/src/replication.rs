//! Replication Engine.
//!
//! One engine replicates one local store against one remote. A run is bound
//! to a [`ReplicationIdentity`] and owned by a worker task that executes
//! cycles on request, on a fixed interval and on live notifications. A cycle
//! pulls everything past the checkpoint, then pushes dirty records, then
//! purges acknowledged tombstones. Failures end the cycle and are reported
//! through the sync state; the next cycle retries.

use chartsync_engine::{Modified, RecordId, ReplicationIdentity, SyncEvent};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, NetworkError, Result};
use crate::now_millis;
use crate::publisher::EventSender;
use crate::remote::{RemoteSignal, RemoteStore};
use crate::store::LocalStore;

/// Queued cycle requests per run.
const COMMAND_BUFFER: usize = 32;

/// Tunables of the replication loop.
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub collection: String,
    pub pull_batch_size: usize,
    pub push_batch_size: usize,
    pub live: bool,
    pub interval: Duration,
}

impl From<&ClientConfig> for ReplicationSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            collection: config.collection.clone(),
            pull_batch_size: config.pull_batch_size.max(1),
            push_batch_size: config.push_batch_size.max(1),
            live: config.live,
            interval: config.sync_interval.max(Duration::from_millis(10)),
        }
    }
}

/// What a cycle does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Pull, push, purge.
    Full,
    /// Pull only, after a live notification.
    PullOnly,
    /// Discard the checkpoint first, then a full cycle.
    Resync,
}

/// Result of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pulled: usize,
    pub pushed: usize,
    pub conflicts: usize,
    pub purged: usize,
}

struct Command {
    mode: CycleMode,
    reply: Option<oneshot::Sender<Result<CycleReport>>>,
}

struct ActiveRun {
    identity: ReplicationIdentity,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Shared by the engine handle and its worker.
struct Context {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    events: EventSender,
    settings: ReplicationSettings,
    online: AtomicBool,
}

/// Owns at most one replication run.
pub struct ReplicationEngine {
    ctx: Arc<Context>,
    active: Mutex<Option<ActiveRun>>,
}

impl ReplicationEngine {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        events: EventSender,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                store,
                remote,
                events,
                settings,
                online: AtomicBool::new(true),
            }),
            active: Mutex::new(None),
        }
    }

    pub fn identity_for(&self, owner_id: &str) -> ReplicationIdentity {
        ReplicationIdentity::new(
            self.ctx.remote.endpoint(),
            self.ctx.settings.collection.clone(),
            owner_id,
        )
    }

    /// Identity of the active run.
    pub async fn identity(&self) -> Option<ReplicationIdentity> {
        self.active.lock().await.as_ref().map(|run| run.identity.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Start replicating for `owner_id`. A run under another identity is
    /// stopped first; a run under the same identity is left alone.
    pub async fn start(&self, owner_id: &str) -> Result<ReplicationIdentity> {
        let identity = self.identity_for(owner_id);
        let mut active = self.active.lock().await;

        if let Some(run) = active.as_ref() {
            if run.identity == identity {
                return Ok(identity);
            }
            info!(from = %run.identity, to = %identity, "switching replication identity");
        }
        if let Some(run) = active.take() {
            self.shutdown(run).await;
        }

        let run = self.spawn(identity.clone());
        // initial cycle; nobody awaits it
        let _ = run
            .commands
            .try_send(Command {
                mode: CycleMode::Full,
                reply: None,
            });
        *active = Some(run);
        Ok(identity)
    }

    /// Stop the active run, cancelling in-flight work.
    pub async fn stop(&self) {
        let run = self.active.lock().await.take();
        if let Some(run) = run {
            self.shutdown(run).await;
        }
    }

    /// Restart the active run and replicate from the beginning.
    pub async fn force_resync(&self) -> Result<CycleReport> {
        let reply = {
            let mut active = self.active.lock().await;
            let run = active.take().ok_or(ClientError::NotStarted)?;
            let identity = run.identity.clone();
            self.shutdown(run).await;

            info!(%identity, "forcing resync");
            let run = self.spawn(identity);
            let (reply_tx, reply_rx) = oneshot::channel();
            run.commands
                .send(Command {
                    mode: CycleMode::Resync,
                    reply: Some(reply_tx),
                })
                .await
                .map_err(|_| ClientError::Cancelled)?;
            *active = Some(run);
            reply_rx
        };
        reply.await.map_err(|_| ClientError::Cancelled)?
    }

    /// Run a full cycle now and wait for it.
    pub async fn sync_now(&self) -> Result<CycleReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(Command {
            mode: CycleMode::Full,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx.await.map_err(|_| ClientError::Cancelled)?
    }

    /// Queue a full cycle without waiting for it.
    pub async fn request_cycle(&self) {
        let _ = self
            .submit(Command {
                mode: CycleMode::Full,
                reply: None,
            })
            .await;
    }

    /// While offline, cycles are skipped.
    pub fn set_online(&self, online: bool) {
        self.ctx.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.ctx.online.load(Ordering::SeqCst)
    }

    async fn submit(&self, command: Command) -> Result<()> {
        let commands = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|run| run.commands.clone())
            .ok_or(ClientError::NotStarted)?;
        commands.send(command).await.map_err(|_| ClientError::Cancelled)
    }

    fn spawn(&self, identity: ReplicationIdentity) -> ActiveRun {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            ctx: self.ctx.clone(),
            identity: identity.clone(),
        };
        let handle = tokio::spawn(worker.run(command_rx, shutdown_rx));
        info!(%identity, "replication started");

        ActiveRun {
            identity,
            commands,
            shutdown,
            handle,
        }
    }

    async fn shutdown(&self, run: ActiveRun) {
        let _ = run.shutdown.send(true);
        if let Err(e) = run.handle.await {
            warn!(error = %e, "replication worker ended abnormally");
        }
        self.ctx.events.send(SyncEvent::ReplicationStopped);
        info!(identity = %run.identity, "replication stopped");
    }
}

struct Worker {
    ctx: Arc<Context>,
    identity: ReplicationIdentity,
}

impl Worker {
    async fn run(
        self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.ctx.settings.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signals: Option<mpsc::Receiver<RemoteSignal>> = None;

        loop {
            if self.ctx.settings.live && signals.is_none() && self.is_online() {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    connected = self.ctx.remote.watch(&self.identity) => match connected {
                        Ok(rx) => signals = Some(rx),
                        Err(e) => debug!(error = %e, "live channel unavailable"),
                    },
                }
            }

            let (mode, reply) = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                command = commands.recv() => match command {
                    Some(Command { mode, reply }) => (mode, reply),
                    None => break,
                },
                signal = next_signal(&mut signals) => match signal {
                    Some(RemoteSignal::ChangesAvailable { checkpoint }) => {
                        debug!(checkpoint = checkpoint.0, "remote changes available");
                        (CycleMode::PullOnly, None)
                    }
                    None => {
                        debug!("live channel closed");
                        signals = None;
                        continue;
                    }
                },
                _ = ticker.tick() => (CycleMode::Full, None),
            };

            let outcome = tokio::select! {
                result = self.cycle(mode) => Some(result),
                _ = shutdown.changed() => None,
            };
            match outcome {
                Some(result) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                None => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(ClientError::Cancelled));
                    }
                    self.ctx.events.send(SyncEvent::SyncStopped);
                    break;
                }
            }
        }
        debug!(identity = %self.identity, "replication worker exiting");
    }

    fn is_online(&self) -> bool {
        self.ctx.online.load(Ordering::SeqCst)
    }

    /// One cycle, with its status events.
    async fn cycle(&self, mode: CycleMode) -> Result<CycleReport> {
        if !self.is_online() {
            debug!(?mode, "offline, cycle skipped");
            return Err(NetworkError::Offline.into());
        }

        let events = &self.ctx.events;
        events.send(SyncEvent::SyncStarted);
        let result = self.cycle_inner(mode).await;

        match &result {
            Ok(report) => {
                debug!(?mode, ?report, "cycle complete");
                if mode != CycleMode::PullOnly {
                    events.send(SyncEvent::Synced(now_millis()));
                }
            }
            Err(e) => {
                warn!(?mode, error = %e, "replication cycle failed");
                events.send(SyncEvent::Error(e.to_string()));
            }
        }
        self.report_store_state().await;
        events.send(SyncEvent::SyncStopped);
        events.barrier().await;
        result
    }

    async fn cycle_inner(&self, mode: CycleMode) -> Result<CycleReport> {
        let store = &self.ctx.store;
        if mode == CycleMode::Resync {
            store.reset_checkpoint(&self.identity).await?;
        }

        let mut report = CycleReport::default();
        self.pull(&mut report).await?;
        if mode != CycleMode::PullOnly {
            self.push(&mut report).await?;
            report.purged = store.purge_tombstones().await?.len();
        }
        Ok(report)
    }

    async fn pull(&self, report: &mut CycleReport) -> Result<()> {
        let store = &self.ctx.store;
        loop {
            let since = store.checkpoint(&self.identity).await?;
            let batch = self
                .ctx
                .remote
                .pull(&self.identity, since, self.ctx.settings.pull_batch_size)
                .await?;
            if batch.documents.is_empty() {
                break;
            }

            let outcome = store.apply_pull(&self.identity, &batch).await?;
            debug!(
                received = batch.documents.len(),
                applied = outcome.applied,
                skipped = outcome.skipped,
                "applied pulled batch"
            );
            report.pulled += outcome.applied;
            report.conflicts += outcome.conflicts.len();
            self.ctx
                .events
                .send(SyncEvent::BatchPulled(batch.documents.len()));
            if !outcome.conflicts.is_empty() {
                self.ctx
                    .events
                    .send(SyncEvent::ConflictsChanged(store.open_conflicts().await?));
            }

            if !batch.has_more || batch.checkpoint.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn push(&self, report: &mut CycleReport) -> Result<()> {
        let store = &self.ctx.store;
        let owner = &self.identity.owner_id;
        // a version that stays dirty after its push is not retried this cycle
        let mut attempted: HashSet<(RecordId, Modified)> = HashSet::new();

        loop {
            let batch: Vec<_> = store
                .outbound(owner, self.ctx.settings.push_batch_size)
                .await?
                .into_iter()
                .filter(|doc| attempted.insert((doc.record.id.clone(), doc.record.modified)))
                .collect();
            if batch.is_empty() {
                break;
            }

            let sent: Vec<(RecordId, Modified)> = batch
                .iter()
                .map(|doc| (doc.record.id.clone(), doc.record.modified))
                .collect();
            let result = self.ctx.remote.push(&self.identity, batch).await?;

            let acked: Vec<(RecordId, Modified)> = sent
                .into_iter()
                .filter(|(id, _)| result.accepted.contains(id))
                .collect();
            let cleared = store.acknowledge(&acked).await?;
            debug!(
                accepted = acked.len(),
                cleared,
                rejected = result.rejected.len(),
                "push acknowledged"
            );

            let mut opened = 0;
            for rejected in &result.rejected {
                if store.record_push_rejection(rejected).await?.is_some() {
                    opened += 1;
                }
            }

            report.pushed += acked.len();
            report.conflicts += opened;
            self.ctx.events.send(SyncEvent::BatchPushed(acked.len()));
            if opened > 0 {
                self.ctx
                    .events
                    .send(SyncEvent::ConflictsChanged(store.open_conflicts().await?));
            }
        }
        Ok(())
    }

    async fn report_store_state(&self) {
        let store = &self.ctx.store;
        match store.pending_count().await {
            Ok(count) => self.ctx.events.send(SyncEvent::PendingChanged(count)),
            Err(e) => warn!(error = %e, "could not count pending records"),
        }
        match store.open_conflicts().await {
            Ok(conflicts) => self.ctx.events.send(SyncEvent::ConflictsChanged(conflicts)),
            Err(e) => warn!(error = %e, "could not load open conflicts"),
        }
    }
}

async fn next_signal(signals: &mut Option<mpsc::Receiver<RemoteSignal>>) -> Option<RemoteSignal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
