//! Remote authoritative store adapters.
//!
//! Replication talks to the remote only through [`RemoteStore`]. The HTTP
//! adapter speaks to `chartsync-server`; the in-memory adapter applies the
//! same acceptance rules locally and can be switched offline.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use async_trait::async_trait;
use chartsync_engine::{Checkpoint, PullBatch, PushDocument, PushResult, ReplicationIdentity};
use tokio::sync::mpsc;

use crate::error::NetworkError;

/// Notification from the remote's live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSignal {
    /// Changes up to `checkpoint` are available for pull.
    ChangesAvailable { checkpoint: Checkpoint },
}

/// The remote side of replication.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Endpoint identifying this remote in checkpoints.
    fn endpoint(&self) -> &str;

    /// Changes for the identity's owner after `since`, at most `limit`.
    async fn pull(
        &self,
        identity: &ReplicationIdentity,
        since: Option<Checkpoint>,
        limit: usize,
    ) -> Result<PullBatch, NetworkError>;

    /// Offer documents; the remote upserts by id.
    async fn push(
        &self,
        identity: &ReplicationIdentity,
        documents: Vec<PushDocument>,
    ) -> Result<PushResult, NetworkError>;

    /// Open the live channel. The receiver closes when the channel drops.
    async fn watch(
        &self,
        identity: &ReplicationIdentity,
    ) -> Result<mpsc::Receiver<RemoteSignal>, NetworkError>;
}
