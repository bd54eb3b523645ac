//! # Chartsync Client
//!
//! Local-first runtime for clinical records. Edits land in an in-process
//! mirror immediately and in a local SQLite replica shortly after; a
//! replication engine reconciles the replica with the remote authoritative
//! store whenever it is reachable.
//!
//! ```text
//!   apply() ──► MutationCoordinator ──► LocalStore ◄──► ReplicationEngine ◄──► RemoteStore
//!                  (mirror)              (SQLite)             │
//!                                                             ▼
//!   subscribe() ◄──────────────── SyncStatePublisher ◄──── SyncEvent
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chartsync_client::{ClientConfig, SyncClient};
//! use chartsync_engine::ClinicalRecord;
//!
//! # async fn run() -> chartsync_client::Result<()> {
//! let client = SyncClient::open(ClientConfig::from_env()?).await?;
//! let _sub = client
//!     .subscribe(|state| println!("pending: {}", state.pending_count))
//!     .await;
//!
//! client.create(ClinicalRecord::new("p1", "nurse-1", "Bed 4", 0, 0))?;
//! client.apply("p1", "systems.neuro", "GCS 15")?;
//! client.start("nurse-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod publisher;
pub mod remote;
pub mod replication;
pub mod resolver;
pub mod store;

pub use client::SyncClient;
pub use config::{ClientConfig, ConfigError, RemoteSettings};
pub use coordinator::MutationCoordinator;
pub use error::{ClientError, NetworkError, Result};
pub use publisher::{EventSender, Subscription, SyncStatePublisher};
pub use remote::{HttpRemote, MemoryRemote, RemoteSignal, RemoteStore};
pub use replication::{CycleMode, CycleReport, ReplicationEngine, ReplicationSettings};
pub use resolver::ConflictResolver;
pub use store::{LocalStore, LocalWrite, PullOutcome, RecordChange};

use chartsync_engine::Timestamp;

/// Wall clock in milliseconds since the epoch.
pub(crate) fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
