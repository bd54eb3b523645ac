//! # Chartsync Engine
//!
//! Deterministic core of a local-first clinical record sync system.
//!
//! This crate holds everything about synchronization that can be decided
//! without touching a disk or a socket: the record model and its schema,
//! field paths, the `_modified` clock, conflict detection and resolution
//! planning, the replication wire protocol and the sync-state reducer.
//! The `chartsync-client` crate drives it from an async runtime; the
//! `chartsync-server` crate uses the same rules on the authoritative side.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never sees files, network or clocks; callers pass
//!   instants in
//! - **Deterministic**: same inputs, same outputs
//! - **Shared rules**: push acceptance and pull decisions are the same
//!   functions on both ends
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`ClinicalRecord`] has a fixed field set: narrative fields, ten
//! clinical-system sub-fields, three medication buckets, per-field
//! timestamps, a `_modified` counter and a `_deleted` tombstone flag.
//! Fields are addressed with [`Field`] paths such as `systems.neuro`.
//!
//! ### Conflicts
//!
//! [`decide_pull`] classifies every pulled document against the local
//! version and its [`PendingWrite`] state. Divergence produces a
//! [`ConflictRecord`], settled by a [`ResolutionPolicy`].
//!
//! ### Sync state
//!
//! Progress is reported as [`SyncEvent`]s and folded into a [`SyncState`].
//!
//! ## Quick Start
//!
//! ```rust
//! use chartsync_engine::{ClinicalRecord, Field, FieldValue, ModifiedClock};
//!
//! let mut clock = ModifiedClock::new();
//! let mut record = ClinicalRecord::new("p1", "nurse-1", "Bed 4", 0, 1_000);
//!
//! let field = Field::parse("systems.neuro").unwrap();
//! let old = record.set(field, FieldValue::from("GCS 14")).unwrap();
//! record.touch(field, 1_500);
//! record.modified = clock.next(1_500, record.modified);
//!
//! assert_eq!(old, FieldValue::from(""));
//! assert_eq!(record.field_timestamps["systems.neuro"], 1_500);
//! ```

pub mod clock;
pub mod conflict;
pub mod error;
pub mod field;
pub mod history;
pub mod protocol;
pub mod query;
pub mod record;
pub mod schema;
pub mod state;

// Re-export main types at crate root
pub use clock::ModifiedClock;
pub use conflict::{
    decide_pull, diff, ConflictRecord, ConflictStatus, FieldDiff, PendingWrite, PullDecision,
    Resolution, ResolutionPolicy,
};
pub use error::{Error, FieldViolation, ValidationError, Violation};
pub use field::{Field, FieldKind, FieldValue, MedicationBucket, SystemField};
pub use history::FieldHistoryEntry;
pub use protocol::{
    decide_push, Checkpoint, LiveMessage, PullBatch, PushDecision, PushDocument, PushResult,
    RejectReason, RejectedDocument, ReplicationIdentity,
};
pub use query::RecordQuery;
pub use record::{ClinicalRecord, ClinicalSystems, Medications, Origin};
pub use schema::{FieldDef, FieldType, RecordSchema};
pub use state::{SyncEvent, SyncState};

/// Type aliases for clarity
pub type RecordId = String;
pub type OwnerId = String;
pub type ActorId = String;
pub type ConflictId = String;
pub type CollectionName = String;
pub type Timestamp = u64;
pub type Modified = u64;
pub type SchemaVersion = u32;
