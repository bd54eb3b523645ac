//! Record queries.
//!
//! A [`RecordQuery`] is a reusable description of which records to return;
//! executing it always yields records ordered by (`order`, `id`), so running
//! the same query twice over the same data gives the same sequence.

use crate::{ClinicalRecord, OwnerId};
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&ClinicalRecord) -> bool + Send + Sync>;

/// Filter over clinical records.
#[derive(Clone, Default)]
pub struct RecordQuery {
    owner: Option<OwnerId>,
    include_deleted: bool,
    predicate: Option<Predicate>,
}

impl RecordQuery {
    /// Match every live record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match live records of one owner.
    pub fn for_owner(owner: impl Into<OwnerId>) -> Self {
        Self::new().owner(owner)
    }

    pub fn owner(mut self, owner: impl Into<OwnerId>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Include tombstones in results.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Add an arbitrary predicate.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ClinicalRecord) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn owner_filter(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn includes_deleted(&self) -> bool {
        self.include_deleted
    }

    pub fn matches(&self, record: &ClinicalRecord) -> bool {
        if record.deleted && !self.include_deleted {
            return false;
        }
        if let Some(owner) = &self.owner {
            if &record.owner_id != owner {
                return false;
            }
        }
        self.predicate.as_ref().map_or(true, |p| p(record))
    }

    /// Apply the query to a set of records.
    pub fn run<'a>(&self, records: impl IntoIterator<Item = &'a ClinicalRecord>) -> Vec<ClinicalRecord> {
        let mut out: Vec<ClinicalRecord> = records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

impl std::fmt::Debug for RecordQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordQuery")
            .field("owner", &self.owner)
            .field("include_deleted", &self.include_deleted)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
