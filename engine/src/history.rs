//! Field-level audit history.

use crate::{ActorId, RecordId, Timestamp};
use serde::{Deserialize, Serialize};

/// Field name used for conflict-resolution audit entries.
pub const RESOLUTION_FIELD: &str = "_conflict";

/// One immutable audit entry: a field changed from `old_value` to `new_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldHistoryEntry {
    pub record_id: RecordId,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
    pub actor_id: ActorId,
    pub at: Timestamp,
}

impl FieldHistoryEntry {
    pub fn new(
        record_id: impl Into<RecordId>,
        field: impl Into<String>,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
        actor_id: impl Into<ActorId>,
        at: Timestamp,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            field: field.into(),
            old_value: old_value.into(),
            new_value: new_value.into(),
            actor_id: actor_id.into(),
            at,
        }
    }

    pub fn is_resolution(&self) -> bool {
        self.field == RESOLUTION_FIELD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_format() {
        let entry = FieldHistoryEntry::new("p1", "labs", "", "Na 140", "nurse-1", 10);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["recordId"], "p1");
        assert_eq!(json["oldValue"], "");
        assert_eq!(json["newValue"], "Na 140");
        assert!(!entry.is_resolution());
    }
}
