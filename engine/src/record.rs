//! The clinical record document.

use crate::{
    error::Result,
    field::{Field, FieldValue, MedicationBucket, SystemField},
    schema::RecordSchema,
    Error, Modified, OwnerId, RecordId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a change to a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Written through the mutation coordinator on this device
    Local,
    /// Applied from a pulled remote batch
    Remote,
    /// Written by conflict resolution
    Resolution,
    /// Removed by tombstone purge
    Purge,
}

/// The ten clinical-system narratives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClinicalSystems {
    pub neuro: String,
    pub cardiovascular: String,
    pub respiratory: String,
    pub gastrointestinal: String,
    pub renal: String,
    pub endocrine: String,
    pub hematology: String,
    pub infectious_disease: String,
    pub skin: String,
    pub lines: String,
}

impl ClinicalSystems {
    pub fn get(&self, field: SystemField) -> &str {
        match field {
            SystemField::Neuro => &self.neuro,
            SystemField::Cardiovascular => &self.cardiovascular,
            SystemField::Respiratory => &self.respiratory,
            SystemField::Gastrointestinal => &self.gastrointestinal,
            SystemField::Renal => &self.renal,
            SystemField::Endocrine => &self.endocrine,
            SystemField::Hematology => &self.hematology,
            SystemField::InfectiousDisease => &self.infectious_disease,
            SystemField::Skin => &self.skin,
            SystemField::Lines => &self.lines,
        }
    }

    pub fn get_mut(&mut self, field: SystemField) -> &mut String {
        match field {
            SystemField::Neuro => &mut self.neuro,
            SystemField::Cardiovascular => &mut self.cardiovascular,
            SystemField::Respiratory => &mut self.respiratory,
            SystemField::Gastrointestinal => &mut self.gastrointestinal,
            SystemField::Renal => &mut self.renal,
            SystemField::Endocrine => &mut self.endocrine,
            SystemField::Hematology => &mut self.hematology,
            SystemField::InfectiousDisease => &mut self.infectious_disease,
            SystemField::Skin => &mut self.skin,
            SystemField::Lines => &mut self.lines,
        }
    }
}

/// Medication buckets. Each bucket holds its list serialized as text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Medications {
    pub infusions: String,
    pub scheduled: String,
    pub prn: String,
}

impl Medications {
    pub fn get(&self, bucket: MedicationBucket) -> &str {
        match bucket {
            MedicationBucket::Infusions => &self.infusions,
            MedicationBucket::Scheduled => &self.scheduled,
            MedicationBucket::Prn => &self.prn,
        }
    }

    pub fn get_mut(&mut self, bucket: MedicationBucket) -> &mut String {
        match bucket {
            MedicationBucket::Infusions => &mut self.infusions,
            MedicationBucket::Scheduled => &mut self.scheduled,
            MedicationBucket::Prn => &mut self.prn,
        }
    }
}

/// A clinical record as stored locally and replicated to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalRecord {
    pub id: RecordId,
    pub owner_id: OwnerId,
    /// Ordering key for list presentation
    pub order: i64,
    pub name: String,
    #[serde(default)]
    pub clinical_summary: String,
    #[serde(default)]
    pub interval_events: String,
    #[serde(default)]
    pub imaging: String,
    #[serde(default)]
    pub labs: String,
    #[serde(default)]
    pub systems: ClinicalSystems,
    #[serde(default)]
    pub medications: Medications,
    /// Last-write instant per trackable field path
    #[serde(default)]
    pub field_timestamps: BTreeMap<String, Timestamp>,
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
    /// Modification counter; never decreases for a given id
    #[serde(rename = "_modified", default)]
    pub modified: Modified,
    /// Tombstone flag
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,
}

impl ClinicalRecord {
    /// Create an empty record.
    pub fn new(
        id: impl Into<RecordId>,
        owner_id: impl Into<OwnerId>,
        name: impl Into<String>,
        order: i64,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            order,
            name: name.into(),
            clinical_summary: String::new(),
            interval_events: String::new(),
            imaging: String::new(),
            labs: String::new(),
            systems: ClinicalSystems::default(),
            medications: Medications::default(),
            field_timestamps: BTreeMap::new(),
            collapsed: false,
            created_at,
            last_modified: None,
            modified: 0,
            deleted: false,
        }
    }

    /// Parse and validate a document received from outside the process.
    pub fn from_document(document: serde_json::Value) -> Result<Self> {
        RecordSchema::clinical().validate_document(&document)?;
        serde_json::from_value(document).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    /// The record as a JSON document.
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Read the current value of a field.
    pub fn get(&self, field: Field) -> FieldValue {
        match field {
            Field::Name => FieldValue::Text(self.name.clone()),
            Field::Order => FieldValue::Int(self.order),
            Field::Collapsed => FieldValue::Bool(self.collapsed),
            Field::ClinicalSummary => FieldValue::Text(self.clinical_summary.clone()),
            Field::IntervalEvents => FieldValue::Text(self.interval_events.clone()),
            Field::Imaging => FieldValue::Text(self.imaging.clone()),
            Field::Labs => FieldValue::Text(self.labs.clone()),
            Field::System(s) => FieldValue::Text(self.systems.get(s).to_string()),
            Field::Medication(m) => FieldValue::Text(self.medications.get(m).to_string()),
        }
    }

    /// Write a field, returning the previous value.
    ///
    /// The value's kind must match the field's kind; on mismatch the record is
    /// left untouched.
    pub fn set(&mut self, field: Field, value: FieldValue) -> Result<FieldValue> {
        if value.kind() != field.kind() {
            return Err(Error::TypeMismatch {
                field: field.path(),
                expected: field.kind().to_string(),
                got: value.kind().to_string(),
            });
        }
        let old = self.get(field);
        match (field, value) {
            (Field::Order, FieldValue::Int(v)) => self.order = v,
            (Field::Collapsed, FieldValue::Bool(v)) => self.collapsed = v,
            (Field::Name, FieldValue::Text(v)) => self.name = v,
            (Field::ClinicalSummary, FieldValue::Text(v)) => self.clinical_summary = v,
            (Field::IntervalEvents, FieldValue::Text(v)) => self.interval_events = v,
            (Field::Imaging, FieldValue::Text(v)) => self.imaging = v,
            (Field::Labs, FieldValue::Text(v)) => self.labs = v,
            (Field::System(s), FieldValue::Text(v)) => *self.systems.get_mut(s) = v,
            (Field::Medication(m), FieldValue::Text(v)) => *self.medications.get_mut(m) = v,
            // kinds were checked above
            _ => {}
        }
        Ok(old)
    }

    /// Stamp a write to a trackable field.
    pub fn touch(&mut self, field: Field, now: Timestamp) {
        if field.is_trackable() {
            self.field_timestamps.insert(field.path(), now);
            self.last_modified = Some(now);
        }
    }

    /// Turn the record into a tombstone.
    pub fn mark_deleted(&mut self, modified: Modified) {
        self.deleted = true;
        self.modified = modified;
    }

    /// Whether two versions carry the same user-visible content.
    ///
    /// Bookkeeping (`_modified`, timestamps, creation instant) is ignored.
    pub fn same_content(&self, other: &ClinicalRecord) -> bool {
        self.id == other.id
            && self.owner_id == other.owner_id
            && self.order == other.order
            && self.name == other.name
            && self.clinical_summary == other.clinical_summary
            && self.interval_events == other.interval_events
            && self.imaging == other.imaging
            && self.labs == other.labs
            && self.systems == other.systems
            && self.medications == other.medications
            && self.collapsed == other.collapsed
            && self.deleted == other.deleted
    }

    /// Flatten the document into dotted paths.
    ///
    /// Nested objects (`systems`, `medications`, `fieldTimestamps`) contribute
    /// one entry per member.
    pub fn flatten(&self) -> BTreeMap<String, serde_json::Value> {
        let mut out = BTreeMap::new();
        if let serde_json::Value::Object(map) = self.to_document() {
            for (key, value) in map {
                match value {
                    serde_json::Value::Object(inner) => {
                        for (sub, v) in inner {
                            out.insert(format!("{key}.{sub}"), v);
                        }
                    }
                    other => {
                        out.insert(key, other);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ClinicalRecord {
        ClinicalRecord::new("p1", "u1", "Bed 4", 1, 1000)
    }

    #[test]
    fn serializes_sync_markers_with_underscore() {
        let mut r = record();
        r.modified = 7;
        let doc = r.to_document();
        assert_eq!(doc["_modified"], json!(7));
        assert_eq!(doc["_deleted"], json!(false));
        assert_eq!(doc["ownerId"], json!("u1"));
        assert!(doc["systems"]["infectiousDisease"].is_string());
        assert!(doc.get("lastModified").is_none());
    }

    #[test]
    fn from_document_fills_defaults() {
        let doc = json!({"id": "p1", "ownerId": "u1", "order": 3, "name": "Bed 1"});
        let r = ClinicalRecord::from_document(doc).unwrap();
        assert_eq!(r.order, 3);
        assert_eq!(r.clinical_summary, "");
        assert_eq!(r.modified, 0);
        assert!(!r.deleted);
    }

    #[test]
    fn from_document_rejects_invalid() {
        let doc = json!({"id": "p1", "order": "first"});
        let err = ClinicalRecord::from_document(doc).unwrap_err();
        match err {
            Error::Validation(v) => {
                let fields = v.fields();
                assert!(fields.contains(&"ownerId"));
                assert!(fields.contains(&"order"));
                assert!(fields.contains(&"name"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn set_returns_old_value() {
        let mut r = record();
        let old = r
            .set(Field::System(SystemField::Renal), "AKI resolving".into())
            .unwrap();
        assert_eq!(old, FieldValue::Text(String::new()));
        assert_eq!(r.systems.renal, "AKI resolving");
    }

    #[test]
    fn set_rejects_wrong_kind() {
        let mut r = record();
        let err = r.set(Field::Order, "ten".into()).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        assert_eq!(r.order, 1);
    }

    #[test]
    fn touch_only_stamps_trackable_fields() {
        let mut r = record();
        r.touch(Field::Name, 5);
        assert!(r.field_timestamps.is_empty());
        assert_eq!(r.last_modified, None);

        r.touch(Field::Medication(MedicationBucket::Prn), 6);
        assert_eq!(r.field_timestamps.get("medications.prn"), Some(&6));
        assert_eq!(r.last_modified, Some(6));
    }

    #[test]
    fn same_content_ignores_bookkeeping() {
        let a = record();
        let mut b = record();
        b.modified = 99;
        b.field_timestamps.insert("labs".into(), 1);
        assert!(a.same_content(&b));

        b.labs = "K 3.1".into();
        assert!(!a.same_content(&b));
    }

    #[test]
    fn flatten_uses_dotted_keys() {
        let flat = record().flatten();
        assert!(flat.contains_key("systems.neuro"));
        assert!(flat.contains_key("medications.scheduled"));
        assert!(flat.contains_key("_modified"));
        assert!(!flat.contains_key("systems"));
    }
}
