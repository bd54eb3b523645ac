//! Record schema and validation.
//!
//! The schema is fixed: every clinical record carries the same set of fields,
//! each with a type, an optional maximum length and a required flag.
//! Validation walks the whole document and reports every offending field.

use crate::{
    error::{ValidationError, Violation},
    field::{Field, FieldValue, MedicationBucket, SystemField, MEDICATIONS_GROUP, SYSTEMS_GROUP},
    SchemaVersion,
};
use serde::{Deserialize, Serialize};

/// Current schema version.
pub const SCHEMA_VERSION: SchemaVersion = 1;

/// Maximum length of identifiers (`id`, `ownerId`).
pub const MAX_ID_LENGTH: usize = 128;
/// Maximum length of a record name.
pub const MAX_NAME_LENGTH: usize = 256;
/// Maximum length of any narrative or medication text field.
pub const MAX_TEXT_LENGTH: usize = 50_000;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Bool,
    /// Non-negative integer, milliseconds or counter
    Timestamp,
    /// JSON object (nested group)
    Object,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Object => write!(f, "Object"),
        }
    }
}

/// Definition of a field in the record schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field path (dotted for nested members)
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    /// Maximum length in characters, for strings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            max_length: None,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            max_length: None,
        }
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Validate a JSON value against this definition, collecting violations.
    pub fn validate(&self, value: Option<&serde_json::Value>, errors: &mut ValidationError) {
        match value {
            None | Some(serde_json::Value::Null) => {
                if self.required {
                    errors.push(&self.name, Violation::Missing);
                }
            }
            Some(v) => self.validate_value(v, errors),
        }
    }

    fn validate_value(&self, value: &serde_json::Value, errors: &mut ValidationError) {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Object => value.is_object(),
        };
        if !valid {
            errors.push(
                &self.name,
                Violation::TypeMismatch {
                    expected: self.field_type.to_string(),
                    got: json_type_name(value).to_string(),
                },
            );
            return;
        }
        if let Some(text) = value.as_str() {
            self.validate_text(text, errors);
        }
    }

    fn validate_text(&self, text: &str, errors: &mut ValidationError) {
        if self.required && text.is_empty() {
            errors.push(&self.name, Violation::Empty);
            return;
        }
        if let Some(max) = self.max_length {
            let actual = text.chars().count();
            if actual > max {
                errors.push(&self.name, Violation::TooLong { max, actual });
            }
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Look up a possibly dotted path in a JSON object.
fn lookup<'a>(document: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    match path.split_once('.') {
        None => document.get(path),
        Some((group, member)) => document.get(group)?.as_object()?.get(member),
    }
}

/// Schema of a clinical record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSchema {
    pub version: SchemaVersion,
    pub fields: Vec<FieldDef>,
}

impl RecordSchema {
    pub fn new(version: SchemaVersion, fields: Vec<FieldDef>) -> Self {
        Self { version, fields }
    }

    /// The clinical record schema.
    pub fn clinical() -> Self {
        let text = |name: &str| FieldDef::optional(name, FieldType::String).max_length(MAX_TEXT_LENGTH);

        let mut fields = vec![
            FieldDef::required("id", FieldType::String).max_length(MAX_ID_LENGTH),
            FieldDef::required("ownerId", FieldType::String).max_length(MAX_ID_LENGTH),
            FieldDef::required("order", FieldType::Int),
            FieldDef::required("name", FieldType::String).max_length(MAX_NAME_LENGTH),
            text("clinicalSummary"),
            text("intervalEvents"),
            text("imaging"),
            text("labs"),
            FieldDef::optional(SYSTEMS_GROUP, FieldType::Object),
        ];
        fields.extend(
            SystemField::ALL
                .into_iter()
                .map(|s| text(&format!("{SYSTEMS_GROUP}.{}", s.key()))),
        );
        fields.push(FieldDef::optional(MEDICATIONS_GROUP, FieldType::Object));
        fields.extend(
            MedicationBucket::ALL
                .into_iter()
                .map(|m| text(&format!("{MEDICATIONS_GROUP}.{}", m.key()))),
        );
        fields.extend([
            FieldDef::optional("fieldTimestamps", FieldType::Object),
            FieldDef::optional("collapsed", FieldType::Bool),
            FieldDef::optional("createdAt", FieldType::Timestamp),
            FieldDef::optional("lastModified", FieldType::Timestamp),
            FieldDef::optional("_modified", FieldType::Timestamp),
            FieldDef::optional("_deleted", FieldType::Bool),
        ]);

        Self::new(SCHEMA_VERSION, fields)
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a whole document.
    pub fn validate_document(&self, document: &serde_json::Value) -> Result<(), ValidationError> {
        let mut errors = ValidationError::default();
        if !document.is_object() {
            errors.push(
                "$",
                Violation::TypeMismatch {
                    expected: FieldType::Object.to_string(),
                    got: json_type_name(document).to_string(),
                },
            );
            return Err(errors);
        }

        for field in &self.fields {
            field.validate(lookup(document, &field.name), &mut errors);
        }

        if let Some(stamps) = document.get("fieldTimestamps").and_then(|v| v.as_object()) {
            for (path, stamp) in stamps {
                if !stamp.is_u64() {
                    errors.push(
                        format!("fieldTimestamps.{path}"),
                        Violation::TypeMismatch {
                            expected: FieldType::Timestamp.to_string(),
                            got: json_type_name(stamp).to_string(),
                        },
                    );
                }
            }
        }

        errors.into_result()
    }

    /// Validate a single field write before it reaches any state.
    pub fn validate_field(&self, field: Field, value: &FieldValue) -> Result<(), ValidationError> {
        let mut errors = ValidationError::default();
        if let Some(def) = self.get_field(&field.path()) {
            let json = serde_json::to_value(value).unwrap_or_default();
            def.validate(Some(&json), &mut errors);
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> serde_json::Value {
        json!({
            "id": "p1",
            "ownerId": "u1",
            "order": 0,
            "name": "Bed 1",
            "systems": {"neuro": "GCS 15"},
            "medications": {"prn": "[]"},
            "_modified": 12,
        })
    }

    #[test]
    fn validate_valid_document() {
        assert!(RecordSchema::clinical().validate_document(&valid()).is_ok());
    }

    #[test]
    fn validate_reports_all_offending_fields() {
        let mut doc = valid();
        doc["name"] = json!("");
        doc["order"] = json!("x");
        doc["systems"]["renal"] = json!(5);

        let err = RecordSchema::clinical().validate_document(&doc).unwrap_err();
        assert_eq!(err.fields(), vec!["order", "name", "systems.renal"]);
        assert_eq!(err.violations[1].violation, Violation::Empty);
    }

    #[test]
    fn validate_max_length() {
        let mut doc = valid();
        doc["labs"] = json!("x".repeat(MAX_TEXT_LENGTH + 1));

        let err = RecordSchema::clinical().validate_document(&doc).unwrap_err();
        assert_eq!(
            err.violations[0].violation,
            Violation::TooLong {
                max: MAX_TEXT_LENGTH,
                actual: MAX_TEXT_LENGTH + 1
            }
        );
    }

    #[test]
    fn validate_null_required_field() {
        let mut doc = valid();
        doc["ownerId"] = json!(null);

        let err = RecordSchema::clinical().validate_document(&doc).unwrap_err();
        assert_eq!(err.fields(), vec!["ownerId"]);
        assert_eq!(err.violations[0].violation, Violation::Missing);
    }

    #[test]
    fn validate_group_must_be_object() {
        let mut doc = valid();
        doc["systems"] = json!("all normal");

        let err = RecordSchema::clinical().validate_document(&doc).unwrap_err();
        assert_eq!(err.fields(), vec!["systems"]);
    }

    #[test]
    fn validate_negative_modified() {
        let mut doc = valid();
        doc["_modified"] = json!(-1);
        assert!(RecordSchema::clinical().validate_document(&doc).is_err());
    }

    #[test]
    fn validate_non_object() {
        let err = RecordSchema::clinical()
            .validate_document(&json!([1, 2]))
            .unwrap_err();
        assert_eq!(err.fields(), vec!["$"]);
    }

    #[test]
    fn validate_single_field() {
        let schema = RecordSchema::clinical();
        assert!(schema
            .validate_field(Field::Labs, &FieldValue::Text("ok".into()))
            .is_ok());
        assert!(schema
            .validate_field(Field::Name, &FieldValue::Text(String::new()))
            .is_err());
        assert!(schema
            .validate_field(
                Field::ClinicalSummary,
                &FieldValue::Text("y".repeat(MAX_TEXT_LENGTH + 1))
            )
            .is_err());
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Object.to_string(), "Object");
    }

    #[test]
    fn schema_serialization() {
        let schema = RecordSchema::clinical();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: RecordSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
