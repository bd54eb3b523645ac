//! Field paths and values.
//!
//! A field path names exactly one scalar slot of a [`ClinicalRecord`]: either a
//! top-level field (`clinicalSummary`) or a dotted path into one of the two
//! nested groups (`systems.neuro`, `medications.prn`).
//!
//! [`ClinicalRecord`]: crate::ClinicalRecord

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Group prefix for clinical-system sub-fields.
pub const SYSTEMS_GROUP: &str = "systems";
/// Group prefix for medication buckets.
pub const MEDICATIONS_GROUP: &str = "medications";

/// One of the ten clinical-system sub-fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SystemField {
    Neuro,
    Cardiovascular,
    Respiratory,
    Gastrointestinal,
    Renal,
    Endocrine,
    Hematology,
    InfectiousDisease,
    Skin,
    Lines,
}

impl SystemField {
    pub const ALL: [SystemField; 10] = [
        SystemField::Neuro,
        SystemField::Cardiovascular,
        SystemField::Respiratory,
        SystemField::Gastrointestinal,
        SystemField::Renal,
        SystemField::Endocrine,
        SystemField::Hematology,
        SystemField::InfectiousDisease,
        SystemField::Skin,
        SystemField::Lines,
    ];

    /// Key used inside the `systems` object.
    pub fn key(self) -> &'static str {
        match self {
            SystemField::Neuro => "neuro",
            SystemField::Cardiovascular => "cardiovascular",
            SystemField::Respiratory => "respiratory",
            SystemField::Gastrointestinal => "gastrointestinal",
            SystemField::Renal => "renal",
            SystemField::Endocrine => "endocrine",
            SystemField::Hematology => "hematology",
            SystemField::InfectiousDisease => "infectiousDisease",
            SystemField::Skin => "skin",
            SystemField::Lines => "lines",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key)
    }
}

/// One of the three medication buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MedicationBucket {
    Infusions,
    Scheduled,
    Prn,
}

impl MedicationBucket {
    pub const ALL: [MedicationBucket; 3] = [
        MedicationBucket::Infusions,
        MedicationBucket::Scheduled,
        MedicationBucket::Prn,
    ];

    /// Key used inside the `medications` object.
    pub fn key(self) -> &'static str {
        match self {
            MedicationBucket::Infusions => "infusions",
            MedicationBucket::Scheduled => "scheduled",
            MedicationBucket::Prn => "prn",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.key() == key)
    }
}

/// The kind of value a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Int,
    Bool,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Text => write!(f, "String"),
            FieldKind::Int => write!(f, "Int"),
            FieldKind::Bool => write!(f, "Bool"),
        }
    }
}

/// A resolved, writable field of a clinical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Name,
    Order,
    Collapsed,
    ClinicalSummary,
    IntervalEvents,
    Imaging,
    Labs,
    System(SystemField),
    Medication(MedicationBucket),
}

impl Field {
    /// Every writable field, top-level first.
    pub fn all() -> Vec<Field> {
        let mut fields = vec![
            Field::Name,
            Field::Order,
            Field::Collapsed,
            Field::ClinicalSummary,
            Field::IntervalEvents,
            Field::Imaging,
            Field::Labs,
        ];
        fields.extend(SystemField::ALL.into_iter().map(Field::System));
        fields.extend(MedicationBucket::ALL.into_iter().map(Field::Medication));
        fields
    }

    /// Resolve a field path.
    ///
    /// Dotted paths must name a known group and a known member of it; anything
    /// else is rejected before the caller touches any state.
    pub fn parse(path: &str) -> Result<Field> {
        match path.split_once('.') {
            None => match path {
                "name" => Ok(Field::Name),
                "order" => Ok(Field::Order),
                "collapsed" => Ok(Field::Collapsed),
                "clinicalSummary" => Ok(Field::ClinicalSummary),
                "intervalEvents" => Ok(Field::IntervalEvents),
                "imaging" => Ok(Field::Imaging),
                "labs" => Ok(Field::Labs),
                _ => Err(Error::UnknownField(path.to_string())),
            },
            Some((SYSTEMS_GROUP, key)) => SystemField::from_key(key)
                .map(Field::System)
                .ok_or_else(|| Error::UnknownField(path.to_string())),
            Some((MEDICATIONS_GROUP, key)) => MedicationBucket::from_key(key)
                .map(Field::Medication)
                .ok_or_else(|| Error::UnknownField(path.to_string())),
            Some((group, _)) => Err(Error::UnknownGroup {
                group: group.to_string(),
                path: path.to_string(),
            }),
        }
    }

    /// Canonical path, as used in `fieldTimestamps` and history entries.
    pub fn path(&self) -> String {
        match self {
            Field::Name => "name".into(),
            Field::Order => "order".into(),
            Field::Collapsed => "collapsed".into(),
            Field::ClinicalSummary => "clinicalSummary".into(),
            Field::IntervalEvents => "intervalEvents".into(),
            Field::Imaging => "imaging".into(),
            Field::Labs => "labs".into(),
            Field::System(s) => format!("{SYSTEMS_GROUP}.{}", s.key()),
            Field::Medication(m) => format!("{MEDICATIONS_GROUP}.{}", m.key()),
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Order => FieldKind::Int,
            Field::Collapsed => FieldKind::Bool,
            _ => FieldKind::Text,
        }
    }

    /// Trackable fields get per-field timestamps and history entries.
    ///
    /// These are the free-text content fields plus every nested group member;
    /// `name`, `order` and `collapsed` are structural.
    pub fn is_trackable(&self) -> bool {
        !matches!(self, Field::Name | Field::Order | Field::Collapsed)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl std::str::FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Field::parse(s)
    }
}

/// A value written to a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Bool(_) => FieldKind::Bool,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text rendering used for audit history.
    pub fn to_history_string(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Bool(b) => b.to_string(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}
