//! Error types for the Chartsync engine.

use std::fmt;
use thiserror::Error;

/// What is wrong with a single field of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A required field is absent or null.
    Missing,
    /// A required text field is present but empty.
    Empty,
    /// The value has the wrong JSON type.
    TypeMismatch { expected: String, got: String },
    /// A text value exceeds the field's maximum length (in characters).
    TooLong { max: usize, actual: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Missing => write!(f, "missing required field"),
            Violation::Empty => write!(f, "must not be empty"),
            Violation::TypeMismatch { expected, got } => {
                write!(f, "expected {expected}, got {got}")
            }
            Violation::TooLong { max, actual } => {
                write!(f, "length {actual} exceeds maximum of {max}")
            }
        }
    }
}

/// A violation attached to the field path it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub violation: Violation,
}

/// Schema validation failure naming every offending field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn push(&mut self, field: impl Into<String>, violation: Violation) {
        self.violations.push(FieldViolation {
            field: field.into(),
            violation,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Names of the fields that failed validation, in schema order.
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> std::result::Result<(), ValidationError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed")?;
        for (i, v) in self.violations.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{} ({})", v.field, v.violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// All possible errors from the Chartsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("unknown field group '{group}' in path '{path}'")]
    UnknownGroup { group: String, path: String },

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
