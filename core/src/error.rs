//! Error taxonomy for pack operations.
//!
//! Every failure carries a stable, machine-readable code. Callers branch on
//! [`PackError::code`], never on the message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::CanonicalError;

/// Stable error codes shared by the validator, assembler and gate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Shape or type violation in a pack document.
    SchemaInvalid,
    /// A required field is absent.
    MissingRequired,
    /// `order` is not a (non-decreasing) subsequence of the canonical sections.
    InvalidOrder,
    /// The sealed hash does not match the content. Always fatal.
    HashMismatch,
    /// Section order regressed (gate).
    OrderViolation,
    /// A section holds more items than its cap (gate).
    SectionCapExceeded,
    /// The pack holds more items than `max_files` (gate).
    MaxFilesExceeded,
    /// A placed path matches a `never_include` rule (gate).
    NeverIncludeMatch,
    /// A `must_include` entry names a non-canonical section (gate).
    MustSectionInvalid,
    /// A `must_include` item cannot be placed under the budgets.
    BudgetError,
}

impl ErrorCode {
    /// Machine-readable code for logs and CLI output
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::MissingRequired => "MISSING_REQUIRED",
            Self::InvalidOrder => "INVALID_ORDER",
            Self::HashMismatch => "HASH_MISMATCH",
            Self::OrderViolation => "ORDER_VIOLATION",
            Self::SectionCapExceeded => "SECTION_CAP_EXCEEDED",
            Self::MaxFilesExceeded => "MAX_FILES_EXCEEDED",
            Self::NeverIncludeMatch => "NEVER_INCLUDE_MATCH",
            Self::MustSectionInvalid => "MUST_SECTION_INVALID",
            Self::BudgetError => "BUDGET_ERROR",
        }
    }

    /// Integrity failures can never be downgraded to warnings.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::HashMismatch)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rule violation, located by a JSON-pointer-like path.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub code: ErrorCode,
    /// Location inside the document, e.g. `/budgets/section_caps/extras`.
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(code: ErrorCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{} {path}: {}", self.code, self.message)
    }
}

/// Ordered, non-empty list of violations collected by one validation run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationErrors(Vec<Violation>);

impl ValidationErrors {
    /// Returns `None` for an empty list; a failure always has a first cause.
    pub fn from_vec(violations: Vec<Violation>) -> Option<Self> {
        if violations.is_empty() {
            None
        } else {
            Some(Self(violations))
        }
    }

    pub fn first(&self) -> &Violation {
        // Non-empty by construction.
        &self.0[0]
    }

    pub fn violations(&self) -> &[Violation] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Violation> {
        self.0
    }
}

impl From<Violation> for ValidationErrors {
    fn from(violation: Violation) -> Self {
        Self(vec![violation])
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.0.len();
        write!(
            f,
            "pack validation failed ({n} violation{}):",
            if n == 1 { "" } else { "s" }
        )?;
        for v in &self.0 {
            write!(f, "\n  - {v}")?;
        }
        Ok(())
    }
}

/// Pack error with stable code
#[derive(Debug, Error)]
pub enum PackError {
    #[error("{0}")]
    Validation(ValidationErrors),

    #[error("hash mismatch: pack declares {declared}, content hashes to {computed}")]
    HashMismatch { declared: String, computed: String },

    #[error("budget error: must_include {locator} cannot be placed: {reason}")]
    Budget { locator: String, reason: String },

    #[error("gate violation: {0}")]
    Gate(Violation),

    #[error("canonicalization failed: {0}")]
    Canonical(#[from] CanonicalError),

    #[error("malformed pack JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl PackError {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(errors) => errors.first().code,
            Self::HashMismatch { .. } => ErrorCode::HashMismatch,
            Self::Budget { .. } => ErrorCode::BudgetError,
            Self::Gate(violation) => violation.code,
            Self::Canonical(_) | Self::Json(_) => ErrorCode::SchemaInvalid,
        }
    }

    /// Create a budget error for an unplaceable required locator
    pub fn budget(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Budget {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    /// Collected violations, when this is a validation failure.
    pub fn violations(&self) -> Option<&[Violation]> {
        match self {
            Self::Validation(errors) => Some(errors.violations()),
            _ => None,
        }
    }
}

impl From<ValidationErrors> for PackError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

/// Result type for pack operations
pub type Result<T> = std::result::Result<T, PackError>;
