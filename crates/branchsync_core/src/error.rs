//! Error types for the core data model and stores.

use crate::types::{BranchId, EntityKind, Position};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for watermark operations.
pub type WatermarkResult<T> = Result<T, WatermarkError>;

/// A branch configuration failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    /// Name of the offending field.
    pub field: &'static str,
    /// Why the value was rejected.
    pub reason: String,
}

impl ValidationError {
    /// Creates a validation error for `field`.
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors from the branch configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration exists for the branch.
    #[error("branch not found: {0}")]
    NotFound(BranchId),

    /// The configuration failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// I/O error while persisting configuration.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration file could not be encoded or decoded.
    #[error("config encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors from watermark stores.
#[derive(Debug, Error)]
pub enum WatermarkError {
    /// An advance tried to move a watermark backward.
    #[error(
        "watermark for {branch}/{entity} cannot move backward from {current} to {attempted}"
    )]
    Monotonicity {
        /// Branch of the watermark.
        branch: BranchId,
        /// Entity of the watermark.
        entity: EntityKind,
        /// Current durable position.
        current: Position,
        /// Rejected position.
        attempted: Position,
    },

    /// I/O error while persisting a watermark.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A persisted watermark could not be decoded.
    #[error("watermark codec error: {0}")]
    Codec(String),

    /// Another process holds the watermark directory.
    #[error("watermark directory is locked by another process: {0}")]
    Locked(PathBuf),
}

impl WatermarkError {
    /// Returns true if this error indicates a watermark usage bug.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, WatermarkError::Monotonicity { .. })
    }
}

/// Why a field could not be mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingReason {
    /// The column is absent or null.
    Missing,
    /// The value has the wrong type.
    WrongType {
        /// Type the mapper expected.
        expected: &'static str,
        /// Type that was found.
        found: &'static str,
    },
    /// The value has the right type but cannot be interpreted.
    Invalid(String),
}

impl fmt::Display for MappingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingReason::Missing => f.write_str("missing"),
            MappingReason::WrongType { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            MappingReason::Invalid(message) => f.write_str(message),
        }
    }
}

/// A single source row could not be mapped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot map field `{field}`: {reason}")]
pub struct MappingError {
    /// Source column name.
    pub field: String,
    /// Why mapping failed.
    pub reason: MappingReason,
}

impl MappingError {
    /// A mandatory column is absent or null.
    pub fn missing(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: MappingReason::Missing,
        }
    }

    /// A column holds a value of the wrong type.
    pub fn wrong_type(field: impl Into<String>, expected: &'static str, found: &'static str) -> Self {
        Self {
            field: field.into(),
            reason: MappingReason::WrongType { expected, found },
        }
    }

    /// A column holds a value that cannot be interpreted.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: MappingReason::Invalid(message.into()),
        }
    }
}
