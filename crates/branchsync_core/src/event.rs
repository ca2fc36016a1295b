//! Sync log events and the flat error classification attached to them.

use crate::types::{BranchId, EntityKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a source connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionReason {
    /// The connect or query did not finish in time.
    Timeout,
    /// The server rejected the credentials.
    Auth,
    /// The connection dropped or a transport error occurred.
    Network,
    /// The host could not be reached at all.
    Unreachable,
}

impl fmt::Display for ConnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionReason::Timeout => "timeout",
            ConnectionReason::Auth => "auth",
            ConnectionReason::Network => "network",
            ConnectionReason::Unreachable => "unreachable",
        })
    }
}

/// Flat classification of the error behind an event or status entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ErrorKind {
    /// Source connectivity failure; retried.
    Connection {
        /// Failure reason.
        reason: ConnectionReason,
    },
    /// Operator input was rejected.
    Validation,
    /// A single row could not be mapped.
    Mapping,
    /// No row in a batch could be mapped.
    SchemaMismatch,
    /// A watermark was about to move backward.
    Monotonicity,
    /// The target store failed a delivery.
    Delivery {
        /// Whether the batch will be retried.
        retryable: bool,
    },
    /// Local persistence failed.
    Storage,
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Progress information.
    Info,
    /// Degraded but continuing.
    Warn,
    /// Requires attention.
    Error,
}

/// One entry in a branch's append-only sync log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEvent {
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Branch the event belongs to.
    pub branch: BranchId,
    /// Entity stream, if the event concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKind>,
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Underlying error classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl SyncLogEvent {
    /// Creates an event stamped with the current time.
    pub fn new(branch: BranchId, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            branch,
            entity: None,
            severity,
            message: message.into(),
            error: None,
        }
    }

    /// Creates an info event.
    pub fn info(branch: BranchId, message: impl Into<String>) -> Self {
        Self::new(branch, Severity::Info, message)
    }

    /// Creates a warning event.
    pub fn warn(branch: BranchId, message: impl Into<String>) -> Self {
        Self::new(branch, Severity::Warn, message)
    }

    /// Creates an error event.
    pub fn error(branch: BranchId, message: impl Into<String>) -> Self {
        Self::new(branch, Severity::Error, message)
    }

    /// Attaches the entity stream.
    pub fn for_entity(mut self, entity: EntityKind) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Attaches the error classification.
    pub fn with_error(mut self, kind: ErrorKind) -> Self {
        self.error = Some(kind);
        self
    }
}
