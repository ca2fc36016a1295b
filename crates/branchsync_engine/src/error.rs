//! Error types for the sync engine.

use branchsync_core::{
    BranchId, ConfigError, ConnectionReason, EntityKind, ErrorKind, MappingError, WatermarkError,
};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// A source connection could not be opened or used.
///
/// Always transient: the controller retries with backoff and never treats
/// it as fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} connection error: {message}")]
pub struct ConnectionError {
    /// Failure category.
    pub reason: ConnectionReason,
    /// Driver-supplied detail.
    pub message: String,
}

impl ConnectionError {
    /// Creates a connection error.
    pub fn new(reason: ConnectionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// The connect or query did not finish in time.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConnectionReason::Timeout, message)
    }

    /// The server rejected the credentials.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ConnectionReason::Auth, message)
    }

    /// The connection dropped mid-use.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ConnectionReason::Network, message)
    }

    /// The host could not be reached.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ConnectionReason::Unreachable, message)
    }

    /// Flat classification for events and status.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Connection {
            reason: self.reason,
        }
    }
}

/// The target store failed a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery error: {message}")]
pub struct DeliveryError {
    /// Error message.
    pub message: String,
    /// Whether the batch can be retried.
    pub retryable: bool,
}

impl DeliveryError {
    /// Creates a retryable delivery error (target unreachable, transient
    /// constraint violation).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a permanent delivery error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the batch can be retried.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Flat classification for events and status.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Delivery {
            retryable: self.retryable,
        }
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source connectivity failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Branch configuration failure (unknown branch, invalid input).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Watermark store failure.
    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    /// A single row could not be mapped.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Every row of a non-empty page failed mapping.
    #[error("schema mismatch on {entity}: none of {rows} rows could be mapped ({first})")]
    SchemaMismatch {
        /// Entity stream.
        entity: EntityKind,
        /// Rows in the page.
        rows: usize,
        /// First mapping failure seen.
        first: MappingError,
    },

    /// Target store failure.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The caller did not pass the authorization gate.
    #[error("operation requires authorization")]
    NotAuthorized,

    /// The operation needs an idle branch.
    #[error("a sync session is already active for branch {0}")]
    SessionActive(BranchId),

    /// The entity is not in the branch's sync scope.
    #[error("{entity} is not in the sync scope of branch {branch}")]
    NotInScope {
        /// Branch.
        branch: BranchId,
        /// Entity.
        entity: EntityKind,
    },

    /// The session ended before the command was handled.
    #[error("sync session for branch {0} ended")]
    SessionEnded(BranchId),

    /// A background task failed.
    #[error("task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Returns true if the condition clears on its own and is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Connection(_) => true,
            EngineError::Delivery(e) => e.is_retryable(),
            EngineError::Watermark(e) => !e.is_invariant_violation(),
            _ => false,
        }
    }

    /// Flat classification for events and status.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Connection(e) => e.kind(),
            EngineError::Config(_) | EngineError::NotInScope { .. } => ErrorKind::Validation,
            EngineError::Watermark(e) if e.is_invariant_violation() => ErrorKind::Monotonicity,
            EngineError::Watermark(_) | EngineError::Task(_) => ErrorKind::Storage,
            EngineError::Mapping(_) => ErrorKind::Mapping,
            EngineError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            EngineError::Delivery(e) => e.kind(),
            EngineError::NotAuthorized
            | EngineError::SessionActive(_)
            | EngineError::SessionEnded(_) => ErrorKind::Validation,
        }
    }
}
