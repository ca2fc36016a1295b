//! Per-branch connection parameters and sync scope.

use crate::error::ValidationError;
use crate::types::{BranchId, EntityKind, KeyKind};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

/// Default SQL Server port.
const DEFAULT_PORT: u16 = 1433;
/// Default incremental polling interval.
const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
/// Largest accepted UTC offset (14 hours).
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

/// Trust policy for the source connection's TLS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// No encryption.
    Disabled,
    /// Encrypt but accept any server certificate.
    #[default]
    TrustServerCertificate,
    /// Encrypt and verify the server certificate chain.
    Verify,
}

/// Where a secret comes from.
///
/// Environment references are re-read on every connect, so a rotated
/// credential is picked up without restarting the session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretRef {
    /// The secret value itself.
    Inline(String),
    /// Name of an environment variable holding the secret.
    Env(String),
}

impl SecretRef {
    /// Returns true if the reference names something.
    pub fn is_present(&self) -> bool {
        match self {
            SecretRef::Inline(value) => !value.is_empty(),
            SecretRef::Env(name) => !name.trim().is_empty(),
        }
    }

    /// Resolves the secret, or `None` if it is unavailable.
    pub fn resolve(&self) -> Option<Zeroizing<String>> {
        match self {
            SecretRef::Inline(value) if !value.is_empty() => Some(Zeroizing::new(value.clone())),
            SecretRef::Inline(_) => None,
            SecretRef::Env(name) => std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .map(Zeroizing::new),
        }
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRef::Inline(_) => f.write_str("Inline(<redacted>)"),
            SecretRef::Env(name) => f.debug_tuple("Env").field(name).finish(),
        }
    }
}

/// Credentials used to log into the source database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    /// Login name.
    pub username: String,
    /// Password reference.
    pub secret: SecretRef,
}

impl CredentialRef {
    /// Credentials with an inline password.
    pub fn inline(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: SecretRef::Inline(password.into()),
        }
    }

    /// Credentials whose password is read from an environment variable.
    pub fn from_env(username: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: SecretRef::Env(variable.into()),
        }
    }
}

/// One source table in a branch's sync scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityScope {
    /// Entity kind, which selects the schema mapping.
    pub kind: EntityKind,
    /// Source table override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Ordering key column override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_column: Option<String>,
    /// How the ordering key encodes order.
    #[serde(default)]
    pub key_kind: KeyKind,
}

impl EntityScope {
    /// Scope with the kind's default table and key column.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            table: None,
            key_column: None,
            key_kind: KeyKind::Sequence,
        }
    }

    /// Overrides the source table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Overrides the ordering key column and its kind.
    pub fn with_key(mut self, column: impl Into<String>, kind: KeyKind) -> Self {
        self.key_column = Some(column.into());
        self.key_kind = kind;
        self
    }

    /// Source table to extract from.
    #[must_use]
    pub fn table(&self) -> &str {
        self.table
            .as_deref()
            .unwrap_or_else(|| self.kind.default_table())
    }

    /// Column that orders the table monotonically.
    #[must_use]
    pub fn key_column(&self) -> &str {
        self.key_column
            .as_deref()
            .unwrap_or_else(|| self.kind.default_key_column())
    }
}

/// Connection parameters and sync scope for one branch.
///
/// Immutable while a session for the branch is active; edits take effect
/// on the next start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Branch identifier.
    pub branch: BranchId,
    /// Human-readable branch name.
    #[serde(default)]
    pub name: String,
    /// Source server host or IP.
    pub host: String,
    /// Source server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Named SQL Server instance, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Source database name.
    pub database: String,
    /// Login credentials.
    pub credential: CredentialRef,
    /// TLS trust policy.
    #[serde(default)]
    pub tls: TlsPolicy,
    /// Tables to synchronize.
    pub entities: Vec<EntityScope>,
    /// Incremental polling interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// UTC offset of naive source datetimes, in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Restricts punch extraction to one terminal serial number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_filter: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl BranchConfig {
    /// Creates a configuration syncing every entity kind with defaults.
    pub fn new(
        branch: impl Into<BranchId>,
        host: impl Into<String>,
        database: impl Into<String>,
        credential: CredentialRef,
    ) -> Self {
        Self {
            branch: branch.into(),
            name: String::new(),
            host: host.into(),
            port: DEFAULT_PORT,
            instance: None,
            database: database.into(),
            credential,
            tls: TlsPolicy::default(),
            entities: EntityKind::ALL.into_iter().map(EntityScope::new).collect(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            utc_offset_minutes: 0,
            terminal_filter: None,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the TLS policy.
    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Replaces the sync scope.
    pub fn with_entities(mut self, entities: impl IntoIterator<Item = EntityScope>) -> Self {
        self.entities = entities.into_iter().collect();
        self
    }

    /// Sets the incremental polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the UTC offset used for naive source datetimes.
    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    /// Restricts punch extraction to one terminal.
    pub fn with_terminal_filter(mut self, terminal_sn: impl Into<String>) -> Self {
        self.terminal_filter = Some(terminal_sn.into());
        self
    }

    /// Incremental polling interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Offset applied to naive source datetimes.
    #[must_use]
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Returns the scope entry for `kind`, if it is in scope.
    pub fn scope(&self, kind: EntityKind) -> Option<&EntityScope> {
        self.entities.iter().find(|scope| scope.kind == kind)
    }

    /// Checks required fields.
    ///
    /// # Errors
    ///
    /// Returns the first field that is missing or out of range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.branch.as_str().trim().is_empty() {
            return Err(ValidationError::new("branch", "must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(ValidationError::new("host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ValidationError::new("port", "must be non-zero"));
        }
        if self.database.trim().is_empty() {
            return Err(ValidationError::new("database", "must not be empty"));
        }
        if self.credential.username.trim().is_empty() {
            return Err(ValidationError::new("credential.username", "must not be empty"));
        }
        if !self.credential.secret.is_present() {
            return Err(ValidationError::new("credential.secret", "must be provided"));
        }
        if self.entities.is_empty() {
            return Err(ValidationError::new("entities", "at least one entity must be in scope"));
        }
        let mut seen = BTreeSet::new();
        for scope in &self.entities {
            if !seen.insert(scope.kind) {
                return Err(ValidationError::new(
                    "entities",
                    format!("{} listed more than once", scope.kind),
                ));
            }
            if scope.table().trim().is_empty() || scope.key_column().trim().is_empty() {
                return Err(ValidationError::new(
                    "entities",
                    format!("{} needs a table and key column", scope.kind),
                ));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::new("poll_interval_ms", "must be positive"));
        }
        if self.utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            return Err(ValidationError::new(
                "utc_offset_minutes",
                "must be within +/- 14 hours",
            ));
        }
        Ok(())
    }
}
