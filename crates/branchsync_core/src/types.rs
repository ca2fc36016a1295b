//! Identifier and ordering types shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a branch (one on-premise site with its own source database).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(String);

impl BranchId {
    /// Creates a branch identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BranchId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BranchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The kinds of source entities that can be synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Biometric terminal punches (`iclock_transaction`).
    AttendancePunch,
    /// ERP sales and return vouchers (`InvTransactionMaster`).
    SalesVoucher,
    /// Biometric employee roster (`personnel_employee`).
    Employee,
}

impl EntityKind {
    /// All entity kinds, in a stable order.
    pub const ALL: [EntityKind; 3] = [
        EntityKind::AttendancePunch,
        EntityKind::SalesVoucher,
        EntityKind::Employee,
    ];

    /// Returns the stable snake_case name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::AttendancePunch => "attendance_punch",
            EntityKind::SalesVoucher => "sales_voucher",
            EntityKind::Employee => "employee",
        }
    }

    /// Default source table for this kind.
    #[must_use]
    pub fn default_table(&self) -> &'static str {
        match self {
            EntityKind::AttendancePunch => "iclock_transaction",
            EntityKind::SalesVoucher => "InvTransactionMaster",
            EntityKind::Employee => "personnel_employee",
        }
    }

    /// Default ordering key column for this kind.
    #[must_use]
    pub fn default_key_column(&self) -> &'static str {
        match self {
            EntityKind::AttendancePunch => "id",
            EntityKind::SalesVoucher => "TransactionID",
            EntityKind::Employee => "id",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

/// How the ordering key column encodes source order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// An auto-increment integer id.
    #[default]
    Sequence,
    /// A timestamp; positions are UTC epoch milliseconds.
    Timestamp,
}

/// A position in a source table's monotonic ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(pub i64);

impl Position {
    /// Returns the raw position value.
    #[must_use]
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extraction mode of an entity stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// One-time full historical extraction.
    Backfill,
    /// Polling for rows newer than the watermark.
    Incremental,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_parse_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("invoice".parse::<EntityKind>().is_err());
        assert_eq!(
            "ATTENDANCE_PUNCH".parse::<EntityKind>().unwrap(),
            EntityKind::AttendancePunch
        );
    }

    #[test]
    fn positions_order_numerically() {
        assert!(Position(9) < Position(10));
        assert_eq!(Position(4).to_string(), "4");
    }

    #[test]
    fn branch_id_serializes_as_string() {
        let json = serde_json::to_string(&BranchId::new("riyadh-3")).unwrap();
        assert_eq!(json, "\"riyadh-3\"");
    }
}
