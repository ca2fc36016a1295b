//! Canonical records and delivery batches.

use crate::types::{BranchId, EntityKind, Position};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw punch-state codes and their meaning. The only place these codes are
/// interpreted.
const PUNCH_STATE_TABLE: [(i64, PunchState); 6] = [
    (0, PunchState::CheckIn),
    (1, PunchState::CheckOut),
    (2, PunchState::BreakOut),
    (3, PunchState::BreakIn),
    (4, PunchState::OvertimeIn),
    (5, PunchState::OvertimeOut),
];

/// Legacy letter codes emitted by older terminals.
const PUNCH_LETTER_TABLE: [(&str, PunchState); 2] =
    [("I", PunchState::CheckIn), ("O", PunchState::CheckOut)];

/// Attendance punch state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchState {
    /// Start of shift.
    CheckIn,
    /// End of shift.
    CheckOut,
    /// Leaving for a break.
    BreakOut,
    /// Returning from a break.
    BreakIn,
    /// Start of overtime.
    OvertimeIn,
    /// End of overtime.
    OvertimeOut,
    /// Any code outside the table; keeps the raw value.
    Unknown(String),
}

impl PunchState {
    /// Decodes a numeric punch-state code.
    pub fn from_code(code: i64) -> Self {
        PUNCH_STATE_TABLE
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, state)| state.clone())
            .unwrap_or_else(|| PunchState::Unknown(code.to_string()))
    }

    /// Decodes a textual punch-state code (numeric string or letter code).
    pub fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(code) = trimmed.parse::<i64>() {
            return Self::from_code(code);
        }
        PUNCH_LETTER_TABLE
            .iter()
            .find(|(letter, _)| letter.eq_ignore_ascii_case(trimmed))
            .map(|(_, state)| state.clone())
            .unwrap_or_else(|| PunchState::Unknown(trimmed.to_string()))
    }

    /// Returns true for the `Unknown` fallback.
    pub fn is_unknown(&self) -> bool {
        matches!(self, PunchState::Unknown(_))
    }

    /// Display label.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            PunchState::CheckIn => "Check In",
            PunchState::CheckOut => "Check Out",
            PunchState::BreakOut => "Break Out",
            PunchState::BreakIn => "Break In",
            PunchState::OvertimeIn => "Overtime In",
            PunchState::OvertimeOut => "Overtime Out",
            PunchState::Unknown(_) => "Unknown",
        }
    }
}

/// How the employee identified at the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyType {
    /// PIN/password.
    Password,
    /// Fingerprint.
    Fingerprint,
    /// RFID card.
    Card,
    /// Palm vein.
    Palm,
    /// Face.
    Face,
    /// Face plus fingerprint.
    FaceFingerprint,
    /// Face plus password.
    FacePassword,
    /// Face plus card.
    FaceCard,
    /// Not recorded or not recognized.
    Unknown,
}

impl VerifyType {
    /// Decodes a terminal verify-type code.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => VerifyType::Password,
            1 => VerifyType::Fingerprint,
            2 => VerifyType::Card,
            3 => VerifyType::Palm,
            4 => VerifyType::Face,
            15 => VerifyType::FaceFingerprint,
            16 => VerifyType::FacePassword,
            17 => VerifyType::FaceCard,
            _ => VerifyType::Unknown,
        }
    }
}

/// ERP voucher type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherType {
    /// Sales invoice (`SI`).
    Sale,
    /// Sales return (`SR`).
    Return,
    /// Any other voucher code, kept verbatim.
    Other(String),
}

impl VoucherType {
    /// Decodes an ERP voucher code.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "SI" => VoucherType::Sale,
            "SR" => VoucherType::Return,
            other => VoucherType::Other(other.to_string()),
        }
    }
}

/// A biometric punch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PunchRecord {
    /// Employee code at the terminal.
    pub employee_code: String,
    /// Punch instant.
    pub punched_at: DateTime<Utc>,
    /// Decoded punch state.
    pub state: PunchState,
    /// Decoded verification method.
    pub verify: VerifyType,
    /// Terminal serial, alias, or `"unknown"`.
    pub device_id: String,
    /// Area alias or `"unknown"`.
    pub location: String,
    /// Optional work code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_code: Option<String>,
}

/// An ERP sales or return voucher header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherRecord {
    /// ERP transaction id.
    pub transaction_id: String,
    /// Voucher type.
    pub voucher_type: VoucherType,
    /// Voucher number, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voucher_no: Option<String>,
    /// Transaction instant.
    pub transacted_at: DateTime<Utc>,
    /// Grand total.
    pub gross_amount: f64,
    /// VAT amount.
    pub vat_amount: f64,
    /// Discount amount.
    pub discount_amount: f64,
    /// Gross amount, negative for returns.
    pub net_amount: f64,
}

/// A biometric employee roster entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    /// Employee code.
    pub employee_code: String,
    /// First name.
    pub first_name: String,
    /// Last name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Hire date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hired_on: Option<NaiveDate>,
    /// Whether the employee is active.
    pub active: bool,
}

/// Typed, normalized fields of a canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordPayload {
    /// Attendance punch.
    Punch(PunchRecord),
    /// Sales voucher.
    Voucher(VoucherRecord),
    /// Employee.
    Employee(EmployeeRecord),
}

impl RecordPayload {
    /// Entity kind this payload belongs to.
    pub fn kind(&self) -> EntityKind {
        match self {
            RecordPayload::Punch(_) => EntityKind::AttendancePunch,
            RecordPayload::Voucher(_) => EntityKind::SalesVoucher,
            RecordPayload::Employee(_) => EntityKind::Employee,
        }
    }
}

/// Stable identifier of a record in the target store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Joins key parts with `|`.
    ///
    /// `\` and `|` inside a part are backslash-escaped, so distinct part
    /// lists never produce the same key.
    pub fn compose<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = String::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                joined.push('|');
            }
            for c in part.as_ref().chars() {
                if c == '|' || c == '\\' {
                    joined.push('\\');
                }
                joined.push(c);
            }
        }
        Self(joined)
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized, schema-mapped source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Branch the row came from.
    pub branch: BranchId,
    /// Key used for idempotent upsert.
    pub natural_key: NaturalKey,
    /// Ordering-key position of the source row.
    pub position: Position,
    /// Business timestamp of the row, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Normalized fields.
    pub payload: RecordPayload,
}

impl CanonicalRecord {
    /// Entity kind of the record.
    pub fn entity(&self) -> EntityKind {
        self.payload.kind()
    }
}

/// Ordered records of one (branch, entity) stream, delivered as one upsert
/// unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryBatch {
    /// Branch of every record.
    pub branch: BranchId,
    /// Entity of every record.
    pub entity: EntityKind,
    /// Records in source-key order.
    pub records: Vec<CanonicalRecord>,
    /// Highest source position extracted for this batch, mapped or not.
    pub high_water: Position,
    /// Number of source rows the batch was built from.
    pub source_rows: usize,
}

impl DeliveryBatch {
    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no record survived mapping.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn punch_state_table() {
        let expected = [
            PunchState::CheckIn,
            PunchState::CheckOut,
            PunchState::BreakOut,
            PunchState::BreakIn,
            PunchState::OvertimeIn,
            PunchState::OvertimeOut,
        ];
        for (code, state) in expected.iter().enumerate() {
            assert_eq!(&PunchState::from_code(code as i64), state);
        }
        assert_eq!(PunchState::from_code(99), PunchState::Unknown("99".into()));
        assert_eq!(PunchState::from_code(-1), PunchState::Unknown("-1".into()));
    }

    #[test]
    fn punch_state_from_text() {
        assert_eq!(PunchState::from_text("0"), PunchState::CheckIn);
        assert_eq!(PunchState::from_text(" 5 "), PunchState::OvertimeOut);
        assert_eq!(PunchState::from_text("i"), PunchState::CheckIn);
        assert_eq!(PunchState::from_text("O"), PunchState::CheckOut);
        assert_eq!(PunchState::from_text("X"), PunchState::Unknown("X".into()));
    }

    #[test]
    fn verify_and_voucher_codes() {
        assert_eq!(VerifyType::from_code(1), VerifyType::Fingerprint);
        assert_eq!(VerifyType::from_code(15), VerifyType::FaceFingerprint);
        assert_eq!(VerifyType::from_code(9), VerifyType::Unknown);
        assert_eq!(VoucherType::from_code("si"), VoucherType::Sale);
        assert_eq!(VoucherType::from_code("SR"), VoucherType::Return);
        assert_eq!(VoucherType::from_code("PI"), VoucherType::Other("PI".into()));
    }

    #[test]
    fn natural_key_compose() {
        let key = NaturalKey::compose(["MFP324", "1001", "2025-10-22T05:15:00Z"]);
        assert_eq!(key.as_str(), "MFP324|1001|2025-10-22T05:15:00Z");
    }

    #[test]
    fn natural_key_parts_containing_separator_stay_distinct() {
        let left = NaturalKey::compose(["a|b", "c"]);
        let right = NaturalKey::compose(["a", "b|c"]);
        assert_ne!(left, right);
        assert_eq!(left.as_str(), "a\\|b|c");
        assert_ne!(
            NaturalKey::compose(["a\\", "b"]),
            NaturalKey::compose(["a\\|b"])
        );
    }

    proptest! {
        #[test]
        fn distinct_key_parts_give_distinct_keys(
            a in proptest::collection::vec("[a|\\\\]{0,4}", 1..4),
            b in proptest::collection::vec("[a|\\\\]{0,4}", 1..4),
        ) {
            prop_assume!(a != b);
            prop_assert_ne!(NaturalKey::compose(&a), NaturalKey::compose(&b));
        }

        #[test]
        fn codes_outside_table_are_unknown(code in any::<i64>()) {
            let state = PunchState::from_code(code);
            prop_assert_eq!(state.is_unknown(), !(0..=5).contains(&code));
        }

        #[test]
        fn text_and_int_decoding_agree(code in -1000i64..1000) {
            prop_assert_eq!(PunchState::from_text(&code.to_string()), PunchState::from_code(code));
        }
    }
}
