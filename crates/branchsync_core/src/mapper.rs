//! Schema mapping from source rows to canonical records.
//!
//! The mapper is a pure function layer: it holds only the branch identity
//! and the branch's UTC offset, performs no I/O and never logs. Anything
//! worth reporting that is not an error (an unrecognized punch-state code,
//! an unparseable hire date) is returned as a [`MappingWarning`] for the
//! caller to log.
//!
//! Rows missing identifying fields fail with [`MappingError`]; the caller
//! skips that row, not the batch.

use crate::config::{BranchConfig, EntityScope};
use crate::error::MappingError;
use crate::record::{
    CanonicalRecord, EmployeeRecord, NaturalKey, PunchRecord, PunchState, RecordPayload,
    VerifyType, VoucherRecord, VoucherType,
};
use crate::row::{SourceRow, SourceValue};
use crate::types::{BranchId, EntityKind, KeyKind, Position};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Naive datetime layouts seen in source text columns.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Device/location placeholder when the source leaves them empty.
const UNKNOWN: &str = "unknown";

mod columns {
    pub const EMP_CODE: &str = "emp_code";
    pub const PUNCH_TIME: &str = "punch_time";
    pub const PUNCH_STATE: &str = "punch_state";
    pub const VERIFY_TYPE: &str = "verify_type";
    pub const WORK_CODE: &str = "work_code";
    pub const TERMINAL_SN: &str = "terminal_sn";
    pub const TERMINAL_ALIAS: &str = "terminal_alias";
    pub const AREA_ALIAS: &str = "area_alias";

    pub const TRANSACTION_ID: &str = "TransactionID";
    pub const VOUCHER_TYPE: &str = "VoucherType";
    pub const VOUCHER_NO: &str = "VoucherNo";
    pub const TRANSACTION_DATE: &str = "TransactionDate";
    pub const GRAND_TOTAL: &str = "GrandTotal";
    pub const VAT_AMOUNT: &str = "VatAmount";
    pub const TOTAL_DISCOUNT: &str = "TotalDiscount";

    pub const FIRST_NAME: &str = "first_name";
    pub const LAST_NAME: &str = "last_name";
    pub const HIRE_DATE: &str = "hire_date";
    pub const IS_ACTIVE: &str = "is_active";
    pub const UPDATE_TIME: &str = "update_time";
}

/// Something noteworthy about a row that did not prevent mapping it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingWarning {
    /// Source column concerned.
    pub field: String,
    /// Human-readable description.
    pub message: String,
}

/// A successfully mapped row.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapped {
    /// The canonical record.
    pub record: CanonicalRecord,
    /// Non-fatal findings.
    pub warnings: Vec<MappingWarning>,
}

/// Translates source rows into canonical records for one branch.
#[derive(Debug, Clone)]
pub struct SchemaMapper {
    branch: BranchId,
    offset: FixedOffset,
}

impl SchemaMapper {
    /// Creates a mapper for `branch` interpreting naive datetimes at `offset`.
    pub fn new(branch: BranchId, offset: FixedOffset) -> Self {
        Self { branch, offset }
    }

    /// Creates a mapper from a branch configuration.
    pub fn for_branch(config: &BranchConfig) -> Self {
        Self::new(config.branch.clone(), config.utc_offset())
    }

    /// Offset applied to naive source datetimes.
    #[must_use]
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Reads the ordering-key position of a row.
    ///
    /// # Errors
    ///
    /// Fails if the key column is missing or cannot be read as the scope's
    /// key kind.
    pub fn position_of(&self, scope: &EntityScope, row: &SourceRow) -> Result<Position, MappingError> {
        let column = scope.key_column();
        let value = row
            .non_null(column)
            .ok_or_else(|| MappingError::missing(column))?;
        key_position(value, column, scope.key_kind, self.offset)
    }

    /// Maps one source row of `scope`'s entity kind.
    ///
    /// # Errors
    ///
    /// Fails if a mandatory identifying field is missing or malformed.
    pub fn map(&self, scope: &EntityScope, row: &SourceRow) -> Result<Mapped, MappingError> {
        let position = self.position_of(scope, row)?;
        let mut warnings = Vec::new();

        let (natural_key, source_timestamp, payload) = match scope.kind {
            EntityKind::AttendancePunch => {
                let punch = self.map_punch(row, &mut warnings)?;
                let key = NaturalKey::compose([
                    punch.device_id.as_str(),
                    punch.employee_code.as_str(),
                    &punch.punched_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                ]);
                (key, Some(punch.punched_at), RecordPayload::Punch(punch))
            }
            EntityKind::SalesVoucher => {
                let voucher = self.map_voucher(row)?;
                let key = NaturalKey::compose([voucher.transaction_id.as_str()]);
                (key, Some(voucher.transacted_at), RecordPayload::Voucher(voucher))
            }
            EntityKind::Employee => {
                let (employee, updated_at) = self.map_employee(row, &mut warnings)?;
                let key = NaturalKey::compose([employee.employee_code.as_str()]);
                (key, updated_at, RecordPayload::Employee(employee))
            }
        };

        Ok(Mapped {
            record: CanonicalRecord {
                branch: self.branch.clone(),
                natural_key,
                position,
                source_timestamp,
                payload,
            },
            warnings,
        })
    }

    fn map_punch(
        &self,
        row: &SourceRow,
        warnings: &mut Vec<MappingWarning>,
    ) -> Result<PunchRecord, MappingError> {
        let employee_code = required_text(row, columns::EMP_CODE)?;
        let punched_at = required_timestamp(row, columns::PUNCH_TIME, self.offset)?;

        let state = match row.non_null(columns::PUNCH_STATE) {
            Some(SourceValue::Int(code)) => PunchState::from_code(*code),
            Some(SourceValue::Text(raw)) => PunchState::from_text(raw),
            Some(other) => {
                return Err(MappingError::wrong_type(
                    columns::PUNCH_STATE,
                    "int or text",
                    other.type_name(),
                ))
            }
            None => return Err(MappingError::missing(columns::PUNCH_STATE)),
        };
        if let PunchState::Unknown(raw) = &state {
            warnings.push(MappingWarning {
                field: columns::PUNCH_STATE.to_string(),
                message: format!("unrecognized punch state `{raw}` for employee {employee_code}"),
            });
        }

        let verify = match row.non_null(columns::VERIFY_TYPE) {
            Some(SourceValue::Int(code)) => VerifyType::from_code(*code),
            Some(SourceValue::Text(raw)) => raw
                .trim()
                .parse::<i64>()
                .map(VerifyType::from_code)
                .unwrap_or(VerifyType::Unknown),
            _ => VerifyType::Unknown,
        };

        let device_id = optional_text(row, columns::TERMINAL_SN)
            .or_else(|| optional_text(row, columns::TERMINAL_ALIAS))
            .unwrap_or_else(|| UNKNOWN.to_string());
        let location =
            optional_text(row, columns::AREA_ALIAS).unwrap_or_else(|| UNKNOWN.to_string());

        Ok(PunchRecord {
            employee_code,
            punched_at,
            state,
            verify,
            device_id,
            location,
            work_code: optional_text(row, columns::WORK_CODE),
        })
    }

    fn map_voucher(&self, row: &SourceRow) -> Result<VoucherRecord, MappingError> {
        let transaction_id = required_text(row, columns::TRANSACTION_ID)?;
        let voucher_type = VoucherType::from_code(&required_text(row, columns::VOUCHER_TYPE)?);
        let transacted_at = required_timestamp(row, columns::TRANSACTION_DATE, self.offset)?;
        let gross_amount = amount(row, columns::GRAND_TOTAL)?;
        let vat_amount = amount(row, columns::VAT_AMOUNT)?;
        let discount_amount = amount(row, columns::TOTAL_DISCOUNT)?;
        let net_amount = match voucher_type {
            VoucherType::Return => -gross_amount,
            _ => gross_amount,
        };

        Ok(VoucherRecord {
            transaction_id,
            voucher_type,
            voucher_no: optional_text(row, columns::VOUCHER_NO),
            transacted_at,
            gross_amount,
            vat_amount,
            discount_amount,
            net_amount,
        })
    }

    fn map_employee(
        &self,
        row: &SourceRow,
        warnings: &mut Vec<MappingWarning>,
    ) -> Result<(EmployeeRecord, Option<DateTime<Utc>>), MappingError> {
        let employee_code = required_text(row, columns::EMP_CODE)?;

        let hired_on = match row.non_null(columns::HIRE_DATE) {
            None => None,
            Some(value) => match coerce_date(value, columns::HIRE_DATE, self.offset) {
                Ok(date) => Some(date),
                Err(e) => {
                    warnings.push(MappingWarning {
                        field: columns::HIRE_DATE.to_string(),
                        message: format!("ignoring hire date of employee {employee_code}: {e}"),
                    });
                    None
                }
            },
        };

        let active = match row.non_null(columns::IS_ACTIVE) {
            Some(SourceValue::Bool(b)) => *b,
            Some(SourceValue::Int(i)) => *i != 0,
            Some(SourceValue::Text(s)) => !matches!(s.trim(), "0" | "false" | "False" | "FALSE"),
            _ => true,
        };

        let updated_at = row
            .non_null(columns::UPDATE_TIME)
            .and_then(|value| coerce_timestamp(value, columns::UPDATE_TIME, self.offset).ok());

        let record = EmployeeRecord {
            employee_code,
            first_name: optional_text(row, columns::FIRST_NAME).unwrap_or_default(),
            last_name: optional_text(row, columns::LAST_NAME),
            hired_on,
            active,
        };
        Ok((record, updated_at))
    }
}

/// Reads an ordering-key value as a [`Position`].
///
/// Sequence keys are integers (or numeric text); timestamp keys become UTC
/// epoch milliseconds.
///
/// # Errors
///
/// Fails if the value cannot be read as `kind`.
pub fn key_position(
    value: &SourceValue,
    column: &str,
    kind: KeyKind,
    offset: FixedOffset,
) -> Result<Position, MappingError> {
    match kind {
        KeyKind::Sequence => match value {
            SourceValue::Int(i) => Ok(Position(*i)),
            SourceValue::Text(s) => s
                .trim()
                .parse::<i64>()
                .map(Position)
                .map_err(|_| MappingError::invalid(column, format!("`{s}` is not an integer key"))),
            SourceValue::Null => Err(MappingError::missing(column)),
            other => Err(MappingError::wrong_type(column, "integer", other.type_name())),
        },
        KeyKind::Timestamp => {
            coerce_timestamp(value, column, offset).map(|ts| Position(ts.timestamp_millis()))
        }
    }
}

/// Coerces a source date/time value to a UTC timestamp.
///
/// Naive datetimes (SQL Server `datetime`, text without offset) are taken to
/// be at `offset`. Integers are Unix seconds.
///
/// # Errors
///
/// Fails if the value is not a recognizable date/time.
pub fn coerce_timestamp(
    value: &SourceValue,
    column: &str,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, MappingError> {
    match value {
        SourceValue::DateTime(naive) => local_to_utc(naive, column, offset),
        SourceValue::DateTimeOffset(dt) => Ok(dt.with_timezone(&Utc)),
        SourceValue::Int(secs) => DateTime::<Utc>::from_timestamp(*secs, 0)
            .ok_or_else(|| MappingError::invalid(column, format!("{secs} is out of range"))),
        SourceValue::Text(raw) => {
            let trimmed = raw.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Some(naive) = NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
            {
                return local_to_utc(&naive, column, offset);
            }
            if let Some(midnight) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
            {
                return local_to_utc(&midnight, column, offset);
            }
            Err(MappingError::invalid(column, format!("`{trimmed}` is not a date/time")))
        }
        SourceValue::Null => Err(MappingError::missing(column)),
        other => Err(MappingError::wrong_type(column, "datetime", other.type_name())),
    }
}

fn coerce_date(value: &SourceValue, column: &str, offset: FixedOffset) -> Result<NaiveDate, MappingError> {
    match value {
        SourceValue::DateTime(naive) => Ok(naive.date()),
        SourceValue::Text(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .or_else(|_| coerce_timestamp(value, column, offset).map(|ts| ts.with_timezone(&offset).date_naive()))
            .map_err(|_| MappingError::invalid(column, format!("`{}` is not a date", raw.trim()))),
        other => coerce_timestamp(other, column, offset).map(|ts| ts.with_timezone(&offset).date_naive()),
    }
}

fn local_to_utc(
    naive: &NaiveDateTime,
    column: &str,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, MappingError> {
    offset
        .from_local_datetime(naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| MappingError::invalid(column, format!("{naive} is not representable")))
}

fn required_text(row: &SourceRow, column: &str) -> Result<String, MappingError> {
    match row.non_null(column) {
        Some(SourceValue::Text(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(SourceValue::Text(_)) | None => Err(MappingError::missing(column)),
        Some(SourceValue::Int(i)) => Ok(i.to_string()),
        Some(other) => Err(MappingError::wrong_type(column, "text", other.type_name())),
    }
}

fn optional_text(row: &SourceRow, column: &str) -> Option<String> {
    match row.non_null(column)? {
        SourceValue::Text(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        SourceValue::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn required_timestamp(
    row: &SourceRow,
    column: &str,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, MappingError> {
    let value = row
        .non_null(column)
        .ok_or_else(|| MappingError::missing(column))?;
    coerce_timestamp(value, column, offset)
}

/// Reads a money column. An absent column is a schema problem; NULL is zero.
fn amount(row: &SourceRow, column: &str) -> Result<f64, MappingError> {
    match row.get(column) {
        None => Err(MappingError::missing(column)),
        Some(SourceValue::Null) => Ok(0.0),
        Some(SourceValue::Float(f)) => Ok(*f),
        Some(SourceValue::Int(i)) => Ok(*i as f64),
        Some(SourceValue::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| MappingError::invalid(column, format!("`{s}` is not a number"))),
        Some(other) => Err(MappingError::wrong_type(column, "number", other.type_name())),
    }
}
