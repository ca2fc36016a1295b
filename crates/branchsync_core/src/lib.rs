//! # BranchSync Core
//!
//! Data model, stores and schema mapping for BranchSync.
//!
//! This crate provides:
//! - Branch configuration and the keyed [`BranchConfigStore`]
//! - Durable per-(branch, entity) watermarks ([`WatermarkStore`])
//! - The source row value model ([`SourceRow`], [`SourceValue`])
//! - The pure [`SchemaMapper`] that turns source rows into
//!   [`CanonicalRecord`]s
//! - Log event types shared by the engine and its observers
//!
//! ## Key Invariants
//!
//! - A watermark never moves backward
//! - Mapping is pure: the same row always maps to the same record
//! - Unknown enumeration codes decode to an `Unknown` variant, never an error
//! - Configuration is validated on write, not on read

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod config_store;
mod error;
mod event;
mod mapper;
mod persist;
mod record;
mod row;
mod types;
mod watermark;
mod watermark_file;

pub use config::{BranchConfig, CredentialRef, EntityScope, SecretRef, TlsPolicy};
pub use config_store::BranchConfigStore;
pub use error::{
    ConfigError, ConfigResult, MappingError, MappingReason, ValidationError, WatermarkError,
    WatermarkResult,
};
pub use event::{ConnectionReason, ErrorKind, Severity, SyncLogEvent};
pub use mapper::{coerce_timestamp, key_position, Mapped, MappingWarning, SchemaMapper};
pub use record::{
    CanonicalRecord, DeliveryBatch, EmployeeRecord, NaturalKey, PunchRecord, PunchState,
    RecordPayload, VerifyType, VoucherRecord, VoucherType,
};
pub use row::{SourceRow, SourceValue};
pub use types::{BranchId, EntityKind, KeyKind, Position, SyncMode};
pub use watermark::{MemoryWatermarkStore, Watermark, WatermarkStore};
pub use watermark_file::FileWatermarkStore;
