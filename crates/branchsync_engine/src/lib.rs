//! # BranchSync Engine
//!
//! Sync controller and pipelines for BranchSync.
//!
//! This crate provides:
//! - Per-branch connection pooling with health checks
//! - Backfill and incremental extraction in source-key order
//! - Idempotent delivery with batch-level retry
//! - The sync controller state machine (one session per branch)
//! - Status snapshots and a broadcast log stream per branch
//! - In-memory source and target stores with fault injection
//! - A SQL Server source over TDS (`mssql` feature)
//!
//! ## Architecture
//!
//! Every (branch, entity) stream runs the same loop:
//! 1. Extract a page of rows above the durable watermark
//! 2. Map rows to canonical records, skipping unmappable rows
//! 3. Upsert the batch into the target store
//! 4. Advance the watermark to the page's highest source position
//!
//! Branches run as independent sessions; within a session every entity
//! has its own worker, so one slow table never holds up another.
//!
//! ## Key Invariants
//!
//! - At most one live session per branch
//! - A watermark advances only after its batch was delivered
//! - Batches of one stream are delivered in source-key order
//! - Connection failures are retried forever, never fatal
//! - A schema mismatch pauses only the affected entity

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod connection;
mod controller;
mod delivery;
mod error;
mod extract;
#[cfg(feature = "mssql")]
mod mssql;
mod source;
mod status;
mod worker;

pub use config::{EngineConfig, RetryConfig, MAX_POOL_SIZE};
pub use connection::{test_connection, ConnectionPool, PooledConnection};
pub use controller::SyncController;
pub use delivery::{deliver_with_retry, DeliveryResult, MemoryTarget, TargetStore};
pub use error::{ConnectionError, DeliveryError, EngineError, EngineResult};
pub use extract::{ExtractedBatch, ExtractionPipeline};
#[cfg(feature = "mssql")]
pub use mssql::{MssqlConnection, MssqlConnector};
pub use source::{MemoryConnection, MemorySource, SourceConnection, SourceConnector, SourceQuery};
pub use status::{
    BranchStatus, EntityState, EntityStatus, LogSubscription, SessionState, StatusError,
    StatusReporter,
};
