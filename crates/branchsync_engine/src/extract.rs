//! Extraction pipeline: pages of source rows turned into delivery batches.
//!
//! A pipeline is built from the durable watermark of one (branch, entity)
//! stream and reads rows strictly above it, in key order, one page at a
//! time. Its cursor only moves when the caller commits a position after the
//! watermark has been durably advanced, so rebuilding a pipeline from the
//! stored watermark resumes exactly where the last delivered batch ended.
//!
//! Backfill and incremental extraction run the same query; backfill is
//! simply the state of a stream that has not yet seen a short page.

use crate::connection::ConnectionPool;
use crate::error::{EngineError, EngineResult};
use crate::source::{SourceConnection, SourceConnector, SourceQuery};
use branchsync_core::{
    BranchConfig, BranchId, DeliveryBatch, EntityKind, EntityScope, KeyKind, MappingError,
    MappingWarning, Position, SchemaMapper, SourceRow,
};

/// Column restricted by a branch's terminal filter.
const TERMINAL_COLUMN: &str = "terminal_sn";

/// One page of extracted rows after mapping.
#[derive(Debug, Clone)]
pub struct ExtractedBatch {
    /// Mapped records, ready for delivery.
    pub batch: DeliveryBatch,
    /// Rows skipped because they could not be mapped.
    pub failures: Vec<MappingError>,
    /// Non-fatal findings from mapping.
    pub warnings: Vec<MappingWarning>,
    /// The page was full, so more rows are probably waiting.
    pub full_page: bool,
}

/// Produces delivery batches for one (branch, entity) stream.
pub struct ExtractionPipeline<C: SourceConnector> {
    pool: ConnectionPool<C>,
    mapper: SchemaMapper,
    scope: EntityScope,
    equals: Option<(String, String)>,
    page_size: usize,
    cursor: Option<Position>,
}

impl<C: SourceConnector> ExtractionPipeline<C> {
    /// Creates a pipeline reading rows above `watermark`.
    pub fn new(
        pool: ConnectionPool<C>,
        config: &BranchConfig,
        scope: EntityScope,
        watermark: Option<Position>,
        page_size: usize,
    ) -> Self {
        let equals = match (scope.kind, &config.terminal_filter) {
            (EntityKind::AttendancePunch, Some(sn)) => {
                Some((TERMINAL_COLUMN.to_string(), sn.trim().to_string()))
            }
            _ => None,
        };
        Self {
            pool,
            mapper: SchemaMapper::for_branch(config),
            scope,
            equals,
            page_size: page_size.max(1),
            cursor: watermark,
        }
    }

    /// Branch of this stream.
    pub fn branch(&self) -> &BranchId {
        self.pool.branch()
    }

    /// Entity of this stream.
    pub fn entity(&self) -> EntityKind {
        self.scope.kind
    }

    /// Position the next page starts after.
    pub fn cursor(&self) -> Option<Position> {
        self.cursor
    }

    /// Moves the cursor after the watermark was durably advanced to
    /// `position`.
    pub fn commit(&mut self, position: Position) {
        if self.cursor.map_or(true, |cursor| position > cursor) {
            self.cursor = Some(position);
        }
    }

    /// Reads and maps the next page.
    ///
    /// Returns `Ok(None)` when no rows are above the cursor.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Connection`] if the source could not be queried
    /// - [`EngineError::SchemaMismatch`] if no row of a non-empty page
    ///   could be mapped and every row lacks a column the mapping needs.
    ///   Rows that only hold bad values are skipped instead.
    pub async fn next_batch(&mut self) -> EngineResult<Option<ExtractedBatch>> {
        let mut limit = self.page_size;
        let (rows, full_page) = loop {
            let mut rows = self.fetch(limit).await?;
            if rows.is_empty() {
                return Ok(None);
            }
            let full_page = rows.len() >= limit;
            if full_page && self.scope.key_kind == KeyKind::Timestamp {
                // Rows sharing the page's last timestamp may continue on the
                // next page, and the cursor can only express "after". Hold
                // that group back so it is read whole next time.
                let kept = self.complete_groups(&rows);
                if kept == 0 {
                    limit = limit.saturating_mul(2);
                    continue;
                }
                rows.truncate(kept);
            }
            break (rows, full_page);
        };

        self.map_page(rows, full_page).map(Some)
    }

    async fn fetch(&self, limit: usize) -> EngineResult<Vec<SourceRow>> {
        let query = SourceQuery {
            table: self.scope.table().to_string(),
            key_column: self.scope.key_column().to_string(),
            key_kind: self.scope.key_kind,
            after: self.cursor,
            limit,
            equals: self.equals.clone(),
            utc_offset: self.mapper.offset(),
        };
        let conn = self.pool.acquire().await?;
        let (_conn, rows) = conn
            .call(self.pool.query_timeout(), move |c| c.fetch(&query))
            .await?;
        Ok(rows)
    }

    /// Number of leading rows whose position differs from the last row's.
    fn complete_groups(&self, rows: &[SourceRow]) -> usize {
        let positions: Vec<Option<Position>> = rows
            .iter()
            .map(|row| self.mapper.position_of(&self.scope, row).ok())
            .collect();
        match positions.last().copied().flatten() {
            Some(last) => positions.iter().take_while(|p| **p != Some(last)).count(),
            None => rows.len(),
        }
    }

    fn map_page(&self, rows: Vec<SourceRow>, full_page: bool) -> EngineResult<ExtractedBatch> {
        let source_rows = rows.len();
        let mut records = Vec::with_capacity(source_rows);
        let mut failures = Vec::new();
        let mut warnings = Vec::new();
        let mut high_water = self.cursor;
        // Failures on columns the row does not have at all, as opposed to
        // columns that are present but NULL or malformed.
        let mut absent_columns = 0usize;

        for row in &rows {
            if let Ok(position) = self.mapper.position_of(&self.scope, row) {
                high_water = Some(high_water.map_or(position, |hw| hw.max(position)));
            }
            match self.mapper.map(&self.scope, row) {
                Ok(mapped) => {
                    records.push(mapped.record);
                    warnings.extend(mapped.warnings);
                }
                Err(e) => {
                    if row.get(&e.field).is_none() {
                        absent_columns += 1;
                    }
                    failures.push(e);
                }
            }
        }

        if records.is_empty() && absent_columns == source_rows {
            let first = failures
                .into_iter()
                .next()
                .unwrap_or_else(|| MappingError::missing(self.scope.key_column()));
            return Err(EngineError::SchemaMismatch {
                entity: self.scope.kind,
                rows: source_rows,
                first,
            });
        }

        let high_water = high_water.unwrap_or_else(|| {
            records
                .iter()
                .map(|r| r.position)
                .max()
                .unwrap_or(Position(0))
        });
        tracing::debug!(
            branch = %self.pool.branch(),
            entity = %self.scope.kind,
            rows = source_rows,
            mapped = records.len(),
            %high_water,
            "extracted page"
        );

        Ok(ExtractedBatch {
            batch: DeliveryBatch {
                branch: self.pool.branch().clone(),
                entity: self.scope.kind,
                records,
                high_water,
                source_rows,
            },
            failures,
            warnings,
            full_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::source::MemorySource;
    use branchsync_core::{CredentialRef, ConnectionReason};
    use std::sync::Arc;

    fn config() -> BranchConfig {
        BranchConfig::new("b1", "10.0.0.1", "ERP", CredentialRef::inline("sa", "pw"))
    }

    fn employee(id: i64) -> SourceRow {
        SourceRow::new()
            .with("id", id)
            .with("emp_code", format!("E{id}"))
            .with("first_name", format!("Emp {id}"))
    }

    fn pipeline(
        source: &MemorySource,
        config: &BranchConfig,
        scope: EntityScope,
        watermark: Option<Position>,
        page_size: usize,
    ) -> ExtractionPipeline<MemorySource> {
        let pool = ConnectionPool::new(Arc::new(source.clone()), config.clone(), &EngineConfig::default());
        ExtractionPipeline::new(pool, config, scope, watermark, page_size)
    }

    #[tokio::test]
    async fn pages_through_table_in_key_order() {
        let source = MemorySource::new();
        source.insert_many("personnel_employee", (1..=5).rev().map(employee));
        let mut p = pipeline(&source, &config(), EntityScope::new(EntityKind::Employee), None, 2);

        let first = p.next_batch().await.unwrap().unwrap();
        assert!(first.full_page);
        assert_eq!(first.batch.high_water, Position(2));
        let keys: Vec<_> = first.batch.records.iter().map(|r| r.natural_key.to_string()).collect();
        assert_eq!(keys, vec!["E1", "E2"]);

        // Without a commit the same page comes back.
        let again = p.next_batch().await.unwrap().unwrap();
        assert_eq!(again.batch.high_water, Position(2));

        p.commit(Position(2));
        p.commit(Position(4));
        let third = p.next_batch().await.unwrap().unwrap();
        assert!(!third.full_page);
        assert_eq!(third.batch.len(), 1);

        p.commit(third.batch.high_water);
        assert!(p.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rebuilding_from_watermark_resumes() {
        let source = MemorySource::new();
        source.insert_many("personnel_employee", (1..=4).map(employee));
        let mut p = pipeline(
            &source,
            &config(),
            EntityScope::new(EntityKind::Employee),
            Some(Position(3)),
            10,
        );
        let batch = p.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.batch.len(), 1);
        assert_eq!(batch.batch.high_water, Position(4));
    }

    #[tokio::test]
    async fn unmappable_rows_are_skipped_but_counted() {
        let source = MemorySource::new();
        source.insert_many("personnel_employee", (1..=10).map(employee));
        source.insert("personnel_employee", SourceRow::new().with("id", 11i64));
        let mut p = pipeline(&source, &config(), EntityScope::new(EntityKind::Employee), None, 100);

        let batch = p.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.batch.len(), 10);
        assert_eq!(batch.batch.source_rows, 11);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.batch.high_water, Position(11));
    }

    #[tokio::test]
    async fn page_of_null_values_is_skipped_not_fatal() {
        let source = MemorySource::new();
        source.insert(
            "personnel_employee",
            employee(4).with("emp_code", branchsync_core::SourceValue::Null),
        );
        let mut p = pipeline(
            &source,
            &config(),
            EntityScope::new(EntityKind::Employee),
            Some(Position(3)),
            100,
        );

        let batch = p.next_batch().await.unwrap().unwrap();
        assert!(batch.batch.is_empty());
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].field, "emp_code");
        assert_eq!(batch.batch.high_water, Position(4));
    }

    #[tokio::test]
    async fn renamed_column_is_a_schema_mismatch() {
        let source = MemorySource::new();
        source.insert_many("personnel_employee", (1..=3).map(employee));
        source.rename_column("personnel_employee", "emp_code", "employee_code");
        let mut p = pipeline(&source, &config(), EntityScope::new(EntityKind::Employee), None, 100);

        match p.next_batch().await {
            Err(EngineError::SchemaMismatch { entity, rows, first }) => {
                assert_eq!(entity, EntityKind::Employee);
                assert_eq!(rows, 3);
                assert_eq!(first.field, "emp_code");
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
        assert_eq!(p.cursor(), None);
    }

    #[tokio::test]
    async fn timestamp_ties_stay_on_one_page() {
        let source = MemorySource::new();
        let punch = |id: i64, emp: &str, time: &str| {
            SourceRow::new()
                .with("id", id)
                .with("emp_code", emp)
                .with("punch_time", time)
                .with("punch_state", "0")
                .with("terminal_sn", "T1")
        };
        source.insert_many(
            "iclock_transaction",
            [
                punch(1, "A", "2025-03-01 08:00:00"),
                punch(2, "A", "2025-03-01 08:05:00"),
                punch(3, "B", "2025-03-01 08:05:00"),
                punch(4, "C", "2025-03-01 08:05:00"),
                punch(5, "D", "2025-03-01 09:00:00"),
            ],
        );
        let scope = EntityScope::new(EntityKind::AttendancePunch)
            .with_key("punch_time", KeyKind::Timestamp);
        let mut p = pipeline(&source, &config(), scope, None, 2);

        let first = p.next_batch().await.unwrap().unwrap();
        assert_eq!(first.batch.len(), 1);
        p.commit(first.batch.high_water);

        // The three 08:05 rows do not fit a page of two; the page grows.
        let second = p.next_batch().await.unwrap().unwrap();
        assert_eq!(second.batch.len(), 3);
        p.commit(second.batch.high_water);

        let third = p.next_batch().await.unwrap().unwrap();
        assert_eq!(third.batch.len(), 1);
        assert!(!third.full_page);
    }

    #[tokio::test]
    async fn terminal_filter_limits_punches() {
        let source = MemorySource::new();
        for (id, sn) in [(1, "T1"), (2, "T2"), (3, "T1")] {
            source.insert(
                "iclock_transaction",
                SourceRow::new()
                    .with("id", id as i64)
                    .with("emp_code", "A")
                    .with("punch_time", format!("2025-03-01 08:0{id}:00"))
                    .with("punch_state", 0i64)
                    .with("terminal_sn", sn),
            );
        }
        let config = config().with_terminal_filter("T1");
        let mut p = pipeline(&source, &config, EntityScope::new(EntityKind::AttendancePunch), None, 10);

        let batch = p.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.batch.len(), 2);
        assert_eq!(batch.batch.high_water, Position(3));
    }

    #[tokio::test]
    async fn fetch_failure_is_a_connection_error() {
        let source = MemorySource::new();
        source.insert("personnel_employee", employee(1));
        source.fail_next_fetch(ConnectionReason::Network);
        let mut p = pipeline(&source, &config(), EntityScope::new(EntityKind::Employee), None, 10);

        assert!(matches!(p.next_batch().await, Err(EngineError::Connection(_))));
        assert!(p.next_batch().await.unwrap().is_some());
    }
}
