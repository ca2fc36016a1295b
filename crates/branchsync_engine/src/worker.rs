//! Per-entity sync loop.
//!
//! One worker runs per in-scope entity of a live session. Each iteration is
//! extract → map → deliver → advance watermark, always in that order; the
//! stop signal is only looked at between iterations, so a batch that has
//! started is carried through to its watermark. The incremental poll wait,
//! by contrast, is cancelled immediately.

use crate::config::RetryConfig;
use crate::delivery::{deliver_with_retry, DeliveryResult, TargetStore};
use crate::error::{ConnectionError, EngineError};
use crate::extract::{ExtractedBatch, ExtractionPipeline};
use crate::source::SourceConnector;
use crate::status::{EntityState, StatusBoard};
use branchsync_core::{
    BranchId, EntityKind, ErrorKind, Position, SyncLogEvent, SyncMode, WatermarkStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a worker returned.
#[derive(Debug)]
pub(crate) enum WorkerExit {
    /// The stop signal was honored.
    Stopped,
    /// A fatal per-entity condition; waits for resume or reset.
    Paused(EngineError),
    /// The source became unreachable; the session reconnects.
    ConnectionLost(ConnectionError),
}

/// Everything one entity loop needs.
pub(crate) struct EntityWorker<C: SourceConnector, T: TargetStore> {
    pub(crate) pipeline: ExtractionPipeline<C>,
    pub(crate) mode: SyncMode,
    pub(crate) target: Arc<T>,
    pub(crate) watermarks: Arc<dyn WatermarkStore>,
    pub(crate) board: Arc<StatusBoard>,
    pub(crate) delivery_retry: RetryConfig,
    pub(crate) poll_interval: Duration,
    pub(crate) cancel: CancellationToken,
}

impl<C: SourceConnector, T: TargetStore> EntityWorker<C, T> {
    fn branch(&self) -> BranchId {
        self.pipeline.branch().clone()
    }

    fn entity(&self) -> EntityKind {
        self.pipeline.entity()
    }

    fn publish(&self, event: SyncLogEvent) {
        self.board.publish(event.for_entity(self.entity()));
    }

    /// Runs until stopped, paused or disconnected.
    pub(crate) async fn run(mut self) -> WorkerExit {
        let state = match self.mode {
            SyncMode::Backfill => EntityState::Backfilling,
            SyncMode::Incremental => EntityState::Incremental,
        };
        self.board.set_entity_state(&self.branch(), self.entity(), state);
        if self.mode == SyncMode::Backfill {
            self.publish(SyncLogEvent::info(
                self.branch(),
                format!("starting backfill of {}", self.entity()),
            ));
        }

        loop {
            if self.cancel.is_cancelled() {
                return WorkerExit::Stopped;
            }

            match self.pipeline.next_batch().await {
                Ok(Some(extracted)) => {
                    let full_page = extracted.full_page;
                    if let Err(exit) = self.process(extracted).await {
                        return exit;
                    }
                    if full_page {
                        continue;
                    }
                    self.caught_up();
                }
                Ok(None) => self.caught_up(),
                Err(EngineError::Connection(e)) => return WorkerExit::ConnectionLost(e),
                Err(e) => return WorkerExit::Paused(e),
            }

            tokio::select! {
                () = self.cancel.cancelled() => return WorkerExit::Stopped,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn caught_up(&mut self) {
        if self.mode == SyncMode::Backfill {
            self.mode = SyncMode::Incremental;
            self.board
                .set_entity_state(&self.branch(), self.entity(), EntityState::Incremental);
            self.publish(SyncLogEvent::info(
                self.branch(),
                format!("backfill of {} complete, switching to incremental", self.entity()),
            ));
        }
    }

    async fn process(&mut self, extracted: ExtractedBatch) -> Result<(), WorkerExit> {
        let ExtractedBatch {
            batch,
            failures,
            warnings,
            ..
        } = extracted;

        for warning in &warnings {
            self.publish(SyncLogEvent::warn(self.branch(), warning.message.clone()));
        }
        for failure in &failures {
            self.publish(
                SyncLogEvent::warn(self.branch(), format!("skipped row: {failure}"))
                    .with_error(ErrorKind::Mapping),
            );
        }

        let high_water = batch.high_water;
        let records = batch.len();
        let result = self.deliver(batch).await?;
        for (record, reason) in &result.rejected {
            self.publish(
                SyncLogEvent::warn(
                    self.branch(),
                    format!("target rejected {}: {reason}", record.natural_key),
                )
                .with_error(ErrorKind::Delivery { retryable: false }),
            );
        }

        self.advance(high_water).await?;
        self.board
            .record_delivery(&self.branch(), self.entity(), high_water, result.accepted);
        self.publish(SyncLogEvent::info(
            self.branch(),
            format!(
                "synced {} of {records} {} records, watermark {high_water}",
                result.accepted,
                self.entity()
            ),
        ));
        Ok(())
    }

    async fn deliver(
        &self,
        batch: branchsync_core::DeliveryBatch,
    ) -> Result<DeliveryResult, WorkerExit> {
        if batch.is_empty() {
            return Ok(DeliveryResult::default());
        }
        let records = batch.records.clone();
        let branch = self.branch();
        let entity = self.entity();
        let board = Arc::clone(&self.board);

        let outcome = deliver_with_retry(
            &self.target,
            batch,
            &self.delivery_retry,
            &self.cancel,
            |error, attempt, delay| {
                board.publish(
                    SyncLogEvent::warn(
                        branch.clone(),
                        format!("delivery attempt {attempt} failed ({error}), retrying in {delay:?}"),
                    )
                    .for_entity(entity)
                    .with_error(error.kind()),
                );
            },
        )
        .await;

        match outcome {
            Ok(result) => Ok(result),
            // Only returned once the stop signal cut the retries short.
            Err(e) if e.is_retryable() => {
                self.publish(
                    SyncLogEvent::warn(
                        self.branch(),
                        format!("stopped before batch was delivered: {e}"),
                    )
                    .with_error(e.kind()),
                );
                Err(WorkerExit::Stopped)
            }
            Err(e) => {
                self.publish(
                    SyncLogEvent::error(
                        self.branch(),
                        format!("target refused batch of {} records: {e}", records.len()),
                    )
                    .with_error(e.kind()),
                );
                Ok(DeliveryResult {
                    accepted: 0,
                    rejected: records
                        .into_iter()
                        .map(|record| (record, e.message.clone()))
                        .collect(),
                })
            }
        }
    }

    async fn advance(&mut self, position: Position) -> Result<(), WorkerExit> {
        let watermarks = Arc::clone(&self.watermarks);
        let branch = self.branch();
        let entity = self.entity();
        let outcome =
            tokio::task::spawn_blocking(move || watermarks.advance(&branch, entity, position))
                .await;

        let error = match outcome {
            Ok(Ok(_)) => {
                self.pipeline.commit(position);
                return Ok(());
            }
            Ok(Err(e)) => EngineError::from(e),
            Err(join) => EngineError::Task(join.to_string()),
        };
        Err(WorkerExit::Paused(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::connection::ConnectionPool;
    use crate::delivery::MemoryTarget;
    use crate::error::DeliveryError;
    use crate::source::MemorySource;
    use branchsync_core::{
        BranchConfig, CredentialRef, EntityScope, MemoryWatermarkStore, SourceRow,
    };
    use uuid::Uuid;

    struct Fixture {
        source: MemorySource,
        target: Arc<MemoryTarget>,
        watermarks: Arc<MemoryWatermarkStore>,
        board: Arc<StatusBoard>,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: MemorySource::new(),
                target: Arc::new(MemoryTarget::new()),
                watermarks: Arc::new(MemoryWatermarkStore::new()),
                board: Arc::new(StatusBoard::new(256)),
                cancel: CancellationToken::new(),
            }
        }

        fn worker(&self, page_size: usize) -> EntityWorker<MemorySource, MemoryTarget> {
            let config = BranchConfig::new("b1", "h", "db", CredentialRef::inline("sa", "pw"));
            let pool = ConnectionPool::new(
                Arc::new(self.source.clone()),
                config.clone(),
                &EngineConfig::default(),
            );
            let watermark = self
                .watermarks
                .get(&config.branch, EntityKind::Employee)
                .unwrap()
                .map(|w| w.position);
            self.board.begin_session(
                &config.branch,
                Uuid::new_v4(),
                [(EntityKind::Employee, EntityState::Backfilling, watermark)],
            );
            self.board.mark_running(&config.branch);
            EntityWorker {
                pipeline: ExtractionPipeline::new(
                    pool,
                    &config,
                    EntityScope::new(EntityKind::Employee),
                    watermark,
                    page_size,
                ),
                mode: SyncMode::Backfill,
                target: Arc::clone(&self.target),
                watermarks: self.watermarks.clone(),
                board: Arc::clone(&self.board),
                delivery_retry: RetryConfig::fixed(Duration::from_millis(1)),
                poll_interval: Duration::from_millis(10),
                cancel: self.cancel.clone(),
            }
        }

        fn watermark(&self) -> Option<Position> {
            self.watermarks
                .get(&BranchId::new("b1"), EntityKind::Employee)
                .unwrap()
                .map(|w| w.position)
        }
    }

    fn employee(id: i64) -> SourceRow {
        SourceRow::new()
            .with("id", id)
            .with("emp_code", format!("E{id}"))
            .with("first_name", "x")
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn drains_backfill_then_polls() {
        let fx = Fixture::new();
        fx.source.insert_many("personnel_employee", (1..=5).map(employee));
        let handle = tokio::spawn(fx.worker(2).run());

        wait_for(|| {
            fx.board.snapshot(&BranchId::new("b1")).entities[&EntityKind::Employee].state
                == EntityState::Incremental
        })
        .await;
        assert_eq!(fx.watermark(), Some(Position(5)));
        let status = fx.board.snapshot(&BranchId::new("b1"));
        assert_eq!(status.entities[&EntityKind::Employee].records_synced, 5);

        fx.source.insert("personnel_employee", employee(6));
        wait_for(|| fx.watermark() == Some(Position(6))).await;

        fx.cancel.cancel();
        assert!(matches!(handle.await.unwrap(), WorkerExit::Stopped));
        assert_eq!(fx.target.len(), 6);
    }

    #[tokio::test]
    async fn schema_mismatch_pauses() {
        let fx = Fixture::new();
        fx.source.insert_many("personnel_employee", (1..=3).map(employee));
        fx.source.rename_column("personnel_employee", "emp_code", "code");

        let exit = fx.worker(10).run().await;
        match exit {
            WorkerExit::Paused(e) => assert_eq!(e.kind(), ErrorKind::SchemaMismatch),
            other => panic!("expected pause, got {other:?}"),
        }
        assert_eq!(fx.watermark(), None);
        assert!(fx.target.is_empty());
    }

    #[tokio::test]
    async fn backward_watermark_pauses() {
        let fx = Fixture::new();
        fx.source.insert_many("personnel_employee", (1..=2).map(employee));
        let worker = fx.worker(10);
        // Another writer moved the stored watermark past this pipeline.
        fx.watermarks
            .advance(&BranchId::new("b1"), EntityKind::Employee, Position(50))
            .unwrap();

        match worker.run().await {
            WorkerExit::Paused(e) => assert_eq!(e.kind(), ErrorKind::Monotonicity),
            other => panic!("expected pause, got {other:?}"),
        }
        assert_eq!(fx.watermark(), Some(Position(50)));
    }

    #[tokio::test]
    async fn fatal_delivery_still_advances() {
        let fx = Fixture::new();
        fx.source.insert_many("personnel_employee", (1..=2).map(employee));
        fx.target.fail_next(DeliveryError::fatal("payload rejected"));
        let handle = tokio::spawn(fx.worker(10).run());

        wait_for(|| fx.watermark() == Some(Position(2))).await;
        fx.cancel.cancel();
        handle.await.unwrap();
        assert!(fx.target.is_empty());
    }

    #[tokio::test]
    async fn stop_during_delivery_retry_keeps_watermark() {
        let fx = Fixture::new();
        fx.source.insert_many("personnel_employee", (1..=2).map(employee));
        fx.target.set_unreachable(true);
        let handle = tokio::spawn(fx.worker(10).run());

        wait_for(|| fx.target.upsert_calls() >= 2).await;
        fx.cancel.cancel();
        assert!(matches!(handle.await.unwrap(), WorkerExit::Stopped));
        assert_eq!(fx.watermark(), None);
    }

    #[tokio::test]
    async fn fetch_failure_reports_connection_loss() {
        let fx = Fixture::new();
        fx.source.insert("personnel_employee", employee(1));
        fx.source.fail_next_fetch(branchsync_core::ConnectionReason::Network);

        let exit = fx.worker(10).run().await;
        assert!(matches!(exit, WorkerExit::ConnectionLost(_)));
    }
}
