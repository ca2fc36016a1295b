//! Delivery layer: idempotent upserts into the target store.

use crate::config::RetryConfig;
use crate::error::DeliveryError;
use branchsync_core::{BranchId, CanonicalRecord, DeliveryBatch, EntityKind, NaturalKey};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of delivering one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryResult {
    /// Records written.
    pub accepted: usize,
    /// Records permanently refused, with the target's reason.
    pub rejected: Vec<(CanonicalRecord, String)>,
}

/// The cloud datastore the engine writes into.
///
/// `upsert` must be idempotent: writing a record whose natural key already
/// exists replaces it, so redelivering a batch leaves the same state as
/// delivering it once. A batch is one transactional unit; on `Err` nothing
/// from it may be visible.
pub trait TargetStore: Send + Sync + 'static {
    /// Upserts every record of `batch` keyed by natural key.
    fn upsert(&self, batch: &DeliveryBatch) -> Result<DeliveryResult, DeliveryError>;

    /// Cheap reachability check.
    fn ping(&self) -> Result<(), DeliveryError>;
}

/// Delivers `batch`, retrying retryable failures with backoff.
///
/// Retries are unbounded. If `cancel` fires while waiting between attempts
/// the last error is returned, leaving the watermark where it was.
pub async fn deliver_with_retry<T, F>(
    target: &Arc<T>,
    batch: DeliveryBatch,
    retry: &RetryConfig,
    cancel: &CancellationToken,
    mut on_retry: F,
) -> Result<DeliveryResult, DeliveryError>
where
    T: TargetStore,
    F: FnMut(&DeliveryError, u32, Duration),
{
    let batch = Arc::new(batch);
    let mut attempt = 0u32;
    loop {
        let target = Arc::clone(target);
        let shared = Arc::clone(&batch);
        let result = tokio::task::spawn_blocking(move || target.upsert(&shared))
            .await
            .unwrap_or_else(|join| Err(DeliveryError::retryable(format!("delivery task failed: {join}"))));

        match result {
            Err(e) if e.is_retryable() => {
                attempt = attempt.saturating_add(1);
                let delay = retry.delay_for_attempt(attempt);
                on_retry(&e, attempt, delay);
                tokio::select! {
                    () = cancel.cancelled() => return Err(e),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            other => return other,
        }
    }
}

type RejectRule = Box<dyn Fn(&CanonicalRecord) -> Option<String> + Send + Sync>;
type RecordKey = (BranchId, EntityKind, NaturalKey);

#[derive(Default)]
struct TargetState {
    records: HashMap<RecordKey, CanonicalRecord>,
    faults: VecDeque<DeliveryError>,
    reject: Option<RejectRule>,
}

/// In-memory target store with fault injection.
///
/// Re-synced natural keys are overwritten by the latest extraction.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    state: Arc<Mutex<TargetState>>,
    unreachable: Arc<AtomicBool>,
    upserts: Arc<AtomicUsize>,
}

impl MemoryTarget {
    /// Creates an empty target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for an upcoming upsert.
    pub fn fail_next(&self, error: DeliveryError) {
        self.state.lock().faults.push_back(error);
    }

    /// Makes every upsert and ping fail with a retryable error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Installs a permanent per-record rejection rule.
    pub fn reject_when<F>(&self, rule: F)
    where
        F: Fn(&CanonicalRecord) -> Option<String> + Send + Sync + 'static,
    {
        self.state.lock().reject = Some(Box::new(rule));
    }

    /// Records stored for (branch, entity), ordered by source position.
    pub fn records(&self, branch: &BranchId, entity: EntityKind) -> Vec<CanonicalRecord> {
        let mut records: Vec<CanonicalRecord> = self
            .state
            .lock()
            .records
            .iter()
            .filter(|((b, e, _), _)| b == branch && *e == entity)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.natural_key.cmp(&b.natural_key))
        });
        records
    }

    /// Total stored records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of upsert calls, failed ones included.
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTarget")
            .field("records", &self.len())
            .field("upserts", &self.upsert_calls())
            .finish()
    }
}

impl TargetStore for MemoryTarget {
    fn upsert(&self, batch: &DeliveryBatch) -> Result<DeliveryResult, DeliveryError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DeliveryError::retryable("target store is unreachable"));
        }

        let mut state = self.state.lock();
        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }

        let mut result = DeliveryResult::default();
        let mut accepted = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            match state.reject.as_ref().and_then(|rule| rule(record)) {
                Some(reason) => result.rejected.push((record.clone(), reason)),
                None => accepted.push(record.clone()),
            }
        }
        result.accepted = accepted.len();
        for record in accepted {
            let key = (record.branch.clone(), record.entity(), record.natural_key.clone());
            state.records.insert(key, record);
        }
        Ok(result)
    }

    fn ping(&self) -> Result<(), DeliveryError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DeliveryError::retryable("target store is unreachable"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchsync_core::{EmployeeRecord, Position, RecordPayload};

    fn employee(code: &str, position: i64, active: bool) -> CanonicalRecord {
        CanonicalRecord {
            branch: BranchId::new("b1"),
            natural_key: NaturalKey::compose([code]),
            position: Position(position),
            source_timestamp: None,
            payload: RecordPayload::Employee(EmployeeRecord {
                employee_code: code.into(),
                first_name: format!("emp {code}"),
                last_name: None,
                hired_on: None,
                active,
            }),
        }
    }

    fn batch(records: Vec<CanonicalRecord>) -> DeliveryBatch {
        let high_water = records.iter().map(|r| r.position).max().unwrap_or(Position(0));
        DeliveryBatch {
            branch: BranchId::new("b1"),
            entity: EntityKind::Employee,
            source_rows: records.len(),
            records,
            high_water,
        }
    }

    #[test]
    fn redelivery_is_idempotent() {
        let target = MemoryTarget::new();
        let b = batch(vec![employee("1", 1, true), employee("2", 2, true)]);

        let first = target.upsert(&b).unwrap();
        let snapshot = target.records(&BranchId::new("b1"), EntityKind::Employee);
        let second = target.upsert(&b).unwrap();

        assert_eq!(first, second);
        assert_eq!(target.records(&BranchId::new("b1"), EntityKind::Employee), snapshot);
        assert_eq!(target.len(), 2);
    }

    #[test]
    fn latest_extraction_overwrites() {
        let target = MemoryTarget::new();
        target.upsert(&batch(vec![employee("1", 1, true)])).unwrap();
        target.upsert(&batch(vec![employee("1", 9, false)])).unwrap();

        let stored = target.records(&BranchId::new("b1"), EntityKind::Employee);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].position, Position(9));
    }

    #[test]
    fn failed_batch_writes_nothing() {
        let target = MemoryTarget::new();
        target.fail_next(DeliveryError::retryable("deadlock victim"));
        assert!(target.upsert(&batch(vec![employee("1", 1, true)])).is_err());
        assert!(target.is_empty());
    }

    #[test]
    fn rejected_records_are_reported() {
        let target = MemoryTarget::new();
        target.reject_when(|r| (r.natural_key.as_str() == "2").then(|| "duplicate badge".to_string()));

        let result = target
            .upsert(&batch(vec![employee("1", 1, true), employee("2", 2, true)]))
            .unwrap();
        assert_eq!(result.accepted, 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].1, "duplicate badge");
    }

    #[tokio::test]
    async fn retryable_failures_are_retried() {
        let target = Arc::new(MemoryTarget::new());
        target.fail_next(DeliveryError::retryable("503"));
        target.fail_next(DeliveryError::retryable("503"));

        let mut retries = Vec::new();
        let result = deliver_with_retry(
            &target,
            batch(vec![employee("1", 1, true)]),
            &RetryConfig::fixed(Duration::from_millis(1)),
            &CancellationToken::new(),
            |_, attempt, _| retries.push(attempt),
        )
        .await
        .unwrap();

        assert_eq!(result.accepted, 1);
        assert_eq!(retries, vec![1, 2]);
        assert_eq!(target.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let target = Arc::new(MemoryTarget::new());
        target.fail_next(DeliveryError::fatal("schema rejected"));

        let err = deliver_with_retry(
            &target,
            batch(vec![employee("1", 1, true)]),
            &RetryConfig::fixed(Duration::from_millis(1)),
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .await
        .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(target.upsert_calls(), 1);
    }

    #[tokio::test]
    async fn cancel_abandons_retry() {
        let target = Arc::new(MemoryTarget::new());
        target.set_unreachable(true);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = deliver_with_retry(
            &target,
            batch(vec![employee("1", 1, true)]),
            &RetryConfig::fixed(Duration::from_secs(60)),
            &cancel,
            |_, _, _| {},
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert!(target.is_empty());
    }
}
