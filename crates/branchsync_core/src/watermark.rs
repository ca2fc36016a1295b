//! Watermarks and the store contract.
//!
//! A watermark is the highest source position known to be durably delivered
//! for one (branch, entity) stream. Stores enforce:
//!
//! - **Monotonicity**: `advance` never moves a watermark backward; equal
//!   positions are accepted.
//! - **Per-key serialization**: concurrent operations on the same key are
//!   serialized; different keys never contend on each other's lock.
//! - **Explicit reset**: the only way to clear a watermark is `reset`.

use crate::error::{WatermarkError, WatermarkResult};
use crate::types::{BranchId, EntityKind, Position};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Durable progress marker for one (branch, entity) stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Branch.
    pub branch: BranchId,
    /// Entity stream.
    pub entity: EntityKind,
    /// Highest delivered source position.
    pub position: Position,
    /// When the watermark last changed.
    pub updated_at: DateTime<Utc>,
}

/// Persistent per-(branch, entity) watermark storage.
pub trait WatermarkStore: Send + Sync {
    /// Returns the current watermark, or `None` if the stream has never
    /// delivered anything (or was reset).
    fn get(&self, branch: &BranchId, entity: EntityKind) -> WatermarkResult<Option<Watermark>>;

    /// Moves the watermark to `position`.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::Monotonicity`] if `position` is below the
    /// current watermark; the stored value is left unchanged.
    fn advance(
        &self,
        branch: &BranchId,
        entity: EntityKind,
        position: Position,
    ) -> WatermarkResult<Watermark>;

    /// Clears the watermark so the next run backfills from the beginning.
    fn reset(&self, branch: &BranchId, entity: EntityKind) -> WatermarkResult<()>;

    /// Returns every watermark recorded for `branch`, ordered by entity.
    fn list(&self, branch: &BranchId) -> WatermarkResult<Vec<Watermark>> {
        let mut marks = Vec::new();
        for entity in EntityKind::ALL {
            if let Some(mark) = self.get(branch, entity)? {
                marks.push(mark);
            }
        }
        Ok(marks)
    }
}

/// State behind one key's lock.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    /// Whether `value` reflects the backing medium.
    pub(crate) loaded: bool,
    pub(crate) value: Option<Watermark>,
}

/// Lock table giving each (branch, entity) key its own mutex.
#[derive(Debug, Default)]
pub(crate) struct SlotTable {
    slots: RwLock<HashMap<(BranchId, EntityKind), Arc<Mutex<Slot>>>>,
}

impl SlotTable {
    pub(crate) fn slot(&self, branch: &BranchId, entity: EntityKind) -> Arc<Mutex<Slot>> {
        let key = (branch.clone(), entity);
        if let Some(slot) = self.slots.read().get(&key) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(key).or_default())
    }
}

/// Builds the next watermark, rejecting backward moves.
pub(crate) fn next_watermark(
    current: Option<&Watermark>,
    branch: &BranchId,
    entity: EntityKind,
    position: Position,
) -> WatermarkResult<Watermark> {
    if let Some(current) = current {
        if position < current.position {
            return Err(WatermarkError::Monotonicity {
                branch: branch.clone(),
                entity,
                current: current.position,
                attempted: position,
            });
        }
    }
    Ok(Watermark {
        branch: branch.clone(),
        entity,
        position,
        updated_at: Utc::now(),
    })
}

/// Watermark store that lives only in memory.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    slots: SlotTable,
}

impl MemoryWatermarkStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn get(&self, branch: &BranchId, entity: EntityKind) -> WatermarkResult<Option<Watermark>> {
        Ok(self.slots.slot(branch, entity).lock().value.clone())
    }

    fn advance(
        &self,
        branch: &BranchId,
        entity: EntityKind,
        position: Position,
    ) -> WatermarkResult<Watermark> {
        let slot = self.slots.slot(branch, entity);
        let mut slot = slot.lock();
        let next = next_watermark(slot.value.as_ref(), branch, entity, position)?;
        slot.value = Some(next.clone());
        Ok(next)
    }

    fn reset(&self, branch: &BranchId, entity: EntityKind) -> WatermarkResult<()> {
        self.slots.slot(branch, entity).lock().value = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn b(id: &str) -> BranchId {
        BranchId::new(id)
    }

    #[test]
    fn advance_get_reset() {
        let store = MemoryWatermarkStore::new();
        let branch = b("b1");
        assert!(store.get(&branch, EntityKind::SalesVoucher).unwrap().is_none());

        store.advance(&branch, EntityKind::SalesVoucher, Position(3)).unwrap();
        store.advance(&branch, EntityKind::SalesVoucher, Position(3)).unwrap();
        let mark = store.get(&branch, EntityKind::SalesVoucher).unwrap().unwrap();
        assert_eq!(mark.position, Position(3));

        store.reset(&branch, EntityKind::SalesVoucher).unwrap();
        assert!(store.get(&branch, EntityKind::SalesVoucher).unwrap().is_none());
        store.advance(&branch, EntityKind::SalesVoucher, Position(1)).unwrap();
    }

    #[test]
    fn backward_advance_is_rejected_and_leaves_value() {
        let store = MemoryWatermarkStore::new();
        let branch = b("b1");
        store.advance(&branch, EntityKind::Employee, Position(10)).unwrap();

        let err = store
            .advance(&branch, EntityKind::Employee, Position(9))
            .unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(
            store.get(&branch, EntityKind::Employee).unwrap().unwrap().position,
            Position(10)
        );
    }

    #[test]
    fn keys_are_independent() {
        let store = MemoryWatermarkStore::new();
        store.advance(&b("b1"), EntityKind::Employee, Position(100)).unwrap();
        store.advance(&b("b2"), EntityKind::Employee, Position(1)).unwrap();
        store.advance(&b("b1"), EntityKind::AttendancePunch, Position(1)).unwrap();

        let listed: Vec<EntityKind> = store.list(&b("b1")).unwrap().iter().map(|m| m.entity).collect();
        assert_eq!(listed, vec![EntityKind::AttendancePunch, EntityKind::Employee]);
    }

    #[test]
    fn concurrent_advances_keep_the_maximum() {
        let store = Arc::new(MemoryWatermarkStore::new());
        let branch = b("b1");
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                let branch = branch.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        // Slower threads get rejected backward moves.
                        let _ = store.advance(&branch, EntityKind::AttendancePunch, Position(i * 8 + t));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mark = store.get(&branch, EntityKind::AttendancePunch).unwrap().unwrap();
        assert_eq!(mark.position, Position(199 * 8 + 7));
    }

    proptest! {
        #[test]
        fn watermark_never_decreases(positions in proptest::collection::vec(-1000i64..1000, 1..50)) {
            let store = MemoryWatermarkStore::new();
            let branch = b("p");
            let mut high: Option<i64> = None;

            for p in positions {
                let result = store.advance(&branch, EntityKind::SalesVoucher, Position(p));
                match high {
                    Some(h) if p < h => prop_assert!(result.is_err()),
                    _ => {
                        prop_assert!(result.is_ok());
                        high = Some(p);
                    }
                }
                let stored = store.get(&branch, EntityKind::SalesVoucher).unwrap().map(|m| m.position.0);
                prop_assert_eq!(stored, high);
            }
        }
    }
}
