//! Status snapshots and the per-branch log stream.
//!
//! The controller writes into a [`StatusBoard`]; operators read through a
//! [`StatusReporter`], which has no mutating methods. Each branch has its
//! own broadcast channel, so a slow or dropped subscriber never affects
//! producers or other subscribers.

use branchsync_core::{BranchId, EntityKind, ErrorKind, Position, Severity, SyncLogEvent, SyncMode};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// State of a branch's sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No active session.
    Idle,
    /// Probing the source database.
    Connecting,
    /// At least one entity is still backfilling.
    Backfilling,
    /// Every running entity is polling incrementally.
    Incremental,
    /// Every entity is paused on a fatal condition.
    Paused,
    /// Waiting to reconnect after a connectivity failure.
    Error,
    /// Finishing in-flight batches before going idle.
    Stopping,
}

impl SessionState {
    /// Returns true when no session is active.
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// Returns true while entity pipelines are running.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SessionState::Backfilling | SessionState::Incremental | SessionState::Paused
        )
    }
}

/// State of one entity stream within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Paging through the full source table.
    Backfilling,
    /// Polling for rows above the watermark.
    Incremental,
    /// Stopped on a fatal condition until resumed or reset.
    Paused,
}

/// The most recent error recorded for a branch or entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    /// Classification.
    pub kind: ErrorKind,
    /// Message.
    pub message: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl StatusError {
    /// Creates an error stamped with the current time.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Progress of one entity stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStatus {
    /// Stream state.
    pub state: EntityState,
    /// Durable watermark position.
    pub last_watermark: Option<Position>,
    /// Most recent error.
    pub last_error: Option<StatusError>,
    /// Records accepted by the target since the engine started.
    pub records_synced: u64,
}

/// Snapshot of a branch returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStatus {
    /// Branch.
    pub branch: BranchId,
    /// Session state.
    pub state: SessionState,
    /// Aggregate mode: backfill while any entity backfills.
    pub mode: Option<SyncMode>,
    /// Identifier of the live session.
    pub session_id: Option<Uuid>,
    /// When the live session started.
    pub started_at: Option<DateTime<Utc>>,
    /// Most recent session-level error (connectivity).
    pub last_error: Option<StatusError>,
    /// Per-entity progress.
    pub entities: BTreeMap<EntityKind, EntityStatus>,
}

impl BranchStatus {
    /// Status of a branch that has never run.
    pub fn idle(branch: BranchId) -> Self {
        Self {
            branch,
            state: SessionState::Idle,
            mode: None,
            session_id: None,
            started_at: None,
            last_error: None,
            entities: BTreeMap::new(),
        }
    }

    fn derive_mode(&self) -> Option<SyncMode> {
        let states = || self.entities.values().map(|e| e.state);
        if states().any(|s| s == EntityState::Backfilling) {
            Some(SyncMode::Backfill)
        } else if states().any(|s| s == EntityState::Incremental) {
            Some(SyncMode::Incremental)
        } else {
            None
        }
    }

    fn derive_running_state(&self) -> SessionState {
        match self.derive_mode() {
            Some(SyncMode::Backfill) => SessionState::Backfilling,
            Some(SyncMode::Incremental) => SessionState::Incremental,
            None => SessionState::Paused,
        }
    }
}

struct BranchChannel {
    status: BranchStatus,
    sender: broadcast::Sender<SyncLogEvent>,
}

/// Shared status and log channels for every branch.
pub(crate) struct StatusBoard {
    branches: RwLock<HashMap<BranchId, BranchChannel>>,
    capacity: usize,
}

impl StatusBoard {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            branches: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn with_branch<R>(&self, branch: &BranchId, f: impl FnOnce(&mut BranchChannel) -> R) -> R {
        let mut branches = self.branches.write();
        let channel = branches.entry(branch.clone()).or_insert_with(|| BranchChannel {
            status: BranchStatus::idle(branch.clone()),
            sender: broadcast::channel(self.capacity).0,
        });
        f(channel)
    }

    /// Appends an event to the branch log and mirrors it to `tracing`.
    pub(crate) fn publish(&self, event: SyncLogEvent) {
        mirror(&event);
        let sender = self.with_branch(&event.branch, |c| c.sender.clone());
        // No subscribers is fine.
        let _ = sender.send(event);
    }

    pub(crate) fn snapshot(&self, branch: &BranchId) -> BranchStatus {
        self.branches
            .read()
            .get(branch)
            .map(|c| c.status.clone())
            .unwrap_or_else(|| BranchStatus::idle(branch.clone()))
    }

    pub(crate) fn subscribe(&self, branch: &BranchId) -> LogSubscription {
        let rx = self.with_branch(branch, |c| c.sender.subscribe());
        LogSubscription {
            branch: branch.clone(),
            rx,
        }
    }

    pub(crate) fn begin_session(
        &self,
        branch: &BranchId,
        session_id: Uuid,
        entities: impl IntoIterator<Item = (EntityKind, EntityState, Option<Position>)>,
    ) {
        self.with_branch(branch, |c| {
            let status = &mut c.status;
            status.state = SessionState::Connecting;
            status.session_id = Some(session_id);
            status.started_at = Some(Utc::now());
            status.last_error = None;
            let previous = std::mem::take(&mut status.entities);
            for (entity, state, watermark) in entities {
                let records_synced = previous.get(&entity).map_or(0, |e| e.records_synced);
                status.entities.insert(
                    entity,
                    EntityStatus {
                        state,
                        last_watermark: watermark,
                        last_error: None,
                        records_synced,
                    },
                );
            }
            status.mode = status.derive_mode();
        });
    }

    pub(crate) fn set_state(&self, branch: &BranchId, state: SessionState) {
        self.with_branch(branch, |c| c.status.state = state);
    }

    /// Switches to the state derived from the entity states.
    pub(crate) fn mark_running(&self, branch: &BranchId) -> SessionState {
        self.with_branch(branch, |c| {
            c.status.state = c.status.derive_running_state();
            c.status.mode = c.status.derive_mode();
            c.status.state
        })
    }

    pub(crate) fn set_error(&self, branch: &BranchId, error: StatusError) {
        self.with_branch(branch, |c| {
            c.status.state = SessionState::Error;
            c.status.last_error = Some(error);
        });
    }

    pub(crate) fn set_entity_state(&self, branch: &BranchId, entity: EntityKind, state: EntityState) {
        self.with_branch(branch, |c| {
            if let Some(e) = c.status.entities.get_mut(&entity) {
                e.state = state;
            }
            c.status.mode = c.status.derive_mode();
            if c.status.state.is_running() {
                c.status.state = c.status.derive_running_state();
            }
        });
    }

    pub(crate) fn record_delivery(
        &self,
        branch: &BranchId,
        entity: EntityKind,
        watermark: Position,
        accepted: usize,
    ) {
        self.with_branch(branch, |c| {
            if let Some(e) = c.status.entities.get_mut(&entity) {
                e.last_watermark = Some(watermark);
                e.records_synced = e.records_synced.saturating_add(accepted as u64);
            }
        });
    }

    pub(crate) fn record_entity_error(&self, branch: &BranchId, entity: EntityKind, error: StatusError) {
        self.with_branch(branch, |c| {
            if let Some(e) = c.status.entities.get_mut(&entity) {
                e.last_error = Some(error);
            }
        });
    }

    pub(crate) fn reset_entity(&self, branch: &BranchId, entity: EntityKind) {
        self.with_branch(branch, |c| {
            if let Some(e) = c.status.entities.get_mut(&entity) {
                e.last_watermark = None;
                e.last_error = None;
                e.state = EntityState::Backfilling;
            }
            c.status.mode = c.status.derive_mode();
            if c.status.state.is_running() {
                c.status.state = c.status.derive_running_state();
            }
        });
    }

    pub(crate) fn end_session(&self, branch: &BranchId) {
        self.with_branch(branch, |c| {
            c.status.state = SessionState::Idle;
            c.status.mode = None;
            c.status.session_id = None;
            c.status.started_at = None;
        });
    }
}

fn mirror(event: &SyncLogEvent) {
    let entity = event.entity.map_or("-", |e| e.as_str());
    match event.severity {
        Severity::Info => {
            tracing::info!(branch = %event.branch, entity, "{}", event.message);
        }
        Severity::Warn => {
            tracing::warn!(branch = %event.branch, entity, error = ?event.error, "{}", event.message);
        }
        Severity::Error => {
            tracing::error!(branch = %event.branch, entity, error = ?event.error, "{}", event.message);
        }
    }
}

/// Read-only view of branch status and logs.
#[derive(Clone)]
pub struct StatusReporter {
    board: Arc<StatusBoard>,
}

impl StatusReporter {
    pub(crate) fn new(board: Arc<StatusBoard>) -> Self {
        Self { board }
    }

    /// Current status of `branch`.
    pub fn current_status(&self, branch: &BranchId) -> BranchStatus {
        self.board.snapshot(branch)
    }

    /// Subscribes to `branch`'s log stream from now on.
    pub fn subscribe(&self, branch: &BranchId) -> LogSubscription {
        self.board.subscribe(branch)
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter").finish_non_exhaustive()
    }
}

/// Live, unbounded sequence of a branch's log events.
///
/// Dropping the subscription cancels it.
#[derive(Debug)]
pub struct LogSubscription {
    branch: BranchId,
    rx: broadcast::Receiver<SyncLogEvent>,
}

impl LogSubscription {
    /// Branch this subscription follows.
    pub fn branch(&self) -> &BranchId {
        &self.branch
    }

    /// Waits for the next event.
    ///
    /// Events dropped because this subscriber fell behind are skipped.
    /// Returns `None` only once the engine is gone.
    pub async fn recv(&mut self) -> Option<SyncLogEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(branch = %self.branch, skipped, "log subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<SyncLogEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b1() -> BranchId {
        BranchId::new("b1")
    }

    #[tokio::test]
    async fn subscribers_receive_events_independently() {
        let board = StatusBoard::new(16);
        let mut first = board.subscribe(&b1());
        let second = board.subscribe(&b1());

        board.publish(SyncLogEvent::info(b1(), "connecting"));
        drop(second);
        board.publish(SyncLogEvent::warn(b1(), "unknown punch state"));

        assert_eq!(first.recv().await.unwrap().message, "connecting");
        assert_eq!(first.recv().await.unwrap().severity, Severity::Warn);
    }

    #[tokio::test]
    async fn branches_have_separate_streams() {
        let board = StatusBoard::new(16);
        let mut sub = board.subscribe(&BranchId::new("b2"));
        board.publish(SyncLogEvent::info(b1(), "for b1"));
        board.publish(SyncLogEvent::info(BranchId::new("b2"), "for b2"));

        assert_eq!(sub.recv().await.unwrap().message, "for b2");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn lagging_subscriber_skips_ahead() {
        let board = StatusBoard::new(2);
        let mut sub = board.subscribe(&b1());
        for i in 0..5 {
            board.publish(SyncLogEvent::info(b1(), format!("event {i}")));
        }
        assert_eq!(sub.try_recv().unwrap().message, "event 3");
        assert_eq!(sub.try_recv().unwrap().message, "event 4");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn session_state_follows_entities() {
        let board = StatusBoard::new(4);
        board.begin_session(
            &b1(),
            Uuid::new_v4(),
            [
                (EntityKind::AttendancePunch, EntityState::Backfilling, None),
                (EntityKind::SalesVoucher, EntityState::Incremental, Some(Position(7))),
            ],
        );
        assert_eq!(board.snapshot(&b1()).state, SessionState::Connecting);

        assert_eq!(board.mark_running(&b1()), SessionState::Backfilling);
        board.set_entity_state(&b1(), EntityKind::AttendancePunch, EntityState::Incremental);
        let status = board.snapshot(&b1());
        assert_eq!(status.state, SessionState::Incremental);
        assert_eq!(status.mode, Some(SyncMode::Incremental));

        board.set_entity_state(&b1(), EntityKind::AttendancePunch, EntityState::Paused);
        board.set_entity_state(&b1(), EntityKind::SalesVoucher, EntityState::Paused);
        assert_eq!(board.snapshot(&b1()).state, SessionState::Paused);

        board.set_error(&b1(), StatusError::new(ErrorKind::Storage, "disk full"));
        board.set_entity_state(&b1(), EntityKind::SalesVoucher, EntityState::Incremental);
        assert_eq!(board.snapshot(&b1()).state, SessionState::Error);

        board.end_session(&b1());
        let status = board.snapshot(&b1());
        assert!(status.state.is_idle());
        assert_eq!(
            status.entities[&EntityKind::SalesVoucher].last_watermark,
            Some(Position(7))
        );
    }

    #[test]
    fn deliveries_accumulate_across_sessions() {
        let board = StatusBoard::new(4);
        let entities = || [(EntityKind::Employee, EntityState::Backfilling, None)];
        board.begin_session(&b1(), Uuid::new_v4(), entities());
        board.record_delivery(&b1(), EntityKind::Employee, Position(3), 3);
        board.end_session(&b1());

        board.begin_session(&b1(), Uuid::new_v4(), entities());
        board.record_delivery(&b1(), EntityKind::Employee, Position(4), 1);
        let status = board.snapshot(&b1());
        assert_eq!(status.entities[&EntityKind::Employee].records_synced, 4);
    }

    #[test]
    fn snapshot_serializes_for_dashboards() {
        let board = StatusBoard::new(4);
        board.begin_session(
            &b1(),
            Uuid::new_v4(),
            [(EntityKind::Employee, EntityState::Backfilling, None)],
        );
        board.mark_running(&b1());
        board.record_delivery(&b1(), EntityKind::Employee, Position(12), 12);

        let status = board.snapshot(&b1());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "backfilling");
        assert_eq!(json["entities"]["employee"]["records_synced"], 12);

        let back: BranchStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn unknown_branch_is_idle() {
        let board = StatusBoard::new(4);
        let status = StatusReporter::new(Arc::new(board)).current_status(&b1());
        assert_eq!(status.state, SessionState::Idle);
        assert!(status.entities.is_empty());
    }
}
