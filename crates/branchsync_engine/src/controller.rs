//! Sync controller: the command surface and one supervised session per
//! branch.
//!
//! A session moves through `connecting → {backfilling → incremental}` with
//! `paused`/`error` side states and `stopping → idle` on stop. Each session
//! is a supervisor task that owns the branch's connection pool and spawns
//! one worker per in-scope entity. A connection failure anywhere drains the
//! workers and sends the supervisor back to `connecting` after a backoff;
//! nothing short of a stop command ends a session.
//!
//! Per-branch operations serialize on an async slot lock, so at most one
//! session per branch is ever live.

use crate::config::EngineConfig;
use crate::connection::{self, ConnectionPool};
use crate::delivery::TargetStore;
use crate::error::{ConnectionError, EngineError, EngineResult};
use crate::extract::ExtractionPipeline;
use crate::source::SourceConnector;
use crate::status::{
    BranchStatus, EntityState, EntityStatus, LogSubscription, SessionState, StatusBoard,
    StatusError, StatusReporter,
};
use crate::worker::{EntityWorker, WorkerExit};
use branchsync_core::{
    BranchConfig, BranchConfigStore, BranchId, ConfigError, EntityKind, Position, SyncLogEvent,
    SyncMode, WatermarkStore,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Reply = oneshot::Sender<EngineResult<()>>;
type Slot = Arc<AsyncMutex<Option<SessionHandle>>>;

/// Operator actions forwarded to a live session.
enum Command {
    Resume(EntityKind, Reply),
    Reset(EntityKind, Reply),
}

struct SessionHandle {
    id: Uuid,
    stop: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

struct Shared<C: SourceConnector, T: TargetStore> {
    configs: Arc<BranchConfigStore>,
    watermarks: Arc<dyn WatermarkStore>,
    connector: Arc<C>,
    target: Arc<T>,
    engine: EngineConfig,
    board: Arc<StatusBoard>,
    sessions: Mutex<HashMap<BranchId, Slot>>,
}

impl<C: SourceConnector, T: TargetStore> Shared<C, T> {
    fn publish(&self, event: SyncLogEvent) {
        self.board.publish(event);
    }

    async fn stored_watermark(
        &self,
        branch: &BranchId,
        entity: EntityKind,
    ) -> EngineResult<Option<Position>> {
        let watermarks = Arc::clone(&self.watermarks);
        let branch = branch.clone();
        let mark = tokio::task::spawn_blocking(move || watermarks.get(&branch, entity))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
        Ok(mark.map(|w| w.position))
    }

    async fn reset_watermark(&self, branch: &BranchId, entity: EntityKind) -> EngineResult<()> {
        let watermarks = Arc::clone(&self.watermarks);
        let key = branch.clone();
        tokio::task::spawn_blocking(move || watermarks.reset(&key, entity))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
        self.board.reset_entity(branch, entity);
        self.publish(
            SyncLogEvent::info(
                branch.clone(),
                format!("watermark for {entity} reset, next run backfills from the beginning"),
            )
            .for_entity(entity),
        );
        Ok(())
    }
}

/// Orchestrates sync sessions for every configured branch.
///
/// # Example
///
/// ```rust,ignore
/// let controller = SyncController::new(configs, watermarks, connector, target, EngineConfig::default());
/// controller.start_sync(&BranchId::new("riyadh-01")).await?;
/// let mut log = controller.subscribe(&BranchId::new("riyadh-01"));
/// while let Some(event) = log.recv().await {
///     println!("{}", event.message);
/// }
/// ```
pub struct SyncController<C: SourceConnector, T: TargetStore> {
    shared: Arc<Shared<C, T>>,
}

impl<C: SourceConnector, T: TargetStore> Clone for SyncController<C, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: SourceConnector, T: TargetStore> SyncController<C, T> {
    /// Creates a controller. No session is started.
    pub fn new(
        configs: Arc<BranchConfigStore>,
        watermarks: Arc<dyn WatermarkStore>,
        connector: Arc<C>,
        target: Arc<T>,
        engine: EngineConfig,
    ) -> Self {
        let board = Arc::new(StatusBoard::new(engine.log_capacity));
        Self {
            shared: Arc::new(Shared {
                configs,
                watermarks,
                connector,
                target,
                engine,
                board,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn slot(&self, branch: &BranchId) -> Slot {
        Arc::clone(self.shared.sessions.lock().entry(branch.clone()).or_default())
    }

    /// Returns every configured branch, ordered by id.
    pub fn load_branches(&self) -> Vec<BranchConfig> {
        self.shared.configs.list()
    }

    /// Validates and stores a branch configuration.
    ///
    /// A live session keeps the configuration it started with; the new one
    /// applies from the next start.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] on validation or persistence failure.
    pub fn save_config(&self, config: BranchConfig) -> EngineResult<()> {
        let branch = config.branch.clone();
        self.shared.configs.put(config)?;
        self.shared
            .publish(SyncLogEvent::info(branch, "branch configuration saved"));
        Ok(())
    }

    /// Opens a throwaway connection with `config` and pings it.
    ///
    /// Reads and writes no engine state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if `config` is invalid, or
    /// [`EngineError::Connection`] with the failure reason.
    pub async fn test_connection(&self, config: &BranchConfig) -> EngineResult<()> {
        config.validate().map_err(ConfigError::from)?;
        connection::test_connection(Arc::clone(&self.shared.connector), config, &self.shared.engine)
            .await?;
        Ok(())
    }

    /// Starts a session for `branch`.
    ///
    /// If a session is already live this is a no-op returning its status.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the branch is not configured.
    pub async fn start_sync(&self, branch: &BranchId) -> EngineResult<BranchStatus> {
        let slot = self.slot(branch);
        let mut guard = slot.lock().await;
        if guard.as_ref().is_some_and(SessionHandle::is_live) {
            return Ok(self.shared.board.snapshot(branch));
        }
        let config = self.shared.configs.get(branch)?;
        *guard = Some(self.launch(config).await?);
        Ok(self.shared.board.snapshot(branch))
    }

    /// Clears every watermark of `branch` and starts a session, which
    /// re-backfills all in-scope entities.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionActive`] unless the branch is idle.
    pub async fn sync_historical_data(&self, branch: &BranchId) -> EngineResult<BranchStatus> {
        let slot = self.slot(branch);
        let mut guard = slot.lock().await;
        if guard.as_ref().is_some_and(SessionHandle::is_live) {
            return Err(EngineError::SessionActive(branch.clone()));
        }
        let config = self.shared.configs.get(branch)?;
        self.shared.publish(SyncLogEvent::info(
            branch.clone(),
            "historical re-sync requested",
        ));
        for scope in &config.entities {
            self.shared.reset_watermark(branch, scope.kind).await?;
        }
        *guard = Some(self.launch(config).await?);
        Ok(self.shared.board.snapshot(branch))
    }

    async fn launch(&self, config: BranchConfig) -> EngineResult<SessionHandle> {
        let branch = config.branch.clone();
        let mut entities = Vec::with_capacity(config.entities.len());
        for scope in &config.entities {
            let watermark = self.shared.stored_watermark(&branch, scope.kind).await?;
            let state = match watermark {
                Some(_) => EntityState::Incremental,
                None => EntityState::Backfilling,
            };
            entities.push((scope.kind, state, watermark));
        }

        let id = Uuid::new_v4();
        self.shared.board.begin_session(&branch, id, entities);
        self.shared
            .publish(SyncLogEvent::info(branch.clone(), format!("sync session {id} started")));

        let stop = CancellationToken::new();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let session = Session {
            shared: Arc::clone(&self.shared),
            pool: ConnectionPool::new(
                Arc::clone(&self.shared.connector),
                config.clone(),
                &self.shared.engine,
            ),
            config,
            paused: BTreeSet::new(),
            stop: stop.clone(),
            commands,
        };
        let task = tokio::spawn(session.run());

        Ok(SessionHandle {
            id,
            stop,
            commands: commands_tx,
            task,
        })
    }

    /// Stops the session for `branch`.
    ///
    /// In-flight batches run to their watermark before the session goes
    /// idle; this call waits for that. Stopping an idle branch is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotAuthorized`] if `authorized` is false.
    pub async fn stop_sync(&self, branch: &BranchId, authorized: bool) -> EngineResult<BranchStatus> {
        if !authorized {
            tracing::warn!(%branch, "refused unauthorized stop request");
            return Err(EngineError::NotAuthorized);
        }
        let slot = self.slot(branch);
        let mut guard = slot.lock().await;
        if let Some(handle) = guard.take() {
            if handle.is_live() {
                self.shared.board.set_state(branch, SessionState::Stopping);
                self.shared.publish(SyncLogEvent::info(
                    branch.clone(),
                    format!("stopping sync session {}", handle.id),
                ));
            }
            handle.stop.cancel();
            handle
                .task
                .await
                .map_err(|e| EngineError::Task(e.to_string()))?;
        }
        Ok(self.shared.board.snapshot(branch))
    }

    /// Stops every live session.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotAuthorized`] if `authorized` is false.
    pub async fn shutdown(&self, authorized: bool) -> EngineResult<()> {
        if !authorized {
            tracing::warn!("refused unauthorized shutdown request");
            return Err(EngineError::NotAuthorized);
        }
        let branches: Vec<BranchId> = self.shared.sessions.lock().keys().cloned().collect();
        for branch in branches {
            self.stop_sync(&branch, true).await?;
        }
        tracing::info!("all sync sessions stopped");
        Ok(())
    }

    /// Current status of `branch`.
    ///
    /// A branch that has not run since the engine started reports its
    /// stored watermarks, with each entity in the state it would start in.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the branch is not configured.
    pub fn get_status(&self, branch: &BranchId) -> EngineResult<BranchStatus> {
        let config = self.shared.configs.get(branch)?;
        let mut status = self.shared.board.snapshot(branch);
        if status.entities.is_empty() {
            for scope in &config.entities {
                let watermark = self
                    .shared
                    .watermarks
                    .get(branch, scope.kind)?
                    .map(|w| w.position);
                let state = match watermark {
                    Some(_) => EntityState::Incremental,
                    None => EntityState::Backfilling,
                };
                status.entities.insert(
                    scope.kind,
                    EntityStatus {
                        state,
                        last_watermark: watermark,
                        last_error: None,
                        records_synced: 0,
                    },
                );
            }
        }
        Ok(status)
    }

    /// Subscribes to the live log of `branch`.
    pub fn subscribe(&self, branch: &BranchId) -> LogSubscription {
        self.shared.board.subscribe(branch)
    }

    /// Read-only status and log view, for observers that must not control
    /// sessions.
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(Arc::clone(&self.shared.board))
    }

    /// Resumes a paused entity.
    ///
    /// Resuming an entity that is not paused, or while the branch is idle,
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInScope`] if `entity` is not synced for
    /// `branch`.
    pub async fn resume(&self, branch: &BranchId, entity: EntityKind) -> EngineResult<()> {
        self.check_scope(branch, entity)?;
        let slot = self.slot(branch);
        let guard = slot.lock().await;
        let Some(handle) = guard.as_ref().filter(|h| h.is_live()) else {
            return Ok(());
        };
        let (reply, response) = oneshot::channel();
        handle
            .commands
            .send(Command::Resume(entity, reply))
            .map_err(|_| EngineError::SessionEnded(branch.clone()))?;
        drop(guard);
        response
            .await
            .map_err(|_| EngineError::SessionEnded(branch.clone()))?
    }

    /// Clears the watermark of one entity so it backfills from the
    /// beginning.
    ///
    /// On a live session a running worker first finishes its in-flight
    /// batch; this call returns once the reset is done.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInScope`] if `entity` is not synced for
    /// `branch`, or the watermark store's error.
    pub async fn reset(&self, branch: &BranchId, entity: EntityKind) -> EngineResult<()> {
        self.check_scope(branch, entity)?;
        let slot = self.slot(branch);
        let guard = slot.lock().await;
        let Some(handle) = guard.as_ref().filter(|h| h.is_live()) else {
            return self.shared.reset_watermark(branch, entity).await;
        };
        let (reply, response) = oneshot::channel();
        handle
            .commands
            .send(Command::Reset(entity, reply))
            .map_err(|_| EngineError::SessionEnded(branch.clone()))?;
        drop(guard);
        response
            .await
            .map_err(|_| EngineError::SessionEnded(branch.clone()))?
    }

    fn check_scope(&self, branch: &BranchId, entity: EntityKind) -> EngineResult<()> {
        let config = self.shared.configs.get(branch)?;
        if config.scope(entity).is_none() {
            return Err(EngineError::NotInScope {
                branch: branch.clone(),
                entity,
            });
        }
        Ok(())
    }
}

/// Worker bookkeeping for one connected stretch of a session.
struct Epoch {
    token: CancellationToken,
    exits_tx: mpsc::UnboundedSender<(EntityKind, WorkerExit)>,
    exits: mpsc::UnboundedReceiver<(EntityKind, WorkerExit)>,
    workers: HashMap<EntityKind, CancellationToken>,
    pending_resets: HashMap<EntityKind, Reply>,
    lost: Option<ConnectionError>,
}

impl Epoch {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }
}

/// Supervisor of one branch session.
struct Session<C: SourceConnector, T: TargetStore> {
    shared: Arc<Shared<C, T>>,
    config: BranchConfig,
    pool: ConnectionPool<C>,
    paused: BTreeSet<EntityKind>,
    stop: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<C: SourceConnector, T: TargetStore> Session<C, T> {
    fn branch(&self) -> BranchId {
        self.config.branch.clone()
    }

    fn publish(&self, event: SyncLogEvent) {
        self.shared.publish(event);
    }

    async fn run(mut self) {
        let branch = self.branch();
        let mut attempt = 0u32;

        loop {
            self.shared.board.set_state(&branch, SessionState::Connecting);
            self.publish(SyncLogEvent::info(
                branch.clone(),
                format!(
                    "connecting to {}:{}/{}",
                    self.config.host, self.config.port, self.config.database
                ),
            ));

            let probe = tokio::select! {
                () = self.stop.cancelled() => break,
                result = self.pool.probe() => result,
            };
            if let Err(e) = probe {
                attempt = attempt.saturating_add(1);
                if !self.wait_to_reconnect(&e, attempt).await {
                    break;
                }
                continue;
            }
            self.check_target().await;

            match self.run_epoch().await {
                None => break,
                Some(e) => {
                    // Backoff restarts after a connected stretch.
                    attempt = 1;
                    if !self.wait_to_reconnect(&e, attempt).await {
                        break;
                    }
                }
            }
        }

        self.shared.board.set_state(&branch, SessionState::Stopping);
        self.pool.close();
        self.shared.board.end_session(&branch);
        self.publish(SyncLogEvent::info(branch, "sync stopped"));
    }

    async fn check_target(&self) {
        let target = Arc::clone(&self.shared.target);
        let outcome = tokio::task::spawn_blocking(move || target.ping()).await;
        if let Ok(Err(e)) = outcome {
            self.publish(
                SyncLogEvent::warn(self.branch(), format!("target store did not answer ping: {e}"))
                    .with_error(e.kind()),
            );
        }
    }

    /// Records `error` and sleeps for the backoff delay, handling operator
    /// commands meanwhile. Returns false if stopped.
    async fn wait_to_reconnect(&mut self, error: &ConnectionError, attempt: u32) -> bool {
        let delay = self.shared.engine.reconnect.delay_for_attempt(attempt);
        self.shared
            .board
            .set_error(&self.config.branch, StatusError::new(error.kind(), error.to_string()));
        self.publish(
            SyncLogEvent::warn(
                self.branch(),
                format!("source connection failed ({error}), retry {attempt} in {delay:?}"),
            )
            .with_error(error.kind()),
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = self.stop.cancelled() => return false,
                () = &mut sleep => return true,
                Some(command) = self.commands.recv() => self.handle_command(command, None).await,
            }
        }
    }

    /// Runs workers until the session is stopped (`None`) or the source
    /// connection is lost.
    async fn run_epoch(&mut self) -> Option<ConnectionError> {
        let branch = self.branch();
        let token = self.stop.child_token();
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let mut epoch = Epoch {
            token: token.clone(),
            exits_tx,
            exits,
            workers: HashMap::new(),
            pending_resets: HashMap::new(),
            lost: None,
        };
        let health = self
            .pool
            .spawn_health_check(self.shared.engine.health_check_interval, token.clone());

        let entities: Vec<EntityKind> = self
            .config
            .entities
            .iter()
            .map(|scope| scope.kind)
            .filter(|kind| !self.paused.contains(kind))
            .collect();
        for entity in entities {
            self.spawn_worker(&mut epoch, entity).await;
        }
        let state = self.shared.board.mark_running(&branch);
        tracing::debug!(%branch, ?state, workers = epoch.workers.len(), "session running");

        loop {
            if !epoch.is_live() && epoch.workers.is_empty() {
                break;
            }
            let draining = !epoch.is_live();
            tokio::select! {
                Some((entity, exit)) = epoch.exits.recv() => {
                    self.on_exit(&mut epoch, entity, exit).await;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command, Some(&mut epoch)).await;
                }
                () = token.cancelled(), if !draining => {
                    tracing::debug!(%branch, in_flight = epoch.workers.len(), "draining workers");
                }
            }
        }

        let _ = health.await;
        for (_, reply) in epoch.pending_resets.drain() {
            let _ = reply.send(Err(EngineError::SessionEnded(branch.clone())));
        }
        if self.stop.is_cancelled() {
            None
        } else {
            epoch.lost
        }
    }

    async fn on_exit(&mut self, epoch: &mut Epoch, entity: EntityKind, exit: WorkerExit) {
        epoch.workers.remove(&entity);
        match exit {
            WorkerExit::Stopped => {}
            WorkerExit::Paused(e) => self.pause(entity, &e),
            WorkerExit::ConnectionLost(e) => {
                tracing::debug!(branch = %self.config.branch, %entity, error = %e, "worker lost its connection");
                epoch.lost.get_or_insert(e);
                epoch.token.cancel();
            }
        }

        if let Some(reply) = epoch.pending_resets.remove(&entity) {
            let result = self.reset_entity(entity).await;
            if result.is_ok() && epoch.is_live() {
                self.spawn_worker(epoch, entity).await;
            }
            let _ = reply.send(result);
        }
    }

    async fn handle_command(&mut self, command: Command, epoch: Option<&mut Epoch>) {
        match command {
            Command::Resume(entity, reply) => {
                if self.paused.remove(&entity) {
                    self.publish(
                        SyncLogEvent::info(self.branch(), format!("resuming {entity}"))
                            .for_entity(entity),
                    );
                    if let Some(epoch) = epoch.filter(|e| e.is_live()) {
                        self.spawn_worker(epoch, entity).await;
                    }
                }
                let _ = reply.send(Ok(()));
            }
            Command::Reset(entity, reply) => match epoch {
                Some(epoch) if epoch.workers.contains_key(&entity) => {
                    // The worker stops after its in-flight batch; the reset
                    // runs when it exits.
                    if let Some(worker) = epoch.workers.get(&entity) {
                        worker.cancel();
                    }
                    if let Some(earlier) = epoch.pending_resets.insert(entity, reply) {
                        let _ = earlier.send(Ok(()));
                    }
                }
                epoch => {
                    let result = self.reset_entity(entity).await;
                    if result.is_ok() {
                        if let Some(epoch) = epoch.filter(|e| e.is_live()) {
                            self.spawn_worker(epoch, entity).await;
                        }
                    }
                    let _ = reply.send(result);
                }
            },
        }
    }

    /// Parks `entity` until an operator resumes or resets it.
    fn pause(&mut self, entity: EntityKind, error: &EngineError) {
        let branch = self.branch();
        let kind = error.kind();
        self.paused.insert(entity);
        self.shared
            .board
            .record_entity_error(&branch, entity, StatusError::new(kind, error.to_string()));
        self.shared
            .board
            .set_entity_state(&branch, entity, EntityState::Paused);
        self.publish(
            SyncLogEvent::error(branch, format!("{entity} paused: {error}"))
                .for_entity(entity)
                .with_error(kind),
        );
    }

    async fn reset_entity(&mut self, entity: EntityKind) -> EngineResult<()> {
        self.shared.reset_watermark(&self.config.branch, entity).await?;
        self.paused.remove(&entity);
        Ok(())
    }

    async fn spawn_worker(&mut self, epoch: &mut Epoch, entity: EntityKind) {
        let branch = self.branch();
        let Some(scope) = self.config.scope(entity).cloned() else {
            return;
        };

        let watermark = match self.shared.stored_watermark(&branch, entity).await {
            Ok(watermark) => watermark,
            Err(e) => {
                self.pause(entity, &e);
                return;
            }
        };

        let backfilling = self
            .shared
            .board
            .snapshot(&branch)
            .entities
            .get(&entity)
            .is_some_and(|e| e.state == EntityState::Backfilling);
        let mode = if watermark.is_none() || backfilling {
            SyncMode::Backfill
        } else {
            SyncMode::Incremental
        };

        let cancel = epoch.token.child_token();
        let worker = EntityWorker {
            pipeline: ExtractionPipeline::new(
                self.pool.clone(),
                &self.config,
                scope,
                watermark,
                self.shared.engine.page_size,
            ),
            mode,
            target: Arc::clone(&self.shared.target),
            watermarks: Arc::clone(&self.shared.watermarks),
            board: Arc::clone(&self.shared.board),
            delivery_retry: self.shared.engine.delivery.clone(),
            poll_interval: self.config.poll_interval(),
            cancel: cancel.clone(),
        };
        let exits = epoch.exits_tx.clone();
        tokio::spawn(async move {
            let exit = worker.run().await;
            let _ = exits.send((entity, exit));
        });
        epoch.workers.insert(entity, cancel);
    }
}
