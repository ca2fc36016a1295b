//! Per-branch connection pooling.
//!
//! Each branch session owns one [`ConnectionPool`]. Pools are never shared
//! across branches. The pool:
//!
//! - bounds open connections with a semaphore (at most
//!   [`MAX_POOL_SIZE`](crate::MAX_POOL_SIZE))
//! - never hands out a connection that reports itself broken
//! - pings idle connections on a timer and evicts the ones that fail;
//!   replacements are opened on the next `acquire`
//!
//! Driver calls are blocking, so they always run on the blocking pool under
//! a timeout.

use crate::config::EngineConfig;
use crate::error::ConnectionError;
use crate::source::{SourceConnection, SourceConnector};
use branchsync_core::{BranchConfig, BranchId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct PoolInner<C: SourceConnector> {
    branch: BranchId,
    connector: Arc<C>,
    config: BranchConfig,
    idle: Mutex<VecDeque<C::Connection>>,
    permits: Arc<Semaphore>,
    max_size: usize,
    closed: AtomicBool,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    query_timeout: Duration,
}

/// Bounded pool of connections to one branch database.
pub struct ConnectionPool<C: SourceConnector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: SourceConnector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: SourceConnector> ConnectionPool<C> {
    /// Creates an empty pool for `config`.
    pub fn new(connector: Arc<C>, config: BranchConfig, engine: &EngineConfig) -> Self {
        let max_size = engine.pool_size.clamp(1, crate::config::MAX_POOL_SIZE);
        Self {
            inner: Arc::new(PoolInner {
                branch: config.branch.clone(),
                connector,
                config,
                idle: Mutex::new(VecDeque::with_capacity(max_size)),
                permits: Arc::new(Semaphore::new(max_size)),
                max_size,
                closed: AtomicBool::new(false),
                acquire_timeout: engine.acquire_timeout,
                connect_timeout: engine.connect_timeout,
                query_timeout: engine.query_timeout,
            }),
        }
    }

    /// Branch this pool serves.
    pub fn branch(&self) -> &BranchId {
        &self.inner.branch
    }

    /// Timeout applied to each query on a pooled connection.
    pub fn query_timeout(&self) -> Duration {
        self.inner.query_timeout
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Checks out a healthy connection, opening one if none is idle.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] with reason `timeout` if no slot frees up
    /// in time, or whatever the driver reported while opening a connection.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, ConnectionError> {
        let permit = match tokio::time::timeout(
            self.inner.acquire_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ConnectionError::network("connection pool is closed")),
            Err(_) => {
                return Err(ConnectionError::timeout(format!(
                    "no pooled connection became free within {:?}",
                    self.inner.acquire_timeout
                )))
            }
        };

        loop {
            let candidate = self.inner.idle.lock().pop_front();
            match candidate {
                Some(conn) if !conn.is_broken() => {
                    return Ok(PooledConnection::new(conn, permit, Arc::clone(&self.inner)));
                }
                Some(_) => {
                    tracing::debug!(branch = %self.inner.branch, "evicted broken idle connection");
                }
                None => break,
            }
        }

        let conn = open_connection(
            Arc::clone(&self.inner.connector),
            self.inner.config.clone(),
            self.inner.connect_timeout,
        )
        .await?;
        tracing::debug!(branch = %self.inner.branch, "opened source connection");
        Ok(PooledConnection::new(conn, permit, Arc::clone(&self.inner)))
    }

    /// Acquires a connection and pings it.
    pub async fn probe(&self) -> Result<(), ConnectionError> {
        let conn = self.acquire().await?;
        conn.call(self.inner.query_timeout, |c| c.ping()).await?;
        Ok(())
    }

    /// Pings every idle connection once and evicts the ones that fail.
    ///
    /// Returns the number of evicted connections. Connections checked out
    /// by the pipeline are not touched.
    pub async fn check_idle(&self) -> usize {
        let count = self.idle_count();
        let mut evicted = 0;
        for _ in 0..count {
            let Ok(permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
                break;
            };
            let Some(conn) = self.inner.idle.lock().pop_front() else {
                break;
            };
            if conn.is_broken() {
                evicted += 1;
                continue;
            }
            let guard = PooledConnection::new(conn, permit, Arc::clone(&self.inner));
            if guard.call(self.inner.query_timeout, |c| c.ping()).await.is_err() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Runs [`check_idle`](Self::check_idle) every `interval` until
    /// `cancel` fires.
    pub fn spawn_health_check(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.check_idle().await;
                        if evicted > 0 {
                            tracing::info!(branch = %pool.inner.branch, evicted, "health check evicted idle connections");
                        }
                    }
                }
            }
        })
    }

    /// Drops idle connections and refuses further acquires.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.permits.close();
        self.inner.idle.lock().clear();
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping it returns the connection to the pool unless it is broken or a
/// call on it failed.
pub struct PooledConnection<C: SourceConnector> {
    conn: Option<C::Connection>,
    pool: Arc<PoolInner<C>>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: SourceConnector> PooledConnection<C> {
    fn new(conn: C::Connection, permit: OwnedSemaphorePermit, pool: Arc<PoolInner<C>>) -> Self {
        Self {
            conn: Some(conn),
            pool,
            discard: false,
            _permit: permit,
        }
    }

    /// Marks the connection as unusable; it is closed instead of returned.
    pub fn invalidate(&mut self) {
        self.discard = true;
    }

    /// Runs a blocking driver call on this connection under `timeout`.
    ///
    /// On success the connection is handed back for further use. Any error
    /// invalidates it.
    pub async fn call<R, F>(self, timeout: Duration, f: F) -> Result<(Self, R), ConnectionError>
    where
        R: Send + 'static,
        F: FnOnce(&mut C::Connection) -> Result<R, ConnectionError> + Send + 'static,
    {
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&abandoned);
        let mut guard = self;
        let task = tokio::task::spawn_blocking(move || {
            let result = match guard.conn.as_mut() {
                Some(conn) => f(conn),
                None => Err(ConnectionError::network("connection already released")),
            };
            if result.is_err() || flag.load(Ordering::SeqCst) {
                guard.invalidate();
            }
            (guard, result)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok((guard, Ok(value)))) => Ok((guard, value)),
            Ok(Ok((_guard, Err(e)))) => Err(e),
            Ok(Err(join)) => Err(ConnectionError::network(format!("driver call failed: {join}"))),
            Err(_) => {
                abandoned.store(true, Ordering::SeqCst);
                Err(ConnectionError::timeout(format!("query did not finish within {timeout:?}")))
            }
        }
    }
}

impl<C: SourceConnector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.discard || conn.is_broken() || self.pool.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut idle = self.pool.idle.lock();
        if idle.len() < self.pool.max_size {
            idle.push_back(conn);
        }
    }
}

/// Opens a fresh connection, pings it and closes it again.
///
/// Touches neither a pool nor any engine state.
///
/// # Errors
///
/// Returns the driver's [`ConnectionError`], or `timeout` if the probe does
/// not finish within the engine's connect plus query timeouts.
pub async fn test_connection<C: SourceConnector>(
    connector: Arc<C>,
    config: &BranchConfig,
    engine: &EngineConfig,
) -> Result<(), ConnectionError> {
    let mut conn = open_connection(connector, config.clone(), engine.connect_timeout).await?;
    run_blocking(engine.query_timeout, move || conn.ping()).await
}

async fn open_connection<C: SourceConnector>(
    connector: Arc<C>,
    config: BranchConfig,
    timeout: Duration,
) -> Result<C::Connection, ConnectionError> {
    run_blocking(timeout, move || connector.connect(&config, timeout)).await
}

async fn run_blocking<R, F>(timeout: Duration, f: F) -> Result<R, ConnectionError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, ConnectionError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ConnectionError::network(format!("driver call failed: {join}"))),
        Err(_) => Err(ConnectionError::timeout(format!(
            "no response within {timeout:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use branchsync_core::{ConnectionReason, CredentialRef};

    fn branch() -> BranchConfig {
        BranchConfig::new("b1", "10.0.0.1", "ERP", CredentialRef::inline("sa", "pw"))
    }

    fn pool(source: &MemorySource, engine: &EngineConfig) -> ConnectionPool<MemorySource> {
        ConnectionPool::new(Arc::new(source.clone()), branch(), engine)
    }

    #[tokio::test]
    async fn idle_connections_are_reused() {
        let source = MemorySource::new();
        let pool = pool(&source, &EngineConfig::default());

        drop(pool.acquire().await.unwrap());
        drop(pool.acquire().await.unwrap());

        assert_eq!(source.connections_opened(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn pool_is_bounded() {
        let source = MemorySource::new();
        let engine = EngineConfig::default()
            .with_pool_size(2)
            .with_acquire_timeout(Duration::from_millis(50));
        let pool = pool(&source, &engine);

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.reason, ConnectionReason::Timeout);

        drop(a);
        let _c = pool.acquire().await.unwrap();
        assert_eq!(source.peak_connections(), 2);
    }

    #[tokio::test]
    async fn broken_connections_are_never_returned() {
        let source = MemorySource::new();
        let pool = pool(&source, &EngineConfig::default());

        drop(pool.acquire().await.unwrap());
        source.break_connections();

        let conn = pool.acquire().await.unwrap();
        let (_conn, ()) = conn.call(Duration::from_secs(1), |c| c.ping()).await.unwrap();
        assert_eq!(source.connections_opened(), 2);
    }

    #[tokio::test]
    async fn failed_call_discards_connection() {
        let source = MemorySource::new();
        let pool = pool(&source, &EngineConfig::default());
        source.fail_next_fetch(ConnectionReason::Network);

        let conn = pool.acquire().await.unwrap();
        let query = crate::source::SourceQuery {
            table: "t".into(),
            key_column: "id".into(),
            key_kind: branchsync_core::KeyKind::Sequence,
            after: None,
            limit: 10,
            equals: None,
            utc_offset: chrono::FixedOffset::east_opt(0).unwrap(),
        };
        let err = conn.call(Duration::from_secs(1), move |c| c.fetch(&query)).await.err().unwrap();
        assert_eq!(err.reason, ConnectionReason::Network);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(source.live_connections(), 0);
    }

    #[tokio::test]
    async fn health_check_evicts_broken_idle_connections() {
        let source = MemorySource::new();
        let pool = pool(&source, &EngineConfig::default());

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 2);

        assert_eq!(pool.check_idle().await, 0);
        assert_eq!(pool.idle_count(), 2);

        source.break_connections();
        assert_eq!(pool.check_idle().await, 2);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(source.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_connection_has_no_side_effects() {
        let source = MemorySource::new();
        source.set_unreachable("10.0.0.1", true);
        let err = test_connection(Arc::new(source.clone()), &branch(), &EngineConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, ConnectionReason::Unreachable);

        source.set_unreachable("10.0.0.1", false);
        test_connection(Arc::new(source.clone()), &branch(), &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(source.connections_opened(), 1);
        assert_eq!(source.live_connections(), 0);
    }

    #[tokio::test]
    async fn closed_pool_refuses_acquire() {
        let source = MemorySource::new();
        let pool = pool(&source, &EngineConfig::default());
        drop(pool.acquire().await.unwrap());
        pool.close();

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.acquire().await.err().unwrap().reason, ConnectionReason::Network);
    }
}
