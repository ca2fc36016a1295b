//! Source database seam.
//!
//! A [`SourceConnector`] opens blocking connections to one branch's SQL
//! Server. The engine never calls a connection from async code directly;
//! every call runs on the blocking pool.
//!
//! [`MemorySource`] is an in-memory source with fault injection, used by
//! tests and the CLI demo.

use crate::error::ConnectionError;
use branchsync_core::{key_position, BranchConfig, ConnectionReason, KeyKind, Position, SourceRow};
use chrono::FixedOffset;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One extraction window: rows of `table` with key above `after`, in key
/// order, at most `limit` of them.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    /// Source table.
    pub table: String,
    /// Monotonic ordering key column.
    pub key_column: String,
    /// How the key encodes order.
    pub key_kind: KeyKind,
    /// Exclusive lower bound; `None` reads from the beginning.
    pub after: Option<Position>,
    /// Maximum number of rows.
    pub limit: usize,
    /// Optional `column = value` restriction.
    pub equals: Option<(String, String)>,
    /// Offset of naive datetimes, for timestamp keys.
    pub utc_offset: FixedOffset,
}

/// An open, blocking connection to a branch database.
pub trait SourceConnection: Send {
    /// Runs a trivial round trip.
    fn ping(&mut self) -> Result<(), ConnectionError>;

    /// Runs an extraction query.
    fn fetch(&mut self, query: &SourceQuery) -> Result<Vec<SourceRow>, ConnectionError>;

    /// Returns true once the connection is known to be unusable.
    fn is_broken(&self) -> bool;
}

/// Opens connections for a branch configuration.
pub trait SourceConnector: Send + Sync + 'static {
    /// Connection type produced by this connector.
    type Connection: SourceConnection + 'static;

    /// Opens a connection, resolving credentials at call time.
    fn connect(
        &self,
        config: &BranchConfig,
        timeout: Duration,
    ) -> Result<Self::Connection, ConnectionError>;
}

#[derive(Debug, Default)]
struct SourceState {
    tables: HashMap<String, Vec<SourceRow>>,
    unreachable_hosts: HashSet<String>,
    password: Option<String>,
    connect_faults: VecDeque<ConnectionReason>,
    fetch_faults: VecDeque<ConnectionReason>,
    fetch_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct SourceShared {
    state: Mutex<SourceState>,
    /// Bumped to invalidate every open connection.
    epoch: AtomicU64,
    opened: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    fetches: AtomicUsize,
}

/// In-memory source database with fault injection.
///
/// Cloning shares the same tables; a test keeps one handle to mutate the
/// source while the engine holds another.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    shared: Arc<SourceShared>,
}

impl MemorySource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row to `table` (created on first use).
    pub fn insert(&self, table: &str, row: SourceRow) {
        self.shared
            .state
            .lock()
            .tables
            .entry(table.to_ascii_lowercase())
            .or_default()
            .push(row);
    }

    /// Appends rows to `table`.
    pub fn insert_many(&self, table: &str, rows: impl IntoIterator<Item = SourceRow>) {
        let mut state = self.shared.state.lock();
        let target = state.tables.entry(table.to_ascii_lowercase()).or_default();
        target.extend(rows);
    }

    /// Renames a column in every row of `table`.
    pub fn rename_column(&self, table: &str, from: &str, to: &str) {
        let mut state = self.shared.state.lock();
        if let Some(rows) = state.tables.get_mut(&table.to_ascii_lowercase()) {
            for row in rows.iter_mut() {
                if let Some(value) = row.remove(from) {
                    row.set(to, value);
                }
            }
        }
    }

    /// Number of rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.shared
            .state
            .lock()
            .tables
            .get(&table.to_ascii_lowercase())
            .map_or(0, Vec::len)
    }

    /// Makes connects to `host` fail as unreachable.
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.shared.state.lock();
        if unreachable {
            state.unreachable_hosts.insert(host.to_string());
        } else {
            state.unreachable_hosts.remove(host);
        }
    }

    /// Requires this password on connect; `None` accepts any.
    pub fn set_password(&self, password: Option<&str>) {
        self.shared.state.lock().password = password.map(str::to_string);
    }

    /// Queues a failure for an upcoming connect.
    pub fn fail_next_connect(&self, reason: ConnectionReason) {
        self.shared.state.lock().connect_faults.push_back(reason);
    }

    /// Queues a failure for an upcoming fetch. The failing connection is
    /// left broken.
    pub fn fail_next_fetch(&self, reason: ConnectionReason) {
        self.shared.state.lock().fetch_faults.push_back(reason);
    }

    /// Slows every fetch down by `delay`.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.shared.state.lock().fetch_delay = delay;
    }

    /// Breaks every currently open connection.
    pub fn break_connections(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Total connections ever opened.
    pub fn connections_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections.
    pub fn peak_connections(&self) -> usize {
        self.shared.peak_live.load(Ordering::SeqCst)
    }

    /// Total fetches served or failed.
    pub fn fetch_count(&self) -> usize {
        self.shared.fetches.load(Ordering::SeqCst)
    }
}

impl SourceConnector for MemorySource {
    type Connection = MemoryConnection;

    fn connect(
        &self,
        config: &BranchConfig,
        _timeout: Duration,
    ) -> Result<MemoryConnection, ConnectionError> {
        {
            let mut state = self.shared.state.lock();
            if let Some(reason) = state.connect_faults.pop_front() {
                return Err(ConnectionError::new(reason, "injected connect failure"));
            }
            if state.unreachable_hosts.contains(&config.host) {
                return Err(ConnectionError::unreachable(format!(
                    "{}:{} is unreachable",
                    config.host, config.port
                )));
            }
            let secret = config
                .credential
                .secret
                .resolve()
                .ok_or_else(|| ConnectionError::auth("credential is not available"))?;
            if let Some(expected) = &state.password {
                if secret.as_str() != expected {
                    return Err(ConnectionError::auth(format!(
                        "login failed for user '{}'",
                        config.credential.username
                    )));
                }
            }
        }

        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_live.fetch_max(live, Ordering::SeqCst);

        Ok(MemoryConnection {
            shared: Arc::clone(&self.shared),
            epoch: self.shared.epoch.load(Ordering::SeqCst),
            broken: AtomicBool::new(false),
        })
    }
}

/// Connection handed out by [`MemorySource`].
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<SourceShared>,
    epoch: u64,
    broken: AtomicBool,
}

impl MemoryConnection {
    fn check(&self) -> Result<(), ConnectionError> {
        if self.is_broken() {
            return Err(ConnectionError::network("connection reset by peer"));
        }
        Ok(())
    }

    fn fail(&self, reason: ConnectionReason) -> ConnectionError {
        self.broken.store(true, Ordering::SeqCst);
        ConnectionError::new(reason, "injected fetch failure")
    }
}

impl SourceConnection for MemoryConnection {
    fn ping(&mut self) -> Result<(), ConnectionError> {
        self.check()
    }

    fn fetch(&mut self, query: &SourceQuery) -> Result<Vec<SourceRow>, ConnectionError> {
        self.shared.fetches.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        let (rows, delay) = {
            let mut state = self.shared.state.lock();
            if let Some(reason) = state.fetch_faults.pop_front() {
                return Err(self.fail(reason));
            }
            let rows = state
                .tables
                .get(&query.table.to_ascii_lowercase())
                .cloned()
                .unwrap_or_default();
            (rows, state.fetch_delay)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut keyed: Vec<(Position, SourceRow)> = rows
            .into_iter()
            .filter(|row| match &query.equals {
                Some((column, expected)) => row
                    .non_null(column)
                    .is_some_and(|value| text_of(value).as_deref() == Some(expected.as_str())),
                None => true,
            })
            .filter_map(|row| {
                let value = row.non_null(&query.key_column)?;
                let position =
                    key_position(value, &query.key_column, query.key_kind, query.utc_offset).ok()?;
                Some((position, row))
            })
            .filter(|(position, _)| query.after.map_or(true, |after| *position > after))
            .collect();

        keyed.sort_by_key(|(position, _)| *position);
        keyed.truncate(query.limit);
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst) || self.epoch != self.shared.epoch.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn text_of(value: &branchsync_core::SourceValue) -> Option<String> {
    match value {
        branchsync_core::SourceValue::Text(s) => Some(s.trim().to_string()),
        branchsync_core::SourceValue::Int(i) => Some(i.to_string()),
        _ => None,
    }
}
