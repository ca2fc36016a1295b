//! SQL Server source over TDS.
//!
//! [`MssqlConnector`] opens one TDS session per pooled connection. The
//! driver is async, so the connector owns a small runtime and every
//! blocking [`SourceConnection`] call drives its future there. Calls must
//! come from a blocking thread, which is how the engine invokes sources.

use crate::error::ConnectionError;
use crate::source::{SourceConnection, SourceConnector, SourceQuery};
use branchsync_core::{
    BranchConfig, ConnectionReason, KeyKind, Position, SourceRow, SourceValue, TlsPolicy,
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tiberius::error::Error as TdsError;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query, SqlBrowser};
use tokio::net::TcpStream;
use tokio::runtime::{Handle, Runtime};
use tokio::time::error::Elapsed;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

/// Server error numbers for a refused login.
const LOGIN_FAILURES: [u32; 6] = [18452, 18456, 18470, 18486, 18487, 18488];
/// Cannot open the database requested by the login.
const DATABASE_DENIED: u32 = 4060;
/// Default limit on one extraction query.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
/// Driver runtime worker threads.
const DRIVER_THREADS: usize = 2;

type TdsClient = Client<Compat<TcpStream>>;

struct DriverRuntime {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl DriverRuntime {
    fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(DRIVER_THREADS)
            .thread_name("branchsync-tds")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

impl Drop for DriverRuntime {
    fn drop(&mut self) {
        // The last handle may be released on an async worker.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Opens TDS connections to branch SQL Servers.
pub struct MssqlConnector {
    runtime: Arc<DriverRuntime>,
    query_timeout: Duration,
}

impl MssqlConnector {
    /// Creates a connector with its own driver runtime.
    ///
    /// # Errors
    ///
    /// Fails if the runtime's threads cannot be spawned.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            runtime: Arc::new(DriverRuntime::new()?),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        })
    }

    /// Sets the limit on one extraction query or ping.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }
}

impl fmt::Debug for MssqlConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MssqlConnector")
            .field("query_timeout", &self.query_timeout)
            .finish_non_exhaustive()
    }
}

impl SourceConnector for MssqlConnector {
    type Connection = MssqlConnection;

    fn connect(
        &self,
        config: &BranchConfig,
        timeout: Duration,
    ) -> Result<MssqlConnection, ConnectionError> {
        let tds = tds_config(config)?;
        let target = describe(config);
        debug!(server = %target, tls = ?config.tls, "opening TDS session");

        let opened = self.runtime.block_on(async {
            tokio::time::timeout(timeout, open(tds)).await
        });
        let client = match opened {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                let reason = classify(&e);
                warn!(server = %target, %reason, error = %e, "TDS connect failed");
                return Err(ConnectionError::new(reason, format!("{target}: {e}")));
            }
            Err(_) => {
                return Err(ConnectionError::timeout(format!(
                    "{target}: connect timed out after {timeout:?}"
                )));
            }
        };

        Ok(MssqlConnection {
            client,
            runtime: Arc::clone(&self.runtime),
            query_timeout: self.query_timeout,
            broken: false,
        })
    }
}

async fn open(config: Config) -> Result<TdsClient, TdsError> {
    // Resolves named instances through SQL Browser, plain host:port otherwise.
    let tcp = TcpStream::connect_named(&config).await?;
    tcp.set_nodelay(true)?;
    Client::connect(config, tcp.compat_write()).await
}

/// One TDS session handed out by [`MssqlConnector`].
pub struct MssqlConnection {
    client: TdsClient,
    runtime: Arc<DriverRuntime>,
    query_timeout: Duration,
    broken: bool,
}

impl MssqlConnection {
    fn settle<T>(
        &mut self,
        outcome: Result<Result<T, TdsError>, Elapsed>,
    ) -> Result<T, ConnectionError> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                // A server-side error leaves the session usable.
                if !matches!(e, TdsError::Server(_)) {
                    self.broken = true;
                }
                Err(ConnectionError::new(classify(&e), e.to_string()))
            }
            Err(_) => {
                // The abandoned request leaves the TDS stream mid-response.
                self.broken = true;
                Err(ConnectionError::timeout(format!(
                    "query did not finish within {:?}",
                    self.query_timeout
                )))
            }
        }
    }
}

impl SourceConnection for MssqlConnection {
    fn ping(&mut self) -> Result<(), ConnectionError> {
        let limit = self.query_timeout;
        let client = &mut self.client;
        let outcome = self.runtime.block_on(async move {
            let round_trip = async {
                client.simple_query("SELECT 1").await?.into_first_result().await?;
                Ok::<(), TdsError>(())
            };
            tokio::time::timeout(limit, round_trip).await
        });
        self.settle(outcome)
    }

    fn fetch(&mut self, query: &SourceQuery) -> Result<Vec<SourceRow>, ConnectionError> {
        let mut statement = Query::new(select_sql(query));
        statement.bind(i64::try_from(query.limit).unwrap_or(i64::MAX));
        if let Some(after) = query.after {
            match query.key_kind {
                KeyKind::Sequence => statement.bind(after.0),
                KeyKind::Timestamp => statement.bind(timestamp_bound(after, query.utc_offset)),
            }
        }
        if let Some((_, value)) = &query.equals {
            statement.bind(value.clone());
        }

        let limit = self.query_timeout;
        let client = &mut self.client;
        let outcome = self.runtime.block_on(async move {
            let window = async { statement.query(client).await?.into_first_result().await };
            tokio::time::timeout(limit, window).await
        });
        let rows = self.settle(outcome)?;
        Ok(rows.into_iter().map(source_row).collect())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

/// Builds the driver configuration, resolving the password now.
fn tds_config(config: &BranchConfig) -> Result<Config, ConnectionError> {
    let password = config
        .credential
        .secret
        .resolve()
        .ok_or_else(|| ConnectionError::auth("credential is not available"))?;

    let mut tds = Config::new();
    tds.host(&config.host);
    tds.port(config.port);
    if let Some(instance) = &config.instance {
        tds.instance_name(instance);
    }
    tds.database(&config.database);
    tds.application_name("branchsync");
    tds.authentication(AuthMethod::sql_server(
        &config.credential.username,
        password.as_str(),
    ));
    tds.encryption(encryption_level(config.tls));
    if config.tls == TlsPolicy::TrustServerCertificate {
        tds.trust_cert();
    }
    Ok(tds)
}

fn encryption_level(tls: TlsPolicy) -> EncryptionLevel {
    match tls {
        TlsPolicy::Disabled => EncryptionLevel::NotSupported,
        TlsPolicy::TrustServerCertificate | TlsPolicy::Verify => EncryptionLevel::Required,
    }
}

fn describe(config: &BranchConfig) -> String {
    match &config.instance {
        Some(instance) => format!("{}\\{}/{}", config.host, instance, config.database),
        None => format!("{}:{}/{}", config.host, config.port, config.database),
    }
}

/// Maps a driver error to the reason reported to operators.
fn classify(error: &TdsError) -> ConnectionReason {
    match error {
        TdsError::Server(token)
            if LOGIN_FAILURES.contains(&token.code()) || token.code() == DATABASE_DENIED =>
        {
            ConnectionReason::Auth
        }
        TdsError::Io { kind, .. } => match kind {
            io::ErrorKind::TimedOut => ConnectionReason::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NotFound => ConnectionReason::Unreachable,
            _ => ConnectionReason::Network,
        },
        _ => ConnectionReason::Network,
    }
}

/// Quotes a possibly schema-qualified identifier.
fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("[{}]", part.trim().replace(']', "]]")))
        .collect::<Vec<_>>()
        .join(".")
}

/// SQL text for one extraction window.
///
/// Parameters: `@P1` row limit, then the lower bound if any, then the
/// equality value if any.
fn select_sql(query: &SourceQuery) -> String {
    let key = quote_ident(&query.key_column);
    let mut filters = vec![format!("{key} IS NOT NULL")];
    let mut param = 2;
    if query.after.is_some() {
        filters.push(format!("{key} > @P{param}"));
        param += 1;
    }
    if let Some((column, _)) = &query.equals {
        filters.push(format!(
            "LTRIM(RTRIM(CAST({} AS NVARCHAR(4000)))) = @P{param}",
            quote_ident(column)
        ));
    }
    format!(
        "SELECT TOP (@P1) * FROM {} WHERE {} ORDER BY {key}",
        quote_ident(&query.table),
        filters.join(" AND ")
    )
}

/// Converts a timestamp position back to the source's naive local time.
fn timestamp_bound(position: Position, offset: FixedOffset) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp_millis(position.0)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .with_timezone(&offset)
        .naive_local()
}

fn source_row(row: tiberius::Row) -> SourceRow {
    let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut out = SourceRow::new();
    for (name, data) in names.iter().zip(row) {
        out.set(name, source_value(&data));
    }
    out
}

fn source_value(data: &ColumnData<'static>) -> SourceValue {
    match data {
        ColumnData::Bit(Some(v)) => SourceValue::Bool(*v),
        ColumnData::U8(Some(v)) => SourceValue::Int(i64::from(*v)),
        ColumnData::I16(Some(v)) => SourceValue::Int(i64::from(*v)),
        ColumnData::I32(Some(v)) => SourceValue::Int(i64::from(*v)),
        ColumnData::I64(Some(v)) => SourceValue::Int(*v),
        ColumnData::F32(Some(v)) => SourceValue::Float(f64::from(*v)),
        ColumnData::F64(Some(v)) => SourceValue::Float(*v),
        ColumnData::Numeric(Some(n)) => {
            SourceValue::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale())))
        }
        ColumnData::String(Some(s)) => SourceValue::Text(s.to_string()),
        ColumnData::Guid(Some(g)) => SourceValue::Text(g.to_string()),
        ColumnData::DateTime(Some(_))
        | ColumnData::SmallDateTime(Some(_))
        | ColumnData::DateTime2(Some(_)) => NaiveDateTime::from_sql(data)
            .ok()
            .flatten()
            .map_or(SourceValue::Null, SourceValue::DateTime),
        ColumnData::Date(Some(_)) => NaiveDate::from_sql(data)
            .ok()
            .flatten()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map_or(SourceValue::Null, SourceValue::DateTime),
        ColumnData::Time(Some(_)) => NaiveTime::from_sql(data)
            .ok()
            .flatten()
            .map_or(SourceValue::Null, |t| {
                SourceValue::Text(t.format("%H:%M:%S%.f").to_string())
            }),
        ColumnData::DateTimeOffset(Some(_)) => DateTime::<FixedOffset>::from_sql(data)
            .ok()
            .flatten()
            .map_or(SourceValue::Null, SourceValue::DateTimeOffset),
        // NULLs, binary and xml columns carry nothing the mapper reads.
        _ => SourceValue::Null,
    }
}
