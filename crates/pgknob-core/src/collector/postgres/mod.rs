//! PostgreSQL data source.
//!
//! Reads from:
//! - `pg_settings` — knobs and autovacuum configuration
//! - `pg_stat_statements` — statement type distribution (requires extension)
//! - `pg_stat_user_tables`, `pg_statio_user_tables` — per-table counters, hit ratio
//! - `pg_stat_bgwriter` — checkpoint/background writer counters
//! - `pg_stat_database` — per-database counters
//! - bloat estimates derived from `pg_stats` and `pg_class`
//!
//! Writes via `ALTER SYSTEM SET` and `pg_reload_conf()`.
//!
//! A single blocking connection is shared behind a mutex and re-established
//! lazily after any failure. Every connection carries a connect timeout, a
//! server-side `statement_timeout` and TCP keepalives.

mod queries;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

use super::source::{RawSetting, SourceError, StatsSource};
use crate::model::{
    DatabaseStat, IndexBloat, Setting, TableBloat, TableStat, TypedValue, WalWriteAndFlushStat,
};
use queries::*;

/// Default per-statement deadline.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle time before TCP keepalive probes start on the statistics connection.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_RETRIES: u32 = 3;

/// Where to reach the managed instance.
///
/// Shared by the statistics source and the benchmark probe, so both always
/// talk to the same database.
#[derive(Clone, PartialEq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

impl ConnectionParams {
    /// Reads standard environment variables:
    /// - PGHOST (default: localhost)
    /// - PGPORT (default: 5432)
    /// - PGUSER (default: $USER)
    /// - PGPASSWORD (default: none)
    /// - PGDATABASE (default: same as PGUSER)
    pub fn from_env() -> Result<Self, SourceError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| SourceError::Connection("PGUSER or USER not set".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = match std::env::var("PGPORT") {
            Ok(p) => p
                .parse()
                .map_err(|_| SourceError::Connection(format!("invalid PGPORT: {}", p)))?,
            Err(_) => 5432,
        };
        let password = std::env::var("PGPASSWORD").ok().filter(|p| !p.is_empty());
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        Ok(Self {
            host,
            port,
            user,
            password,
            database,
        })
    }

    fn client_config(&self) -> postgres::Config {
        let mut config = postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.database);
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }
}

/// PostgreSQL statistics source.
pub struct PostgresSource {
    params: ConnectionParams,
    statement_timeout: Duration,
    client: Mutex<Option<Client>>,
}

impl PostgresSource {
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            client: Mutex::new(None),
        }
    }

    /// Overrides the per-statement deadline.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    fn connect(&self) -> Result<Client, SourceError> {
        let mut config = self.params.client_config();
        // A dead peer is detected by keepalives, not only by the server-side
        // statement timeout.
        config
            .connect_timeout(self.statement_timeout)
            .keepalives(true)
            .keepalives_idle(KEEPALIVE_IDLE)
            .keepalives_interval(KEEPALIVE_INTERVAL)
            .keepalives_retries(KEEPALIVE_RETRIES);

        let mut client = config
            .connect(NoTls)
            .map_err(|e| SourceError::Connection(format_postgres_error(&e)))?;

        client
            .batch_execute(&format!(
                "SET statement_timeout = {}",
                self.statement_timeout.as_millis()
            ))
            .map_err(|e| SourceError::Connection(format_postgres_error(&e)))?;

        if let Err(e) = client.batch_execute(CREATE_EXTENSION_QUERY) {
            warn!(error = %format_postgres_error(&e), "failed to create pg_stat_statements extension");
        }

        info!(database = %self.params.database, "connected to PostgreSQL");
        Ok(client)
    }

    /// Runs `f` on the shared connection, reconnecting first if needed.
    ///
    /// Any query error drops the connection; the next call reconnects.
    fn with_client<T>(
        &self,
        f: impl FnOnce(&mut Client) -> Result<T, postgres::Error>,
    ) -> Result<T, SourceError> {
        let mut guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);

        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let Some(client) = guard.as_mut() else {
            return Err(SourceError::Connection("not connected".to_string()));
        };

        match f(client) {
            Ok(v) => Ok(v),
            Err(e) => {
                let msg = format_postgres_error(&e);
                debug!(error = %msg, "dropping PostgreSQL connection after error");
                *guard = None;
                Err(SourceError::Query(msg))
            }
        }
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>, SourceError> {
        self.with_client(|client| client.query(sql, &[]))
    }
}

impl StatsSource for PostgresSource {
    fn settings(&self) -> Result<Vec<RawSetting>, SourceError> {
        let rows = self.query(SETTINGS_QUERY)?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(RawSetting {
                    name: row.try_get(0).ok()?,
                    setting: row.try_get(1).ok()?,
                    vartype: row.try_get(2).ok()?,
                    min_val: row.try_get(3).ok()?,
                    max_val: row.try_get(4).ok()?,
                })
            })
            .collect())
    }

    fn query_type_counts(&self) -> Result<Vec<(String, i64)>, SourceError> {
        let rows = self.query(QUERY_TYPES_QUERY)?;
        Ok(rows
            .iter()
            .filter_map(|row| Some((row.try_get(0).ok()?, row.try_get(1).ok()?)))
            .collect())
    }

    fn table_stats(&self) -> Result<Vec<TableStat>, SourceError> {
        let rows = self.query(TABLES_QUERY)?;
        Ok(rows.iter().filter_map(parse_table_row).collect())
    }

    fn buffer_hit_rate(&self) -> Result<Option<f64>, SourceError> {
        let rows = self.query(BUFFER_HIT_RATE_QUERY)?;
        Ok(rows
            .first()
            .and_then(|row| row.try_get::<_, Option<f64>>(0).ok())
            .flatten())
    }

    fn bgwriter(&self) -> Result<Option<WalWriteAndFlushStat>, SourceError> {
        let rows = self.query(BGWRITER_QUERY)?;
        Ok(rows.first().map(|row| WalWriteAndFlushStat {
            checkpoints_timed: row.try_get("checkpoints_timed").unwrap_or(0.0),
            checkpoints_req: row.try_get("checkpoints_req").unwrap_or(0.0),
            checkpoint_write_time: row.try_get("checkpoint_write_time").unwrap_or(0.0),
            checkpoint_sync_time: row.try_get("checkpoint_sync_time").unwrap_or(0.0),
            buffers_checkpoint: row.try_get("buffers_checkpoint").unwrap_or(0.0),
            buffers_clean: row.try_get("buffers_clean").unwrap_or(0.0),
            maxwritten_clean: row.try_get("maxwritten_clean").unwrap_or(0.0),
            buffers_backend: row.try_get("buffers_backend").unwrap_or(0.0),
            buffers_backend_fsync: row.try_get("buffers_backend_fsync").unwrap_or(0.0),
            buffers_alloc: row.try_get("buffers_alloc").unwrap_or(0.0),
        }))
    }

    fn table_bloat(&self) -> Result<Vec<TableBloat>, SourceError> {
        let rows = self.query(TABLE_BLOAT_QUERY)?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(TableBloat {
                    table_name: row.try_get(0).ok()?,
                    num_rows: row.try_get(1).unwrap_or(0.0),
                    bloat_percent: row.try_get(2).unwrap_or(0.0),
                    bloat_mb: row.try_get(3).unwrap_or(0.0),
                    table_mb: row.try_get(4).unwrap_or(0.0),
                })
            })
            .collect())
    }

    fn index_bloat(&self) -> Result<Vec<IndexBloat>, SourceError> {
        let rows = self.query(INDEX_BLOAT_QUERY)?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(IndexBloat {
                    table_name: row.try_get(0).ok()?,
                    index_name: row.try_get(1).ok()?,
                    bloat_percent: row.try_get(2).unwrap_or(0.0),
                    bloat_mb: row.try_get(3).unwrap_or(0.0),
                    index_mb: row.try_get(4).unwrap_or(0.0),
                    table_mb: row.try_get(5).unwrap_or(0.0),
                    index_scans: row.try_get(6).unwrap_or(0.0),
                })
            })
            .collect())
    }

    fn database_stat(&self, database: &str) -> Result<Option<DatabaseStat>, SourceError> {
        let rows = self.with_client(|client| client.query(DATABASE_QUERY, &[&database]))?;
        Ok(rows.first().map(|row| DatabaseStat {
            xact_commit: row.try_get("xact_commit").unwrap_or(0.0),
            xact_rollback: row.try_get("xact_rollback").unwrap_or(0.0),
            blks_read: row.try_get("blks_read").unwrap_or(0.0),
            blks_hit: row.try_get("blks_hit").unwrap_or(0.0),
            tup_returned: row.try_get("tup_returned").unwrap_or(0.0),
            tup_fetched: row.try_get("tup_fetched").unwrap_or(0.0),
            tup_inserted: row.try_get("tup_inserted").unwrap_or(0.0),
            tup_updated: row.try_get("tup_updated").unwrap_or(0.0),
            tup_deleted: row.try_get("tup_deleted").unwrap_or(0.0),
            conflicts: row.try_get("conflicts").unwrap_or(0.0),
            temp_files: row.try_get("temp_files").unwrap_or(0.0),
            temp_bytes: row.try_get("temp_bytes").unwrap_or(0.0),
            deadlocks: row.try_get("deadlocks").unwrap_or(0.0),
            blk_read_time: row.try_get("blk_read_time").unwrap_or(0.0),
            blk_write_time: row.try_get("blk_write_time").unwrap_or(0.0),
            active_time: row.try_get("active_time").unwrap_or(0.0),
            idle_in_transaction_time: row.try_get("idle_in_transaction_time").unwrap_or(0.0),
        }))
    }

    fn autovacuum_flags(&self) -> Result<Vec<(String, String)>, SourceError> {
        let rows = self.query(AUTOVACUUM_FLAGS_QUERY)?;
        Ok(name_setting_pairs(&rows))
    }

    fn autovacuum_settings(&self) -> Result<Vec<(String, String)>, SourceError> {
        let rows = self.query(AUTOVACUUM_SETTINGS_QUERY)?;
        Ok(name_setting_pairs(&rows))
    }

    fn set_setting(&self, setting: &Setting) -> Result<(), SourceError> {
        let statement = alter_system_statement(setting)?;
        debug!(statement = %statement, "applying setting");
        self.with_client(|client| client.batch_execute(&statement))
    }

    fn reload_config(&self) -> Result<(), SourceError> {
        self.with_client(|client| client.batch_execute(RELOAD_QUERY))
    }
}

/// Parses a single `pg_stat_user_tables` row.
/// Returns None if the key columns fail to deserialize.
fn parse_table_row(row: &Row) -> Option<TableStat> {
    Some(TableStat {
        relid: row.try_get(0).ok()?,
        relname: row.try_get(1).ok()?,
        n_live_tup: row.try_get(2).unwrap_or(0),
        n_dead_tup: row.try_get(3).unwrap_or(0),
        seq_scan: row.try_get(4).unwrap_or(0),
        idx_scan: row.try_get(5).unwrap_or(0),
        n_tup_ins: row.try_get(6).unwrap_or(0),
        n_tup_upd: row.try_get(7).unwrap_or(0),
        n_tup_del: row.try_get(8).unwrap_or(0),
        last_vacuum: row.try_get(9).unwrap_or(None),
        last_autovacuum: row.try_get(10).unwrap_or(None),
        last_analyze: row.try_get(11).unwrap_or(None),
        last_autoanalyze: row.try_get(12).unwrap_or(None),
    })
}

fn name_setting_pairs(rows: &[Row]) -> Vec<(String, String)> {
    rows.iter()
        .filter_map(|row| Some((row.try_get(0).ok()?, row.try_get(1).ok()?)))
        .collect()
}

/// Renders `ALTER SYSTEM SET` for one setting.
///
/// `ALTER SYSTEM` does not accept bind parameters, so the name is checked
/// against the GUC identifier alphabet and the value is rendered as a literal.
fn alter_system_statement(setting: &Setting) -> Result<String, SourceError> {
    let name = setting.name.as_str();
    let valid_name = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid_name {
        return Err(SourceError::Rejected(format!(
            "invalid setting name {:?}",
            name
        )));
    }

    let literal = match &setting.value {
        TypedValue::Float(v) if v.is_finite() => v.to_string(),
        TypedValue::Float(v) => {
            return Err(SourceError::Rejected(format!(
                "non-finite value {} for {}",
                v, name
            )));
        }
        TypedValue::Bool(v) => (if *v { "on" } else { "off" }).to_string(),
        TypedValue::String(v) => format!("'{}'", v.replace('\'', "''")),
    };

    Ok(format!("ALTER SYSTEM SET {} = {}", name, literal))
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}
