//! Abstraction over the statistics data source.
//!
//! The `StatsSource` trait lets the collector run against a live PostgreSQL
//! instance or against an in-memory mock in tests. Each method corresponds to
//! one fixed query; implementations return typed rows and leave all
//! normalization (kind dispatch, scope tagging, filtering) to the collector.

use crate::model::{DatabaseStat, IndexBloat, Setting, TableBloat, TableStat, WalWriteAndFlushStat};

/// Error type for data source calls.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Connection could not be established or was lost.
    Connection(String),
    /// Query execution failed (including statement timeout).
    Query(String),
    /// A write directive was refused before reaching the server.
    Rejected(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Connection(msg) => write!(f, "PostgreSQL: {}", msg),
            SourceError::Query(msg) => write!(f, "PostgreSQL query error: {}", msg),
            SourceError::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// Raw `pg_settings` row.
#[derive(Clone, Debug, PartialEq)]
pub struct RawSetting {
    pub name: String,
    pub setting: String,
    /// `pg_settings.vartype`: bool, enum, integer, real, string.
    pub vartype: String,
    pub min_val: Option<String>,
    pub max_val: Option<String>,
}

/// Blocking statistics data source.
///
/// Implementations must be safe to call from several threads at once; any
/// serialization happens inside the implementation.
pub trait StatsSource: Send + Sync {
    /// All rows of `pg_settings`.
    fn settings(&self) -> Result<Vec<RawSetting>, SourceError>;

    /// `(query_type, count)` pairs from `pg_stat_statements`.
    fn query_type_counts(&self) -> Result<Vec<(String, i64)>, SourceError>;

    /// Rows of `pg_stat_user_tables`.
    fn table_stats(&self) -> Result<Vec<TableStat>, SourceError>;

    /// Heap hit ratio; `None` when the server reports NULL (no I/O yet).
    fn buffer_hit_rate(&self) -> Result<Option<f64>, SourceError>;

    /// `pg_stat_bgwriter` row, if any.
    fn bgwriter(&self) -> Result<Option<WalWriteAndFlushStat>, SourceError>;

    fn table_bloat(&self) -> Result<Vec<TableBloat>, SourceError>;

    fn index_bloat(&self) -> Result<Vec<IndexBloat>, SourceError>;

    /// `pg_stat_database` row of the named database, if it exists.
    fn database_stat(&self, database: &str) -> Result<Option<DatabaseStat>, SourceError>;

    /// `(name, setting)` for `autovacuum` and `track_counts`.
    fn autovacuum_flags(&self) -> Result<Vec<(String, String)>, SourceError>;

    /// `(name, setting)` for the `Autovacuum` category.
    fn autovacuum_settings(&self) -> Result<Vec<(String, String)>, SourceError>;

    /// Issues one configuration change directive.
    fn set_setting(&self, setting: &Setting) -> Result<(), SourceError>;

    /// Asks the server to reload its configuration.
    fn reload_config(&self) -> Result<(), SourceError>;
}

impl<T: StatsSource + ?Sized> StatsSource for Box<T> {
    fn settings(&self) -> Result<Vec<RawSetting>, SourceError> {
        (**self).settings()
    }

    fn query_type_counts(&self) -> Result<Vec<(String, i64)>, SourceError> {
        (**self).query_type_counts()
    }

    fn table_stats(&self) -> Result<Vec<TableStat>, SourceError> {
        (**self).table_stats()
    }

    fn buffer_hit_rate(&self) -> Result<Option<f64>, SourceError> {
        (**self).buffer_hit_rate()
    }

    fn bgwriter(&self) -> Result<Option<WalWriteAndFlushStat>, SourceError> {
        (**self).bgwriter()
    }

    fn table_bloat(&self) -> Result<Vec<TableBloat>, SourceError> {
        (**self).table_bloat()
    }

    fn index_bloat(&self) -> Result<Vec<IndexBloat>, SourceError> {
        (**self).index_bloat()
    }

    fn database_stat(&self, database: &str) -> Result<Option<DatabaseStat>, SourceError> {
        (**self).database_stat(database)
    }

    fn autovacuum_flags(&self) -> Result<Vec<(String, String)>, SourceError> {
        (**self).autovacuum_flags()
    }

    fn autovacuum_settings(&self) -> Result<Vec<(String, String)>, SourceError> {
        (**self).autovacuum_settings()
    }

    fn set_setting(&self, setting: &Setting) -> Result<(), SourceError> {
        (**self).set_setting(setting)
    }

    fn reload_config(&self) -> Result<(), SourceError> {
        (**self).reload_config()
    }
}
