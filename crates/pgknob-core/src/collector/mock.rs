//! In-memory statistics source for testing without a live PostgreSQL.
//!
//! `MockSource` serves scripted rows, can be told to fail individual
//! operations, and records every write directive it receives.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use chrono::{TimeZone, Utc};

use super::source::{RawSetting, SourceError, StatsSource};
use crate::model::{DatabaseStat, IndexBloat, Setting, TableBloat, TableStat, WalWriteAndFlushStat};

/// Operation names accepted by [`MockSource::fail`].
pub mod op {
    pub const SETTINGS: &str = "settings";
    pub const QUERY_TYPES: &str = "query_type_counts";
    pub const TABLES: &str = "table_stats";
    pub const HIT_RATE: &str = "buffer_hit_rate";
    pub const BGWRITER: &str = "bgwriter";
    pub const TABLE_BLOAT: &str = "table_bloat";
    pub const INDEX_BLOAT: &str = "index_bloat";
    pub const DATABASE: &str = "database_stat";
    pub const AUTOVACUUM: &str = "autovacuum";
    pub const RELOAD: &str = "reload_config";
}

/// Write directive observed by the mock.
#[derive(Clone, Debug, PartialEq)]
pub enum Directive {
    Set(Setting),
    Reload,
}

#[derive(Default)]
struct MockState {
    settings: Vec<RawSetting>,
    query_types: Vec<(String, i64)>,
    tables: Vec<TableStat>,
    hit_rate: Option<f64>,
    bgwriter: Option<WalWriteAndFlushStat>,
    table_bloat: Vec<TableBloat>,
    index_bloat: Vec<IndexBloat>,
    databases: HashMap<String, DatabaseStat>,
    autovacuum_flags: Vec<(String, String)>,
    autovacuum_settings: Vec<(String, String)>,
    failing: HashSet<&'static str>,
    rejected_names: HashSet<String>,
    journal: Vec<Directive>,
}

/// Scripted in-memory [`StatsSource`].
#[derive(Default)]
pub struct MockSource {
    state: Mutex<MockState>,
}

impl MockSource {
    /// Creates an empty source: every query returns no rows.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, operation: &'static str) -> Result<(), SourceError> {
        if self.state().failing.contains(operation) {
            return Err(SourceError::Connection(format!(
                "{} unavailable",
                operation
            )));
        }
        Ok(())
    }

    /// Adds a raw `pg_settings` row.
    pub fn add_setting(
        &self,
        name: &str,
        setting: &str,
        vartype: &str,
        min_val: Option<&str>,
        max_val: Option<&str>,
    ) {
        self.state().settings.push(RawSetting {
            name: name.to_string(),
            setting: setting.to_string(),
            vartype: vartype.to_string(),
            min_val: min_val.map(str::to_string),
            max_val: max_val.map(str::to_string),
        });
    }

    pub fn add_query_type(&self, query_type: &str, count: i64) {
        self.state()
            .query_types
            .push((query_type.to_string(), count));
    }

    pub fn add_table(&self, table: TableStat) {
        self.state().tables.push(table);
    }

    pub fn set_hit_rate(&self, rate: Option<f64>) {
        self.state().hit_rate = rate;
    }

    pub fn set_bgwriter(&self, stat: Option<WalWriteAndFlushStat>) {
        self.state().bgwriter = stat;
    }

    pub fn add_table_bloat(&self, bloat: TableBloat) {
        self.state().table_bloat.push(bloat);
    }

    pub fn add_index_bloat(&self, bloat: IndexBloat) {
        self.state().index_bloat.push(bloat);
    }

    pub fn set_database(&self, name: &str, stat: DatabaseStat) {
        self.state().databases.insert(name.to_string(), stat);
    }

    pub fn add_autovacuum_flag(&self, name: &str, setting: &str) {
        self.state()
            .autovacuum_flags
            .push((name.to_string(), setting.to_string()));
    }

    pub fn add_autovacuum_setting(&self, name: &str, setting: &str) {
        self.state()
            .autovacuum_settings
            .push((name.to_string(), setting.to_string()));
    }

    /// Makes `operation` fail (or succeed again) until changed.
    pub fn fail(&self, operation: &'static str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(operation);
        } else {
            state.failing.remove(operation);
        }
    }

    /// Makes `set_setting` refuse the named setting.
    pub fn reject_setting(&self, name: &str) {
        self.state().rejected_names.insert(name.to_string());
    }

    /// Write directives received so far, in order.
    pub fn journal(&self) -> Vec<Directive> {
        self.state().journal.clone()
    }

    /// A small instance with a handful of knobs, tables and bloat rows.
    pub fn typical_instance() -> Self {
        let source = Self::new();

        source.add_setting("shared_buffers", "16384", "integer", Some("16"), Some("1073741823"));
        source.add_setting("work_mem", "4096", "integer", Some("64"), Some("2147483647"));
        source.add_setting("random_page_cost", "4", "real", Some("0"), Some("1.79769e+308"));
        source.add_setting("autovacuum", "on", "bool", None, None);
        source.add_setting("wal_level", "replica", "enum", None, None);
        source.add_setting("search_path", "\"$user\", public", "string", None, None);

        source.add_query_type("SELECT", 120);
        source.add_query_type("UPDATE", 40);
        source.add_query_type("INSERT", 25);
        source.add_query_type("OTHER", 3);

        let vacuumed = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single();
        source.add_table(TableStat {
            relid: 16390,
            relname: "pgbench_accounts".to_string(),
            n_live_tup: 100_000,
            n_dead_tup: 2_500,
            seq_scan: 4,
            idx_scan: 9_000,
            n_tup_ins: 100_000,
            n_tup_upd: 9_000,
            n_tup_del: 0,
            last_vacuum: vacuumed,
            last_autovacuum: None,
            last_analyze: vacuumed,
            last_autoanalyze: None,
        });
        source.add_table(TableStat {
            relid: 16384,
            relname: "pgbench_branches".to_string(),
            n_live_tup: 1,
            n_dead_tup: 40,
            seq_scan: 9_000,
            idx_scan: 0,
            n_tup_ins: 1,
            n_tup_upd: 9_000,
            n_tup_del: 0,
            ..Default::default()
        });

        source.set_hit_rate(Some(0.98));
        source.set_bgwriter(Some(WalWriteAndFlushStat {
            checkpoints_timed: 12.0,
            checkpoints_req: 1.0,
            buffers_alloc: 5000.0,
            ..Default::default()
        }));

        source.add_table_bloat(TableBloat {
            table_name: "pgbench_accounts".to_string(),
            num_rows: 100_000.0,
            bloat_percent: 12.0,
            bloat_mb: 1.5,
            table_mb: 13.0,
        });
        source.add_table_bloat(TableBloat {
            table_name: "pgbench_branches".to_string(),
            num_rows: 1.0,
            bloat_percent: 87.0,
            bloat_mb: 0.05,
            table_mb: 0.06,
        });
        source.add_index_bloat(IndexBloat {
            table_name: "pgbench_accounts".to_string(),
            index_name: "pgbench_accounts_pkey".to_string(),
            bloat_percent: 20.0,
            bloat_mb: 0.4,
            index_mb: 2.2,
            table_mb: 13.0,
            index_scans: 9_000.0,
        });

        source.set_database(
            "postgres",
            DatabaseStat {
                xact_commit: 18_000.0,
                xact_rollback: 2.0,
                blks_hit: 250_000.0,
                blks_read: 1_200.0,
                ..Default::default()
            },
        );

        source.add_autovacuum_flag("autovacuum", "on");
        source.add_autovacuum_flag("track_counts", "on");
        source.add_autovacuum_setting("autovacuum_max_workers", "3");
        source.add_autovacuum_setting("autovacuum_naptime", "60");
        source.add_autovacuum_setting("autovacuum_vacuum_scale_factor", "0.2");

        source
    }
}

impl StatsSource for MockSource {
    fn settings(&self) -> Result<Vec<RawSetting>, SourceError> {
        self.check(op::SETTINGS)?;
        Ok(self.state().settings.clone())
    }

    fn query_type_counts(&self) -> Result<Vec<(String, i64)>, SourceError> {
        self.check(op::QUERY_TYPES)?;
        Ok(self.state().query_types.clone())
    }

    fn table_stats(&self) -> Result<Vec<TableStat>, SourceError> {
        self.check(op::TABLES)?;
        Ok(self.state().tables.clone())
    }

    fn buffer_hit_rate(&self) -> Result<Option<f64>, SourceError> {
        self.check(op::HIT_RATE)?;
        Ok(self.state().hit_rate)
    }

    fn bgwriter(&self) -> Result<Option<WalWriteAndFlushStat>, SourceError> {
        self.check(op::BGWRITER)?;
        Ok(self.state().bgwriter.clone())
    }

    fn table_bloat(&self) -> Result<Vec<TableBloat>, SourceError> {
        self.check(op::TABLE_BLOAT)?;
        Ok(self.state().table_bloat.clone())
    }

    fn index_bloat(&self) -> Result<Vec<IndexBloat>, SourceError> {
        self.check(op::INDEX_BLOAT)?;
        Ok(self.state().index_bloat.clone())
    }

    fn database_stat(&self, database: &str) -> Result<Option<DatabaseStat>, SourceError> {
        self.check(op::DATABASE)?;
        Ok(self.state().databases.get(database).cloned())
    }

    fn autovacuum_flags(&self) -> Result<Vec<(String, String)>, SourceError> {
        self.check(op::AUTOVACUUM)?;
        Ok(self.state().autovacuum_flags.clone())
    }

    fn autovacuum_settings(&self) -> Result<Vec<(String, String)>, SourceError> {
        self.check(op::AUTOVACUUM)?;
        Ok(self.state().autovacuum_settings.clone())
    }

    fn set_setting(&self, setting: &Setting) -> Result<(), SourceError> {
        let mut state = self.state();
        if state.rejected_names.contains(&setting.name) {
            return Err(SourceError::Query(format!(
                "ERROR: unrecognized configuration parameter \"{}\"",
                setting.name
            )));
        }
        state.journal.push(Directive::Set(setting.clone()));
        Ok(())
    }

    fn reload_config(&self) -> Result<(), SourceError> {
        self.check(op::RELOAD)?;
        self.state().journal.push(Directive::Reload);
        Ok(())
    }
}
