//! Collector facade over a [`StatsSource`].

use tracing::{debug, warn};

use super::source::{RawSetting, SourceError, StatsSource};
use crate::model::{
    DatabaseStat, IndexBloat, QueryTypesDistribution, Scope, Setting, SharedBufferHitRate,
    TableBloat, TableStat, WalWriteAndFlushStat,
};

/// Migration bookkeeping table, not part of the workload.
const MIGRATIONS_TABLE: &str = "goose_db_version";

/// Error type for collector operations.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectError {
    /// Data source call failed.
    Source(SourceError),
    /// Request rejected before any data source call.
    InvalidRequest(String),
    /// A setting change failed after `applied` earlier changes went through.
    /// The configuration reload was not issued.
    PartialApply {
        applied: usize,
        failed: String,
        source: SourceError,
    },
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::Source(e) => write!(f, "{}", e),
            CollectError::InvalidRequest(msg) => write!(f, "invalid request: {}", msg),
            CollectError::PartialApply {
                applied,
                failed,
                source,
            } => write!(
                f,
                "failed to set {} after {} applied change(s), reload skipped: {}",
                failed, applied, source
            ),
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectError::Source(e) | CollectError::PartialApply { source: e, .. } => Some(e),
            CollectError::InvalidRequest(_) => None,
        }
    }
}

impl From<SourceError> for CollectError {
    fn from(e: SourceError) -> Self {
        CollectError::Source(e)
    }
}

/// Normalizes data source rows into typed, scope-tagged entities.
///
/// Holds no state besides the source, so one instance can serve concurrent
/// callers.
pub struct Collector<S> {
    source: S,
}

impl<S: StatsSource> Collector<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Lists numeric settings with their bounds.
    ///
    /// Only `integer` and `real` settings are returned. `bool`, `string` and
    /// `enum` settings are filtered out. Rows of an unknown kind, or whose
    /// value or bounds do not parse, are logged and skipped.
    pub fn list_settings(&self) -> Result<(Vec<Setting>, Scope), CollectError> {
        let rows = self.source.settings()?;
        let total = rows.len();
        let settings: Vec<Setting> = rows.iter().filter_map(convert_setting).collect();
        debug!(total, numeric = settings.len(), "collected settings");
        Ok((settings, Scope::General))
    }

    /// Applies setting changes, then reloads the server configuration once.
    ///
    /// The batch stops at the first failed change. Changes already applied
    /// are not rolled back and no reload is issued.
    pub fn apply_settings(&self, settings: &[Setting]) -> Result<(), CollectError> {
        if settings.is_empty() {
            return Err(CollectError::InvalidRequest(
                "no settings to apply".to_string(),
            ));
        }
        if let Some(pos) = settings.iter().position(|s| s.name.trim().is_empty()) {
            return Err(CollectError::InvalidRequest(format!(
                "setting #{} has an empty name",
                pos + 1
            )));
        }

        for (applied, setting) in settings.iter().enumerate() {
            if let Err(e) = self.source.set_setting(setting) {
                warn!(name = %setting.name, applied, error = %e, "setting change failed");
                return Err(CollectError::PartialApply {
                    applied,
                    failed: setting.name.clone(),
                    source: e,
                });
            }
            debug!(name = %setting.name, value = %setting.value, "setting changed");
        }

        self.source.reload_config()?;
        debug!(count = settings.len(), "configuration reloaded");
        Ok(())
    }

    /// Statement counts by leading keyword.
    pub fn query_types_distribution(
        &self,
    ) -> Result<(QueryTypesDistribution, Scope), CollectError> {
        let mut dist = QueryTypesDistribution::default();
        for (query_type, count) in self.source.query_type_counts()? {
            match query_type.as_str() {
                "INSERT" => dist.insert = count,
                "UPDATE" => dist.update = count,
                "DELETE" => dist.delete = count,
                "SELECT" => dist.select = count,
                _ => dist.other += count,
            }
        }
        Ok((dist, Scope::General))
    }

    /// Per-table statistics, excluding the migrations table.
    pub fn tables(&self) -> Result<(Vec<TableStat>, Scope), CollectError> {
        let tables = self
            .source
            .table_stats()?
            .into_iter()
            .filter(|t| t.relname != MIGRATIONS_TABLE)
            .collect();
        Ok((tables, Scope::PerObject))
    }

    /// Shared buffer hit ratio; zero before any heap block was touched.
    pub fn shared_buffer_hit_rate(&self) -> Result<(SharedBufferHitRate, Scope), CollectError> {
        let hit_rate = self.source.buffer_hit_rate()?.unwrap_or(0.0);
        Ok((SharedBufferHitRate { hit_rate }, Scope::General))
    }

    pub fn wal_write_and_flush(&self) -> Result<(WalWriteAndFlushStat, Scope), CollectError> {
        let stat = self.source.bgwriter()?.unwrap_or_default();
        Ok((stat, Scope::General))
    }

    pub fn table_bloat(&self) -> Result<(Vec<TableBloat>, Scope), CollectError> {
        Ok((self.source.table_bloat()?, Scope::PerObject))
    }

    pub fn index_bloat(&self) -> Result<(Vec<IndexBloat>, Scope), CollectError> {
        Ok((self.source.index_bloat()?, Scope::PerObject))
    }

    /// Counters of the named database; zeros if it does not exist.
    pub fn database_stat(&self, database: &str) -> Result<(DatabaseStat, Scope), CollectError> {
        let stat = self.source.database_stat(database)?.unwrap_or_default();
        Ok((stat, Scope::General))
    }
}

fn convert_setting(row: &RawSetting) -> Option<Setting> {
    match row.vartype.as_str() {
        "integer" | "real" => {}
        "bool" | "string" | "enum" => return None,
        other => {
            warn!(name = %row.name, kind = other, "unsupported setting kind, skipping");
            return None;
        }
    }

    let value = match parse_number(&row.setting) {
        Some(v) => v,
        None => {
            warn!(name = %row.name, value = %row.setting, "unparseable setting value, skipping");
            return None;
        }
    };
    let min = parse_bound(&row.name, row.min_val.as_deref())?;
    let max = parse_bound(&row.name, row.max_val.as_deref())?;

    Some(Setting::numeric(row.name.clone(), value, min, max))
}

/// `None` for an unparseable bound, `Some(None)` for an absent one.
fn parse_bound(name: &str, raw: Option<&str>) -> Option<Option<f64>> {
    let Some(raw) = raw else {
        return Some(None);
    };
    match parse_number(raw) {
        Some(v) => Some(Some(v)),
        None => {
            warn!(name, bound = raw, "unparseable setting bound, skipping");
            None
        }
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{Directive, MockSource, op};
    use crate::model::TypedValue;

    fn names(settings: &[Setting]) -> Vec<&str> {
        settings.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn list_settings_keeps_only_numeric_kinds() {
        let collector = Collector::new(MockSource::typical_instance());
        let (settings, scope) = collector.list_settings().unwrap();

        assert_eq!(scope, Scope::General);
        assert_eq!(
            names(&settings),
            ["shared_buffers", "work_mem", "random_page_cost"]
        );
        let work_mem = &settings[1];
        assert_eq!(work_mem.value, TypedValue::Float(4096.0));
        assert_eq!(work_mem.min, Some(64.0));
        assert_eq!(work_mem.max, Some(2147483647.0));
    }

    #[test]
    fn list_settings_skips_unknown_kind_and_bad_rows() {
        let source = MockSource::new();
        source.add_setting("a", "1", "integer", Some("0"), Some("10"));
        source.add_setting("b", "1", "bigint", Some("0"), Some("10"));
        source.add_setting("c", "1", "integer", Some("zero"), Some("10"));
        source.add_setting("d", "lots", "real", None, None);
        source.add_setting("e", "0.5", "real", None, None);
        let collector = Collector::new(source);

        let (settings, _) = collector.list_settings().unwrap();
        assert_eq!(names(&settings), ["a", "e"]);
        assert_eq!(settings[1].min, None);
    }

    #[test]
    fn list_settings_surfaces_source_failure() {
        let source = MockSource::typical_instance();
        source.fail(op::SETTINGS, true);
        let collector = Collector::new(source);

        assert!(matches!(
            collector.list_settings(),
            Err(CollectError::Source(SourceError::Connection(_)))
        ));
    }

    #[test]
    fn apply_settings_reloads_once_after_batch() {
        let collector = Collector::new(MockSource::new());
        let batch = [
            Setting::new("work_mem", 8192.0),
            Setting::new("random_page_cost", 1.1),
        ];
        collector.apply_settings(&batch).unwrap();

        assert_eq!(
            collector.source().journal(),
            [
                Directive::Set(batch[0].clone()),
                Directive::Set(batch[1].clone()),
                Directive::Reload,
            ]
        );
    }

    #[test]
    fn apply_settings_stops_at_first_failure_without_reload() {
        let source = MockSource::new();
        source.reject_setting("no_such_knob");
        let collector = Collector::new(source);
        let batch = [
            Setting::new("work_mem", 8192.0),
            Setting::new("no_such_knob", 1.0),
            Setting::new("random_page_cost", 1.1),
        ];

        let err = collector.apply_settings(&batch).unwrap_err();
        match err {
            CollectError::PartialApply {
                applied, failed, ..
            } => {
                assert_eq!(applied, 1);
                assert_eq!(failed, "no_such_knob");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            collector.source().journal(),
            [Directive::Set(batch[0].clone())]
        );
    }

    #[test]
    fn apply_settings_validates_before_touching_source() {
        let collector = Collector::new(MockSource::new());

        assert!(matches!(
            collector.apply_settings(&[]),
            Err(CollectError::InvalidRequest(_))
        ));
        let batch = [Setting::new("work_mem", 1.0), Setting::new("  ", 1.0)];
        assert!(matches!(
            collector.apply_settings(&batch),
            Err(CollectError::InvalidRequest(_))
        ));
        assert!(collector.source().journal().is_empty());
    }

    #[test]
    fn apply_settings_reports_failed_reload() {
        let source = MockSource::new();
        source.fail(op::RELOAD, true);
        let collector = Collector::new(source);

        let err = collector
            .apply_settings(&[Setting::new("work_mem", 8192.0)])
            .unwrap_err();
        assert!(matches!(err, CollectError::Source(_)));
        assert_eq!(collector.source().journal().len(), 1);
    }

    #[test]
    fn query_types_are_bucketed_by_keyword() {
        let source = MockSource::new();
        source.add_query_type("SELECT", 10);
        source.add_query_type("INSERT", 3);
        source.add_query_type("VACUUM", 2);
        source.add_query_type("OTHER", 1);
        let collector = Collector::new(source);

        let (dist, scope) = collector.query_types_distribution().unwrap();
        assert_eq!(scope, Scope::General);
        assert_eq!(
            dist,
            QueryTypesDistribution {
                insert: 3,
                update: 0,
                delete: 0,
                select: 10,
                other: 3,
            }
        );
    }

    #[test]
    fn tables_skip_migrations_table() {
        let source = MockSource::new();
        for name in ["orders", MIGRATIONS_TABLE, "customers"] {
            source.add_table(TableStat {
                relname: name.to_string(),
                ..Default::default()
            });
        }
        let collector = Collector::new(source);

        let (tables, scope) = collector.tables().unwrap();
        assert_eq!(scope, Scope::PerObject);
        let names: Vec<&str> = tables.iter().map(|t| t.relname.as_str()).collect();
        assert_eq!(names, ["orders", "customers"]);
    }

    #[test]
    fn missing_rows_yield_zero_records() {
        let collector = Collector::new(MockSource::new());

        let (hit, scope) = collector.shared_buffer_hit_rate().unwrap();
        assert_eq!(hit.hit_rate, 0.0);
        assert_eq!(scope, Scope::General);

        let (wal, _) = collector.wal_write_and_flush().unwrap();
        assert_eq!(wal, WalWriteAndFlushStat::default());

        let (db, scope) = collector.database_stat("missing").unwrap();
        assert_eq!(db, DatabaseStat::default());
        assert_eq!(scope, Scope::General);

        let (bloat, scope) = collector.table_bloat().unwrap();
        assert!(bloat.is_empty());
        assert_eq!(scope, Scope::PerObject);
        assert!(collector.index_bloat().unwrap().0.is_empty());
    }

    #[test]
    fn database_stat_is_looked_up_by_name() {
        let collector = Collector::new(MockSource::typical_instance());

        let (db, _) = collector.database_stat("postgres").unwrap();
        assert_eq!(db.xact_commit, 18_000.0);
    }
}
