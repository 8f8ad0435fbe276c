//! Raw and aggregated metric lists built on top of the collector.

use chrono::Utc;
use tracing::debug;

use super::collector::{CollectError, Collector};
use super::source::StatsSource;
use crate::aggregate::{AggregateError, aggregate_tables, most_bloated};
use crate::model::{Metric, Scope, Setting, to_metrics};

/// Error type for metric list assembly.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorError {
    /// A collector call failed.
    Collect {
        step: &'static str,
        source: CollectError,
    },
    /// Aggregate selection failed (e.g. no bloat rows).
    Aggregate {
        step: &'static str,
        source: AggregateError,
    },
}

impl std::fmt::Display for SelectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorError::Collect { step, source } => write!(f, "{}: {}", step, source),
            SelectorError::Aggregate { step, source } => write!(f, "{}: {}", step, source),
        }
    }
}

impl std::error::Error for SelectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SelectorError::Collect { source, .. } => Some(source),
            SelectorError::Aggregate { source, .. } => Some(source),
        }
    }
}

fn collect<T>(step: &'static str, r: Result<T, CollectError>) -> Result<T, SelectorError> {
    r.map_err(|source| SelectorError::Collect { step, source })
}

/// Composes collector calls into flat metric lists for one database.
pub struct MetricSelector<S> {
    collector: Collector<S>,
    database: String,
}

impl<S: StatsSource> MetricSelector<S> {
    pub fn new(collector: Collector<S>, database: impl Into<String>) -> Self {
        Self {
            collector,
            database: database.into(),
        }
    }

    pub fn collector(&self) -> &Collector<S> {
        &self.collector
    }

    pub fn list_settings(&self) -> Result<Vec<Setting>, SelectorError> {
        let (settings, _) = collect("settings", self.collector.list_settings())?;
        Ok(settings)
    }

    /// Every collected record, flattened.
    ///
    /// Order: database counters, each table, bgwriter counters, each index
    /// bloat row, each table bloat row, buffer hit rate, query types.
    pub fn list_all_metrics(&self) -> Result<Vec<Metric>, SelectorError> {
        let mut metrics = Vec::new();

        let (db, scope) = collect("database", self.collector.database_stat(&self.database))?;
        metrics.extend(to_metrics(&db, scope));

        let (tables, scope) = collect("tables", self.collector.tables())?;
        for t in &tables {
            metrics.extend(to_metrics(t, scope));
        }

        let (wal, scope) = collect("bgwriter", self.collector.wal_write_and_flush())?;
        metrics.extend(to_metrics(&wal, scope));

        let (indexes, scope) = collect("index bloat", self.collector.index_bloat())?;
        for i in &indexes {
            metrics.extend(to_metrics(i, scope));
        }

        let (table_bloat, scope) = collect("table bloat", self.collector.table_bloat())?;
        for t in &table_bloat {
            metrics.extend(to_metrics(t, scope));
        }

        let (hit, scope) = collect("hit rate", self.collector.shared_buffer_hit_rate())?;
        metrics.extend(to_metrics(&hit, scope));

        let (dist, scope) = collect("query types", self.collector.query_types_distribution())?;
        metrics.extend(to_metrics(&dist, scope));

        debug!(count = metrics.len(), tables = tables.len(), "listed all metrics");
        Ok(metrics)
    }

    /// Instance-wide metrics with per-object records reduced.
    ///
    /// Bloat lists collapse to their most bloated row, table statistics to
    /// [`AggregateStats`](crate::model::AggregateStats). Empty bloat data is an
    /// error.
    pub fn list_aggregated_metrics(&self) -> Result<Vec<Metric>, SelectorError> {
        let mut metrics = Vec::new();

        let (db, scope) = collect("database", self.collector.database_stat(&self.database))?;
        metrics.extend(to_metrics(&db, scope));

        let (wal, scope) = collect("bgwriter", self.collector.wal_write_and_flush())?;
        metrics.extend(to_metrics(&wal, scope));

        let (hit, scope) = collect("hit rate", self.collector.shared_buffer_hit_rate())?;
        metrics.extend(to_metrics(&hit, scope));

        let (dist, scope) = collect("query types", self.collector.query_types_distribution())?;
        metrics.extend(to_metrics(&dist, scope));

        let (indexes, scope) = collect("index bloat", self.collector.index_bloat())?;
        let index = most_bloated(&indexes).map_err(|source| SelectorError::Aggregate {
            step: "index bloat",
            source,
        })?;
        metrics.extend(to_metrics(index, scope));

        let (tables_bloat, scope) = collect("table bloat", self.collector.table_bloat())?;
        let table = most_bloated(&tables_bloat).map_err(|source| SelectorError::Aggregate {
            step: "table bloat",
            source,
        })?;
        metrics.extend(to_metrics(table, scope));

        let (tables, _) = collect("tables", self.collector.tables())?;
        let agg = aggregate_tables(&tables, Utc::now());
        metrics.extend(to_metrics(&agg, Scope::General));

        debug!(count = metrics.len(), "listed aggregated metrics");
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{MockSource, op};
    use crate::model::TypedValue;

    fn selector(source: MockSource) -> MetricSelector<MockSource> {
        MetricSelector::new(Collector::new(source), "postgres")
    }

    fn position(metrics: &[Metric], name: &str) -> usize {
        metrics
            .iter()
            .position(|m| m.name == name)
            .unwrap_or_else(|| panic!("{name} missing"))
    }

    #[test]
    fn all_metrics_follow_collection_order() {
        let metrics = selector(MockSource::typical_instance())
            .list_all_metrics()
            .unwrap();

        assert_eq!(metrics[0].name, "NumOfTransactionsCommitted");
        assert_eq!(metrics.last().unwrap().name, "Other");

        let order = [
            "TimeSpendIdleInTransaction",
            "RelationID",
            "CheckpointsTimed",
            "IndexName",
            "NumOfRows",
            "HitRate",
            "Insert",
        ];
        let positions: Vec<usize> = order.iter().map(|n| position(&metrics, n)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
    }

    #[test]
    fn all_metrics_carry_scopes_per_record() {
        let metrics = selector(MockSource::typical_instance())
            .list_all_metrics()
            .unwrap();

        let relation_names: Vec<&Metric> =
            metrics.iter().filter(|m| m.name == "RelationName").collect();
        assert_eq!(relation_names.len(), 2);
        assert!(relation_names.iter().all(|m| m.scope == Scope::PerObject));

        let hit = &metrics[position(&metrics, "HitRate")];
        assert_eq!(hit.scope, Scope::General);
        assert_eq!(hit.value, TypedValue::Float(0.98));
        assert!(metrics.iter().all(|m| m.scope != Scope::Unspecified));
    }

    #[test]
    fn aggregated_metrics_pick_most_bloated_and_aggregate_tables() {
        let metrics = selector(MockSource::typical_instance())
            .list_aggregated_metrics()
            .unwrap();

        let table_names: Vec<&TypedValue> = metrics
            .iter()
            .filter(|m| m.name == "TableName")
            .map(|m| &m.value)
            .collect();
        assert_eq!(
            table_names,
            [
                &TypedValue::String("pgbench_accounts".into()),
                &TypedValue::String("pgbench_branches".into()),
            ]
        );
        assert!(!metrics.iter().any(|m| m.name == "RelationID"));

        let total = &metrics[position(&metrics, "TotalLiveTuples")];
        assert_eq!(total.value, TypedValue::Float(100_001.0));
        assert_eq!(total.scope, Scope::General);
        assert_eq!(metrics.last().unwrap().name, "ProportionVacuumed");

        let order = ["NumOfDeadlocks", "BuffersAlloc", "HitRate", "Select", "IndexName"];
        let positions: Vec<usize> = order.iter().map(|n| position(&metrics, n)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
    }

    #[test]
    fn aggregated_metrics_require_bloat_rows() {
        let source = MockSource::new();
        source.add_table_bloat(Default::default());
        let err = selector(source).list_aggregated_metrics().unwrap_err();

        assert_eq!(
            err,
            SelectorError::Aggregate {
                step: "index bloat",
                source: AggregateError::NoBloatStats,
            }
        );
    }

    #[test]
    fn collector_failure_names_the_step() {
        let source = MockSource::typical_instance();
        source.fail(op::BGWRITER, true);
        let err = selector(source).list_all_metrics().unwrap_err();

        assert!(matches!(err, SelectorError::Collect { step: "bgwriter", .. }));
        assert!(err.to_string().starts_with("bgwriter: "));
    }

    #[test]
    fn list_settings_passes_through() {
        let settings = selector(MockSource::typical_instance())
            .list_settings()
            .unwrap();
        assert_eq!(settings.len(), 3);
    }
}
