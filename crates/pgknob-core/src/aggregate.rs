//! Derived statistics over per-table records.

use chrono::{DateTime, Utc};

use crate::model::{AggregateStats, Bloat, TableStat};

/// Error type for aggregate selection.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateError {
    /// Most-bloated selection over an empty list.
    NoBloatStats,
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateError::NoBloatStats => write!(f, "no bloat stats"),
        }
    }
}

impl std::error::Error for AggregateError {}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 { 0.0 } else { num / den }
}

/// Folds per-table records into instance-wide totals, averages and ratios.
///
/// `now` is the reference point for whole days elapsed since the last manual
/// vacuum. Every division is guarded, so an empty input yields all zeros.
pub fn aggregate_tables(tables: &[TableStat], now: DateTime<Utc>) -> AggregateStats {
    let mut agg = AggregateStats::default();
    let mut vacuum_days: i64 = 0;
    let mut vacuumed: i64 = 0;

    for t in tables {
        agg.total_live_tuples += t.n_live_tup;
        agg.total_dead_tuples += t.n_dead_tup;
        agg.total_seq_scans += t.seq_scan;
        agg.total_index_scans += t.idx_scan;
        agg.total_inserts += t.n_tup_ins;
        agg.total_updates += t.n_tup_upd;
        agg.total_deletes += t.n_tup_del;

        if let Some(at) = t.last_vacuum {
            vacuum_days += (now - at).num_days();
            vacuumed += 1;
        }
    }

    let n = tables.len() as f64;
    let modifications = agg.total_inserts + agg.total_updates + agg.total_deletes;

    agg.average_live_tuples = ratio(agg.total_live_tuples as f64, n);
    agg.average_dead_tuples = ratio(agg.total_dead_tuples as f64, n);
    agg.dead_to_live_ratio = ratio(agg.total_dead_tuples as f64, agg.total_live_tuples as f64);
    agg.scan_efficiency = ratio(
        (agg.total_seq_scans + agg.total_index_scans) as f64,
        modifications as f64,
    );
    agg.update_to_insert_ratio = ratio(agg.total_updates as f64, agg.total_inserts as f64);
    agg.average_days_since_last_vacuum = ratio(vacuum_days as f64, vacuumed as f64);
    agg.proportion_vacuumed = ratio(vacuumed as f64, n);

    agg
}

/// Record with the highest bloat percentage; the first one wins on ties.
pub fn most_bloated<T: Bloat>(items: &[T]) -> Result<&T, AggregateError> {
    let mut iter = items.iter();
    let mut best = iter.next().ok_or(AggregateError::NoBloatStats)?;
    for item in iter {
        if item.bloat_percent() > best.bloat_percent() {
            best = item;
        }
    }
    Ok(best)
}
