//! Statistics records scanned from PostgreSQL views.
//!
//! Each record declares its metric fields explicitly through [`MetricFields`].
//! Field names are the stable external names consumed by the tuning model, so
//! they are spelled exactly as published (including historic typos such as
//! `NufOfRowsInserted`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::{MetricFields, TypedValue};

fn timestamp(ts: &Option<DateTime<Utc>>) -> Option<TypedValue> {
    ts.map(|t| TypedValue::String(t.to_rfc3339()))
}

/// Statement counts from `pg_stat_statements`, bucketed by leading keyword.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryTypesDistribution {
    pub insert: i64,
    pub update: i64,
    pub delete: i64,
    pub select: i64,
    pub other: i64,
}

impl MetricFields for QueryTypesDistribution {
    fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)> {
        vec![
            ("Insert", Some(self.insert.into())),
            ("Update", Some(self.update.into())),
            ("Delete", Some(self.delete.into())),
            ("Select", Some(self.select.into())),
            ("Other", Some(self.other.into())),
        ]
    }
}

/// Heap block hit ratio over `pg_statio_user_tables`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedBufferHitRate {
    pub hit_rate: f64,
}

impl MetricFields for SharedBufferHitRate {
    fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)> {
        vec![("HitRate", Some(self.hit_rate.into()))]
    }
}

/// One row of `pg_stat_user_tables`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStat {
    pub relid: i64,
    pub relname: String,

    pub n_live_tup: i64,
    pub n_dead_tup: i64,

    pub seq_scan: i64,
    pub idx_scan: i64,

    pub n_tup_ins: i64,
    pub n_tup_upd: i64,
    pub n_tup_del: i64,

    pub last_vacuum: Option<DateTime<Utc>>,
    pub last_autovacuum: Option<DateTime<Utc>>,
    pub last_analyze: Option<DateTime<Utc>>,
    pub last_autoanalyze: Option<DateTime<Utc>>,
}

impl MetricFields for TableStat {
    fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)> {
        vec![
            ("RelationID", Some(self.relid.into())),
            ("RelationName", Some(self.relname.clone().into())),
            ("NumberOfLiveTuples", Some(self.n_live_tup.into())),
            ("NumberOfDeadTuples", Some(self.n_dead_tup.into())),
            ("NumberOfSeqScans", Some(self.seq_scan.into())),
            ("NumberOfIndexScans", Some(self.idx_scan.into())),
            ("NumberOfInserts", Some(self.n_tup_ins.into())),
            ("NumberOfUpdates", Some(self.n_tup_upd.into())),
            ("NumberOfDeletes", Some(self.n_tup_del.into())),
            ("LastVacuumTime", timestamp(&self.last_vacuum)),
            ("LastAutoVacuumTime", timestamp(&self.last_autovacuum)),
            ("LastAnalyzeTime", timestamp(&self.last_analyze)),
            ("LastAutoAnalyze", timestamp(&self.last_autoanalyze)),
        ]
    }
}

/// Derived statistics over all user tables. Always instance-wide.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_live_tuples: i64,
    pub average_live_tuples: f64,

    pub total_dead_tuples: i64,
    pub average_dead_tuples: f64,

    pub total_seq_scans: i64,
    pub total_index_scans: i64,

    pub total_inserts: i64,
    pub total_updates: i64,
    pub total_deletes: i64,

    pub dead_to_live_ratio: f64,
    pub scan_efficiency: f64,
    pub update_to_insert_ratio: f64,

    pub average_days_since_last_vacuum: f64,
    pub proportion_vacuumed: f64,
}

impl MetricFields for AggregateStats {
    fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)> {
        vec![
            ("TotalLiveTuples", Some(self.total_live_tuples.into())),
            ("AverageLiveTuples", Some(self.average_live_tuples.into())),
            ("TotalDeadTuples", Some(self.total_dead_tuples.into())),
            ("AverageDeadTuples", Some(self.average_dead_tuples.into())),
            ("TotalSeqScans", Some(self.total_seq_scans.into())),
            ("TotalIndexScans", Some(self.total_index_scans.into())),
            ("TotalInserts", Some(self.total_inserts.into())),
            ("TotalUpdates", Some(self.total_updates.into())),
            ("TotalDeletes", Some(self.total_deletes.into())),
            ("DeadToLiveRatio", Some(self.dead_to_live_ratio.into())),
            ("ScanEfficiency", Some(self.scan_efficiency.into())),
            ("UpdateToInsertRatio", Some(self.update_to_insert_ratio.into())),
            (
                "AverageDaysSinceLastVacuum",
                Some(self.average_days_since_last_vacuum.into()),
            ),
            ("ProportionVacuumed", Some(self.proportion_vacuumed.into())),
        ]
    }
}

/// Checkpoint and background writer counters from `pg_stat_bgwriter`.
///
/// Singleton view; all fields are cumulative.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalWriteAndFlushStat {
    pub checkpoints_timed: f64,
    pub checkpoints_req: f64,
    /// Total time spent writing checkpoint files (ms).
    pub checkpoint_write_time: f64,
    /// Total time spent syncing checkpoint files (ms).
    pub checkpoint_sync_time: f64,
    pub buffers_checkpoint: f64,
    pub buffers_clean: f64,
    pub maxwritten_clean: f64,
    pub buffers_backend: f64,
    pub buffers_backend_fsync: f64,
    pub buffers_alloc: f64,
}

impl MetricFields for WalWriteAndFlushStat {
    fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)> {
        vec![
            ("CheckpointsTimed", Some(self.checkpoints_timed.into())),
            ("CheckpointsReq", Some(self.checkpoints_req.into())),
            ("CheckpointWriteTime", Some(self.checkpoint_write_time.into())),
            ("CheckpointSyncTime", Some(self.checkpoint_sync_time.into())),
            ("BuffersCheckpoint", Some(self.buffers_checkpoint.into())),
            ("BuffersClean", Some(self.buffers_clean.into())),
            ("MaxWrittenClean", Some(self.maxwritten_clean.into())),
            ("BuffersBackend", Some(self.buffers_backend.into())),
            ("BuffersBackendFsync", Some(self.buffers_backend_fsync.into())),
            ("BuffersAlloc", Some(self.buffers_alloc.into())),
        ]
    }
}

/// Records that carry a bloat estimate.
pub trait Bloat {
    fn bloat_percent(&self) -> f64;
}

/// Estimated table bloat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableBloat {
    pub table_name: String,
    pub num_rows: f64,
    pub bloat_percent: f64,
    pub bloat_mb: f64,
    pub table_mb: f64,
}

impl Bloat for TableBloat {
    fn bloat_percent(&self) -> f64 {
        self.bloat_percent
    }
}

impl MetricFields for TableBloat {
    fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)> {
        vec![
            ("TableName", Some(self.table_name.clone().into())),
            ("NumOfRows", Some(self.num_rows.into())),
            ("BloatInPercent", Some(self.bloat_percent.into())),
            ("BloatInMegabytes", Some(self.bloat_mb.into())),
            ("TableSize", Some(self.table_mb.into())),
        ]
    }
}

/// Estimated btree index bloat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexBloat {
    pub table_name: String,
    pub index_name: String,
    pub bloat_percent: f64,
    pub bloat_mb: f64,
    pub index_mb: f64,
    pub table_mb: f64,
    pub index_scans: f64,
}

impl Bloat for IndexBloat {
    fn bloat_percent(&self) -> f64 {
        self.bloat_percent
    }
}

impl MetricFields for IndexBloat {
    fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)> {
        vec![
            ("TableName", Some(self.table_name.clone().into())),
            ("IndexName", Some(self.index_name.clone().into())),
            ("BloatInPercent", Some(self.bloat_percent.into())),
            ("BloatInMegabytes", Some(self.bloat_mb.into())),
            ("IndexSize", Some(self.index_mb.into())),
            ("TableSize", Some(self.table_mb.into())),
            ("NumOfIndexScans", Some(self.index_scans.into())),
        ]
    }
}

/// Counters of one database from `pg_stat_database`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStat {
    pub xact_commit: f64,
    pub xact_rollback: f64,
    pub blks_read: f64,
    pub blks_hit: f64,
    pub tup_returned: f64,
    pub tup_fetched: f64,
    pub tup_inserted: f64,
    pub tup_updated: f64,
    pub tup_deleted: f64,
    pub conflicts: f64,
    pub temp_files: f64,
    pub temp_bytes: f64,
    pub deadlocks: f64,
    /// Time spent reading data file blocks (ms).
    pub blk_read_time: f64,
    /// Time spent writing data file blocks (ms).
    pub blk_write_time: f64,
    pub active_time: f64,
    pub idle_in_transaction_time: f64,
}

impl MetricFields for DatabaseStat {
    fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)> {
        vec![
            ("NumOfTransactionsCommitted", Some(self.xact_commit.into())),
            ("NumOfTransactionsRollback", Some(self.xact_rollback.into())),
            ("NumbOfDiskBlocksRead", Some(self.blks_read.into())),
            ("NumbOfDiskBlocksInBufferCache", Some(self.blks_hit.into())),
            (
                "NumOfLiveRowsFetchedBySeqAndIndex",
                Some(self.tup_returned.into()),
            ),
            ("NumOfLiveRowsFetchedByIndex", Some(self.tup_fetched.into())),
            ("NufOfRowsInserted", Some(self.tup_inserted.into())),
            ("NufOfRowsUpdated", Some(self.tup_updated.into())),
            ("NumOfRowsDeleted", Some(self.tup_deleted.into())),
            ("NumOfConflictCanceled", Some(self.conflicts.into())),
            ("NumOfTempFiles", Some(self.temp_files.into())),
            ("TotalAmountOfBytesInTempFiles", Some(self.temp_bytes.into())),
            ("NumOfDeadlocks", Some(self.deadlocks.into())),
            (
                "TimeSpentReadingDataFileBlocks",
                Some(self.blk_read_time.into()),
            ),
            (
                "TimeSpentWritingDataFileBlocks",
                Some(self.blk_write_time.into()),
            ),
            ("TimeSpentExecutingStatements", Some(self.active_time.into())),
            (
                "TimeSpendIdleInTransaction",
                Some(self.idle_in_transaction_time.into()),
            ),
        ]
    }
}

/// Instance-wide autovacuum configuration (category `Autovacuum` of `pg_settings`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AutovacuumSettings {
    pub max_workers: i32,
    pub work_mem: i32,
    pub naptime_seconds: i32,
    pub vacuum_threshold: i32,
    pub vacuum_scale_factor: f64,
    pub analyze_threshold: i32,
    pub analyze_scale_factor: f64,
    pub freeze_max_age: i64,
    pub multixact_freeze_max_age: i64,
    pub vacuum_cost_delay: i32,
    pub vacuum_cost_limit: i32,
}

impl AutovacuumSettings {
    /// Builds settings from `(name, setting)` pairs.
    ///
    /// Unknown names are ignored; values that fail to parse stay zero.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut s = Self::default();
        for (name, setting) in pairs {
            let int = || setting.trim().parse::<i32>().unwrap_or(0);
            let big = || setting.trim().parse::<i64>().unwrap_or(0);
            let float = || setting.trim().parse::<f64>().unwrap_or(0.0);
            match name {
                "autovacuum_max_workers" => s.max_workers = int(),
                "autovacuum_work_mem" => s.work_mem = int(),
                "autovacuum_naptime" => s.naptime_seconds = int(),
                "autovacuum_vacuum_threshold" => s.vacuum_threshold = int(),
                "autovacuum_vacuum_scale_factor" => s.vacuum_scale_factor = float(),
                "autovacuum_analyze_threshold" => s.analyze_threshold = int(),
                "autovacuum_analyze_scale_factor" => s.analyze_scale_factor = float(),
                "autovacuum_freeze_max_age" => s.freeze_max_age = big(),
                "autovacuum_multixact_freeze_max_age" => s.multixact_freeze_max_age = big(),
                "autovacuum_vacuum_cost_delay" => s.vacuum_cost_delay = float() as i32,
                "autovacuum_vacuum_cost_limit" => s.vacuum_cost_limit = int(),
                _ => {}
            }
        }
        s
    }
}
