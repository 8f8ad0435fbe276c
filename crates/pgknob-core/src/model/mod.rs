//! Data model: typed values, settings, metrics and statistics records.

pub mod stats;
pub mod value;

pub use stats::{
    AggregateStats, AutovacuumSettings, Bloat, DatabaseStat, IndexBloat, QueryTypesDistribution,
    SharedBufferHitRate, TableBloat, TableStat, WalWriteAndFlushStat,
};
pub use value::{Metric, MetricFields, Scope, Setting, TypedValue, to_metrics};
