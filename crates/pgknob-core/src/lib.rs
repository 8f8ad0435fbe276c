//! pgknob-core — PostgreSQL knob and statistics collection library.
//!
//! Provides:
//! - `model` — typed values, settings, scope-tagged metrics and statistics records
//! - `collector` — data source seam (PostgreSQL, mock), collector facade, metric selector
//! - `aggregate` — derived statistics over per-table records
//! - `cache` — periodically refreshed settings snapshot
//! - `bench` — pgbench orchestration with single-outcome results

pub mod aggregate;
pub mod bench;
pub mod cache;
pub mod collector;
pub mod model;

/// Crate version, reported by binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
