//! PostgreSQL statistics and settings collector.
//!
//! This module turns rows from a statistics data source into typed, scope-tagged
//! entities, and pushes setting changes back to the server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    MetricSelector                    │
//! │        raw metric list  /  aggregated metric list    │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//! ┌──────────────────────────▼───────────────────────────┐
//! │                      Collector                       │
//! │  settings (kind filter) · stats · bloat · autovacuum │
//! │  apply_settings (set × N, then one reload)           │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//!                     ┌──────▼──────┐
//!                     │ StatsSource │ (trait)
//!                     └──────┬──────┘
//!              ┌─────────────┴─────────────┐
//!       ┌──────▼─────────┐          ┌──────▼──────┐
//!       │ PostgresSource │          │ MockSource  │
//!       │ (live server)  │          │ (Testing)   │
//!       └────────────────┘          └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use pgknob_core::collector::{Collector, MockSource};
//! use pgknob_core::model::Scope;
//!
//! let collector = Collector::new(MockSource::typical_instance());
//! let (settings, scope) = collector.list_settings().unwrap();
//! assert_eq!(scope, Scope::General);
//! assert!(settings.iter().all(|s| s.value.is_numeric()));
//! ```

mod autovacuum;
#[allow(clippy::module_inception)]
mod collector;
pub mod mock;
mod postgres;
pub mod selector;
pub mod source;

pub use collector::{CollectError, Collector};
pub use mock::MockSource;
pub use postgres::{ConnectionParams, PostgresSource};
pub use selector::{MetricSelector, SelectorError};
pub use source::{RawSetting, SourceError, StatsSource};
