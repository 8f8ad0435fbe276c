//! Shared application state and global allocator.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use axum::extract::State;
use tokio_util::sync::CancellationToken;

use pgknob_core::bench::BenchOrchestrator;
use pgknob_core::cache::SettingsCache;
use pgknob_core::collector::{Collector, MetricSelector, StatsSource};

/// Statistics source used by the server: PostgreSQL in production, a mock in tests.
pub(crate) type Source = Box<dyn StatsSource>;

pub(crate) struct AppInner {
    pub(crate) selector: Arc<MetricSelector<Source>>,
    // Refreshed in the background, written through after a settings change.
    pub(crate) cache: SettingsCache,
    pub(crate) bench: BenchOrchestrator,
    // Cancelled on shutdown; running probes are killed.
    pub(crate) shutdown: CancellationToken,
}

impl AppInner {
    pub(crate) fn collector(&self) -> &Collector<Source> {
        self.selector.collector()
    }
}

pub(crate) type SharedState = Arc<AppInner>;

pub(crate) type AppState = State<SharedState>;
