//! Settings snapshot shared between a periodic refresher and readers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::Setting;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Cloneable handle to the current settings snapshot.
///
/// The snapshot is replaced wholesale, never mutated in place. The lock is
/// held only to clone or swap the `Arc`.
#[derive(Clone, Default)]
pub struct SettingsCache {
    snapshot: Arc<Mutex<Arc<Vec<Setting>>>>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Arc<Vec<Setting>> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Copy of the current snapshot.
    pub fn read(&self) -> Vec<Setting> {
        self.current().as_ref().clone()
    }

    /// Replaces the snapshot.
    pub fn write(&self, settings: Vec<Setting>) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }

    /// Replaces the snapshot unless `cancel` fired. The check and the swap
    /// happen under the same lock.
    fn replace_unless_cancelled(&self, settings: Vec<Setting>, cancel: &CancellationToken) -> bool {
        let mut guard = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        if cancel.is_cancelled() {
            return false;
        }
        *guard = Arc::new(settings);
        true
    }
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Replaced(usize),
    Kept,
    Cancelled,
}

/// Background task that periodically reloads a [`SettingsCache`].
pub struct CacheRefresher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CacheRefresher {
    /// Spawns the refresh loop on the current tokio runtime.
    ///
    /// `loader` is a blocking call and runs on the blocking pool. The first
    /// load happens immediately. A load that takes longer than `interval` is
    /// abandoned and the previous snapshot is kept. A zero `interval` falls
    /// back to [`DEFAULT_REFRESH_INTERVAL`]. The loop ends when `cancel` (or a
    /// parent of it) is cancelled, or on [`stop`](Self::stop).
    pub fn spawn<F, E>(
        cache: SettingsCache,
        loader: F,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self
    where
        F: Fn() -> Result<Vec<Setting>, E> + Send + Sync + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let interval = if interval.is_zero() {
            warn!(
                default_secs = DEFAULT_REFRESH_INTERVAL.as_secs(),
                "zero refresh interval, using default"
            );
            DEFAULT_REFRESH_INTERVAL
        } else {
            interval
        };
        let cancel = cancel.child_token();
        let task = tokio::spawn(refresh_loop(cache, Arc::new(loader), interval, cancel.clone()));
        Self { cancel, task }
    }

    /// Stops the loop and waits for it to exit.
    ///
    /// Once this returns the snapshot is no longer replaced by this refresher.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "settings refresher task failed");
        }
    }
}

async fn refresh_loop<F, E>(
    cache: SettingsCache,
    loader: Arc<F>,
    interval: Duration,
    cancel: CancellationToken,
) where
    F: Fn() -> Result<Vec<Setting>, E> + Send + Sync + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut refresh_count: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let t0 = Instant::now();
        match refresh_once(&cache, &loader, interval, &cancel).await {
            Refresh::Replaced(count) => {
                refresh_count += 1;
                let duration_ms = t0.elapsed().as_millis() as u64;
                if refresh_count == 1 {
                    info!(duration_ms, count, "first settings snapshot loaded");
                } else {
                    debug!(duration_ms, count, refresh_count, "settings snapshot refreshed");
                }
            }
            Refresh::Kept => {}
            Refresh::Cancelled => break,
        }
    }

    debug!(refresh_count, "settings refresher stopped");
}

async fn refresh_once<F, E>(
    cache: &SettingsCache,
    loader: &Arc<F>,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Refresh
where
    F: Fn() -> Result<Vec<Setting>, E> + Send + Sync + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let loader = Arc::clone(loader);
    let load = tokio::task::spawn_blocking(move || (*loader)());

    // An abandoned load keeps running on the blocking pool; its result is dropped.
    let result = tokio::select! {
        _ = cancel.cancelled() => return Refresh::Cancelled,
        r = tokio::time::timeout(deadline, load) => match r {
            Ok(r) => r,
            Err(_) => {
                warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "settings refresh timed out, keeping previous snapshot"
                );
                return Refresh::Kept;
            }
        },
    };

    match result {
        Ok(Ok(settings)) => {
            let count = settings.len();
            if cache.replace_unless_cancelled(settings, cancel) {
                Refresh::Replaced(count)
            } else {
                Refresh::Cancelled
            }
        }
        Ok(Err(e)) => {
            warn!(error = %e, "settings refresh failed, keeping previous snapshot");
            Refresh::Kept
        }
        Err(e) => {
            error!(error = %e, "settings refresh panicked in spawn_blocking");
            Refresh::Kept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DEADLINE: Duration = Duration::from_secs(5);

    fn snapshot(cycle: usize) -> Vec<Setting> {
        vec![Setting::numeric("cycle", cycle as f64, None, None)]
    }

    /// Loader that succeeds on every cycle except `failing`.
    fn counting_loader(
        calls: Arc<AtomicUsize>,
        failing: usize,
    ) -> impl Fn() -> Result<Vec<Setting>, String> + Send + Sync + 'static {
        move || {
            let cycle = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if cycle == failing {
                Err(format!("connection refused on cycle {}", cycle))
            } else {
                Ok(snapshot(cycle))
            }
        }
    }

    #[test]
    fn read_returns_a_copy() {
        let cache = SettingsCache::new();
        assert!(cache.read().is_empty());

        cache.write(snapshot(1));
        let mut copy = cache.read();
        copy.clear();
        assert_eq!(cache.read(), snapshot(1));
    }

    #[tokio::test]
    async fn failed_cycle_keeps_previous_snapshot() {
        let cache = SettingsCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = Arc::new(counting_loader(calls.clone(), 3));
        let cancel = CancellationToken::new();

        for cycle in 1..=5 {
            let outcome = refresh_once(&cache, &loader, DEADLINE, &cancel).await;
            if cycle == 3 {
                assert_eq!(outcome, Refresh::Kept);
                assert_eq!(cache.read(), snapshot(2));
            } else {
                assert_eq!(outcome, Refresh::Replaced(1));
                assert_eq!(cache.read(), snapshot(cycle));
            }
        }
    }

    #[tokio::test]
    async fn cancelled_refresh_does_not_replace() {
        let cache = SettingsCache::new();
        cache.write(snapshot(7));
        let loader = Arc::new(counting_loader(Arc::new(AtomicUsize::new(0)), 0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = refresh_once(&cache, &loader, DEADLINE, &cancel).await;
        assert_eq!(outcome, Refresh::Cancelled);
        assert_eq!(cache.read(), snapshot(7));
    }

    #[tokio::test]
    async fn hung_load_is_abandoned_after_deadline() {
        let cache = SettingsCache::new();
        cache.write(snapshot(7));
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let loader = Arc::new(move || {
            // Blocks like a read from a server that stopped answering.
            let _ = gate
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(30));
            Ok::<_, String>(snapshot(8))
        });

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            refresh_once(&cache, &loader, Duration::from_millis(100), &CancellationToken::new()),
        )
        .await
        .expect("refresh waited for the hung load");

        assert_eq!(outcome, Refresh::Kept);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(cache.read(), snapshot(7));
        release.send(()).unwrap();
    }

    #[tokio::test]
    async fn zero_interval_falls_back_to_default() {
        let cache = SettingsCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = CacheRefresher::spawn(
            cache.clone(),
            counting_loader(calls.clone(), 0),
            Duration::ZERO,
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.read().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first load did not happen");
        refresher.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_replacement_after_stop() {
        let cache = SettingsCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = CacheRefresher::spawn(
            cache.clone(),
            counting_loader(calls.clone(), 0),
            Duration::from_millis(5),
            CancellationToken::new(),
        );

        while calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        refresher.stop().await;

        let frozen = cache.read();
        assert!(!frozen.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.read(), frozen);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_refresher() {
        let cache = SettingsCache::new();
        let parent = CancellationToken::new();
        let refresher = CacheRefresher::spawn(
            cache.clone(),
            || Ok::<_, String>(snapshot(1)),
            Duration::from_secs(3600),
            parent.clone(),
        );

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(5), refresher.stop())
            .await
            .expect("refresher did not stop");
    }
}
