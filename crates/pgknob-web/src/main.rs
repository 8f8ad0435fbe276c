mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgknob_core::bench::{BenchConfig, BenchOrchestrator};
use pgknob_core::cache::{CacheRefresher, SettingsCache};
use pgknob_core::collector::{
    Collector, ConnectionParams, MetricSelector, PostgresSource, StatsSource,
};

use state::{AppInner, SharedState, Source};

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(name = "pgknob-web", about = "pgknob control API server", version = pgknob_core::VERSION)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "PGKNOB_LISTEN")]
    listen: String,

    /// Settings cache refresh interval in seconds.
    #[arg(long, default_value = "10", env = "PGKNOB_INTERVAL")]
    interval: u64,

    /// Per-statement deadline for statistics queries, in milliseconds.
    #[arg(long, default_value = "5000", env = "PGKNOB_STATEMENT_TIMEOUT")]
    statement_timeout: u64,

    /// Path to the pgbench binary.
    #[arg(long, default_value = "pgbench", env = "PGKNOB_BENCH_PROGRAM")]
    bench_program: PathBuf,

    /// pgbench client count (-c). 0 keeps the pgbench default.
    #[arg(long, default_value = "0", env = "PGKNOB_BENCH_CLIENTS")]
    bench_clients: u32,

    /// pgbench worker thread count (-j).
    #[arg(long, default_value = "0", env = "PGKNOB_BENCH_THREADS")]
    bench_threads: u32,

    /// pgbench run duration in seconds (-T).
    #[arg(long, default_value = "0", env = "PGKNOB_BENCH_DURATION")]
    bench_duration: u64,

    /// pgbench initialization scale factor (--scale).
    #[arg(long, default_value = "0", env = "PGKNOB_BENCH_SCALE")]
    bench_scale: u32,

    /// Partition count of pgbench_accounts (--partitions).
    #[arg(long, default_value = "0", env = "PGKNOB_BENCH_PARTITIONS")]
    bench_partitions: u32,

    /// Create foreign keys during initialization.
    #[arg(long, env = "PGKNOB_BENCH_FOREIGN_KEYS")]
    bench_foreign_keys: bool,

    /// Skip vacuum after initialization.
    #[arg(long, env = "PGKNOB_BENCH_NO_VACUUM")]
    bench_no_vacuum: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn bench_config(&self) -> BenchConfig {
        BenchConfig {
            program: self.bench_program.clone(),
            clients: self.bench_clients,
            threads: self.bench_threads,
            duration_secs: self.bench_duration,
            scale: self.bench_scale,
            partitions: self.bench_partitions,
            foreign_keys: self.bench_foreign_keys,
            no_vacuum: self.bench_no_vacuum,
        }
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// `RUST_LOG` directives are applied first; `-v`/`-q` set the level of our crates.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for krate in ["pgknob_web", "pgknob_core"] {
        match format!("{}={}", krate, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("invalid log directive for {}: {}", krate, e),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    runtime.block_on(async_main(args));
}

pub(crate) fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::handle_health))
        .route(
            "/api/v1/settings",
            get(handlers::handle_get_settings).post(handlers::handle_apply_settings),
        )
        .route("/api/v1/metrics", get(handlers::handle_metrics))
        .route(
            "/api/v1/metrics/aggregated",
            get(handlers::handle_aggregated_metrics),
        )
        .route("/api/v1/autovacuum", get(handlers::handle_autovacuum))
        .route("/api/v1/bench/init", post(handlers::handle_bench_init))
        .route("/api/v1/bench/run", post(handlers::handle_bench_run))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}

async fn async_main(args: Args) {
    info!(version = pgknob_core::VERSION, "starting pgknob-web");

    let params = match ConnectionParams::from_env() {
        Ok(params) => params,
        Err(e) => {
            error!(error = %e, "PostgreSQL connection settings unavailable");
            process::exit(1);
        }
    };
    let database = params.database.clone();
    let pg = PostgresSource::new(params.clone())
        .with_statement_timeout(Duration::from_millis(args.statement_timeout));
    let source: Source = Box::new(pg);

    // Blocking client: connect off the async runtime. Failure is not fatal,
    // every call reconnects on demand.
    let source = match tokio::task::spawn_blocking(move || {
        if let Err(e) = source.settings() {
            warn!(error = %e, "PostgreSQL not reachable at startup");
        }
        source
    })
    .await
    {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "startup check panicked");
            process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let selector = Arc::new(MetricSelector::new(Collector::new(source), database));
    let cache = SettingsCache::new();

    let refresher = {
        let selector = Arc::clone(&selector);
        CacheRefresher::spawn(
            cache.clone(),
            move || selector.list_settings(),
            Duration::from_secs(args.interval),
            shutdown.clone(),
        )
    };

    let bench_config = args.bench_config();
    info!(probe = ?params, config = ?bench_config, "benchmark probe configured");

    let state: SharedState = Arc::new(AppInner {
        selector,
        cache,
        bench: BenchOrchestrator::new(bench_config, params),
        shutdown: shutdown.clone(),
    });

    let addr: SocketAddr = match args.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "invalid listen address");
            process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, "listening");

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let app = router(Arc::clone(&state));
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
    {
        error!(error = %e, "server error");
    }

    shutdown.cancel();
    refresher.stop().await;

    // The blocking PostgreSQL client owns a runtime of its own and must not be
    // dropped on an async worker thread.
    if let Err(e) = tokio::task::spawn_blocking(move || drop(state)).await {
        warn!(error = %e, "failed to release state");
    }
    info!("stopped");
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
