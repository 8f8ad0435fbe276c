//! HTTP request handlers for the control API.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use pgknob_core::bench::{BenchError, ProbeResult};
use pgknob_core::collector::{CollectError, SelectorError};
use pgknob_core::model::{AutovacuumSettings, Metric, Setting};

use crate::state::{AppInner, AppState, SharedState};

// ============================================================
// Errors
// ============================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    applied: Option<usize>,
}

/// Error response: status code plus a JSON `{"error": ...}` body.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
    applied: Option<usize>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            applied: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            applied: self.applied,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<CollectError> for ApiError {
    fn from(e: CollectError) -> Self {
        match &e {
            CollectError::InvalidRequest(_) => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
            CollectError::PartialApply { applied, .. } => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                applied: Some(*applied),
                message: e.to_string(),
            },
            CollectError::Source(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<SelectorError> for ApiError {
    fn from(e: SelectorError) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<BenchError> for ApiError {
    fn from(e: BenchError) -> Self {
        let status = match e {
            BenchError::Busy => StatusCode::CONFLICT,
            BenchError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

/// Runs a blocking data source call off the async runtime.
async fn run_blocking<T, F>(state: SharedState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppInner) -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| {
            error!(error = %e, "request panicked in spawn_blocking");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        })?
}

// ============================================================
// Health
// ============================================================

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Settings
// ============================================================

pub(crate) async fn handle_get_settings(State(state): AppState) -> Json<Vec<Setting>> {
    Json(state.cache.read())
}

#[derive(Deserialize)]
pub(crate) struct ApplySettingsRequest {
    settings: Vec<Setting>,
}

#[derive(Serialize)]
pub(crate) struct ApplySettingsResponse {
    applied: usize,
}

pub(crate) async fn handle_apply_settings(
    State(state): AppState,
    Json(req): Json<ApplySettingsRequest>,
) -> Result<Json<ApplySettingsResponse>, ApiError> {
    let settings: Vec<Setting> = req.settings.into_iter().map(Setting::normalized).collect();
    let applied = settings.len();

    run_blocking(state, move |inner| {
        inner.collector().apply_settings(&settings)?;
        info!(count = applied, "settings applied");

        // Write through so readers see the change before the next refresh.
        match inner.selector.list_settings() {
            Ok(fresh) => inner.cache.write(fresh),
            Err(e) => warn!(error = %e, "failed to reload settings after apply"),
        }
        Ok(())
    })
    .await?;

    Ok(Json(ApplySettingsResponse { applied }))
}

// ============================================================
// Metrics
// ============================================================

pub(crate) async fn handle_metrics(State(state): AppState) -> Result<Json<Vec<Metric>>, ApiError> {
    let metrics = run_blocking(state, |inner| Ok(inner.selector.list_all_metrics()?)).await?;
    Ok(Json(metrics))
}

pub(crate) async fn handle_aggregated_metrics(
    State(state): AppState,
) -> Result<Json<Vec<Metric>>, ApiError> {
    let metrics =
        run_blocking(state, |inner| Ok(inner.selector.list_aggregated_metrics()?)).await?;
    Ok(Json(metrics))
}

// ============================================================
// Autovacuum
// ============================================================

#[derive(Serialize)]
pub(crate) struct AutovacuumResponse {
    enabled: bool,
    settings: AutovacuumSettings,
}

pub(crate) async fn handle_autovacuum(
    State(state): AppState,
) -> Result<Json<AutovacuumResponse>, ApiError> {
    let response = run_blocking(state, |inner| {
        let collector = inner.collector();
        let enabled = collector.autovacuum_enabled()?;
        let (settings, _) = collector.autovacuum_settings()?;
        Ok(AutovacuumResponse { enabled, settings })
    })
    .await?;
    Ok(Json(response))
}

// ============================================================
// Benchmark
// ============================================================

/// Initializes the pgbench schema. Dropping the request kills the probe.
pub(crate) async fn handle_bench_init(State(state): AppState) -> Result<StatusCode, ApiError> {
    state.bench.prepare(state.shutdown.child_token()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Runs the pgbench load. Dropping the request kills the probe.
pub(crate) async fn handle_bench_run(State(state): AppState) -> Result<Json<ProbeResult>, ApiError> {
    let result = state.bench.run(state.shutdown.child_token()).await?;
    Ok(Json(result))
}
