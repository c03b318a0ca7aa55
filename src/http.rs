//! REST surface.
//!
//! `POST /api/run-code` runs a submission, `GET /api/runs` lists the caller's
//! recorded runs and `GET /api/health` reports sandbox reachability.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::identity::resolve_user_id;
use crate::orchestrator::Orchestrator;
use crate::report::{RunRecord, RunReporter};
use crate::types::{ExecutionRequest, ExecutionResult, Language, RequestError};

/// Shared handles for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub reporter: Option<Arc<dyn RunReporter>>,
}

/// Body of `POST /api/run-code`.
#[derive(Debug, Deserialize)]
pub struct RunCodeRequest {
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, alias = "name")]
    pub algorithm_name: Option<String>,
    #[serde(default)]
    pub input_size: Option<u64>,
}

/// Response of `POST /api/run-code`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunCodeResponse {
    #[serde(flatten)]
    pub result: ExecutionResult,
    /// Whether the run was persisted by the reporter.
    pub recorded: bool,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub algorithm_name: Option<String>,
}

/// Errors returned to HTTP clients instead of an execution result.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    BadRequest(#[from] RequestError),

    #[error("User not authenticated")]
    Unauthenticated,

    #[error("Run history is not configured")]
    ReporterDisabled,

    #[error("Failed to fetch run history: {0}")]
    Reporter(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::ReporterDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Reporter(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/run-code", post(run_code))
        .route("/api/runs", get(list_runs))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the router until Ctrl-C.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Starting HTTP server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down HTTP server");
        })
        .await?;
    Ok(())
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

async fn run_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RunCodeRequest>,
) -> Result<Json<RunCodeResponse>, ApiError> {
    let language = Language::from_optional(body.language.as_deref())?;
    let mut request = ExecutionRequest::new(body.code, language)?;
    if let Some(name) = body.algorithm_name {
        request = request.with_algorithm_label(name);
    }
    if let Some(size) = body.input_size {
        request = request.with_input_size(size);
    }

    let result = state.orchestrator.execute(&request).await;

    // Only completed runs have a runtime worth charting.
    let mut recorded = false;
    if let (true, Some(reporter), Some(user_id)) = (
        result.success,
        &state.reporter,
        resolve_user_id(authorization(&headers)),
    ) {
        recorded = reporter
            .record_run(&RunRecord::new(&user_id, &request, &result))
            .await;
    }

    Ok(Json(RunCodeResponse { result, recorded }))
}

async fn list_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let user_id = resolve_user_id(authorization(&headers)).ok_or(ApiError::Unauthenticated)?;
    let reporter = state.reporter.as_ref().ok_or(ApiError::ReporterDisabled)?;

    let runs = reporter
        .list_runs(&user_id, query.algorithm_name.as_deref())
        .await
        .map_err(|e| ApiError::Reporter(e.to_string()))?;
    Ok(Json(runs))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "algo-runner",
        "sandbox_available": state.orchestrator.sandbox_available().await,
    }))
}
