//! HTTP surface of the harvester service.
//!
//! Thin handlers over [`HarvesterExecutor`]: registry inspection and refresh,
//! plus incremental and full runs narrowed by query parameters.

use crate::executor::{ExecutorError, HarvesterExecutor, RunOptions, RunOutcome};
use crate::model::{ExtractionResult, RunMode, RunSummary};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    /// The request cannot be served as asked
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The run or registry operation failed
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::EmptyRegistry => Self::BadRequest(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
        };

        tracing::warn!(
            error_code = body.error,
            error_message = %body.message,
            status = %status,
            "API error"
        );

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

// =============================================================================
// Request / response types
// =============================================================================

/// Query parameters accepted by the run endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct RunParams {
    pub prefix: Option<String>,
    /// Comma-separated field names
    pub fields: Option<String>,
    pub limit: Option<usize>,
}

impl RunParams {
    fn into_options(self) -> RunOptions {
        let fields = self.fields.map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });
        RunOptions {
            prefix: self.prefix.filter(|p| !p.is_empty()),
            fields: fields.filter(|f| !f.is_empty()),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub status: &'static str,
    pub models_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RunResponse {
    Nothing {
        status: &'static str,
        message: &'static str,
        results: Vec<ExtractionResult>,
    },
    Summary(RunSummary),
}

// =============================================================================
// Routes
// =============================================================================

pub type AppState = Arc<HarvesterExecutor>;

pub fn router(executor: Arc<HarvesterExecutor>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/models/list", get(list_models_handler))
        .route("/models/update", post(update_models_handler))
        .route("/run/inc", post(run_incremental_handler))
        .route("/run/full", post(run_full_handler))
        // Legacy alias, incremental
        .route("/etl/run", post(run_incremental_handler))
        .with_state(executor)
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /health
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// GET /models/list
async fn list_models_handler(State(executor): State<AppState>) -> Result<Json<ModelsResponse>> {
    let models = executor.list_models().await?;
    Ok(Json(ModelsResponse {
        status: "success",
        models_count: models.len(),
        models: Some(models),
    }))
}

/// POST /models/update
async fn update_models_handler(State(executor): State<AppState>) -> Result<Json<ModelsResponse>> {
    let count = executor.update_models().await?;
    Ok(Json(ModelsResponse {
        status: "success",
        models_count: count,
        models: None,
    }))
}

/// POST /run/inc and POST /etl/run
async fn run_incremental_handler(
    State(executor): State<AppState>,
    Query(params): Query<RunParams>,
) -> Result<Json<RunResponse>> {
    run(&executor, RunMode::Incremental, params).await
}

/// POST /run/full
async fn run_full_handler(
    State(executor): State<AppState>,
    Query(params): Query<RunParams>,
) -> Result<Json<RunResponse>> {
    run(&executor, RunMode::Full, params).await
}

async fn run(
    executor: &HarvesterExecutor,
    mode: RunMode,
    params: RunParams,
) -> Result<Json<RunResponse>> {
    let response = match executor.run(mode, params.into_options()).await? {
        RunOutcome::NothingToRun => RunResponse::Nothing {
            status: "success",
            message: "No entity to process",
            results: Vec::new(),
        },
        RunOutcome::Completed(summary) => RunResponse::Summary(summary),
    };
    Ok(Json(response))
}
