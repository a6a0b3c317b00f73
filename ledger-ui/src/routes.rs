//! HTTP route handlers for the ledger API.
//!
//! SQLite calls block, so every handler runs its query on the blocking pool.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch};
use harness::core::test_tree::TestTreeNode;
use harness::io::ledger::{
    Ledger, LedgerEntry, OverrideError, RunStats, ScoreOverride, SqliteLedger,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/override", patch(override_run))
        .route("/runs/{id}/overrides", get(list_overrides))
        .route("/tests", get(list_tests))
        .route("/tree", get(get_tree))
        .route("/latest", get(latest_entries))
        .route("/stats", get(get_stats))
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<OverrideError>() {
            Some(OverrideError::RunNotFound(_)) => ApiError::NotFound(err.to_string()),
            Some(_) => ApiError::BadRequest(err.to_string()),
            None => {
                let message = format!("{err:#}");
                warn!(err = %message, "ledger query failed");
                ApiError::Internal(message)
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run `query` against the ledger on the blocking pool.
async fn blocking<T, F>(state: AppState, query: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&SqliteLedger) -> Result<T, ApiError> + Send + 'static,
{
    let ledger = state.ledger;
    tokio::task::spawn_blocking(move || query(&ledger))
        .await
        .map_err(|err| ApiError::Internal(format!("ledger task failed: {err}")))?
        .map(Json)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFilter {
    test_id: Option<String>,
}

/// GET /api/runs?testId= - newest first.
async fn list_runs(
    State(state): State<AppState>,
    Query(filter): Query<TestFilter>,
) -> ApiResult<Vec<LedgerEntry>> {
    blocking(state, move |ledger| {
        Ok(ledger.get_runs(filter.test_id.as_deref())?)
    })
    .await
}

/// GET /api/runs/{id}
async fn get_run(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<LedgerEntry> {
    blocking(state, move |ledger| {
        ledger
            .get_run_by_id(id)?
            .ok_or_else(|| ApiError::NotFound(format!("run {id} not found")))
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    score: f64,
    reason: String,
}

/// PATCH /api/runs/{id}/override - append a human score override.
async fn override_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<ScoreOverride> {
    blocking(state, move |ledger| {
        Ok(ledger.override_run_score(id, request.score, &request.reason)?)
    })
    .await
}

/// GET /api/runs/{id}/overrides - newest first.
async fn list_overrides(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<ScoreOverride>> {
    blocking(state, move |ledger| {
        if ledger.get_run_by_id(id)?.is_none() {
            return Err(ApiError::NotFound(format!("run {id} not found")));
        }
        Ok(ledger.get_run_overrides(id)?)
    })
    .await
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestsResponse {
    test_ids: Vec<String>,
}

/// GET /api/tests - distinct test ids.
async fn list_tests(State(state): State<AppState>) -> ApiResult<TestsResponse> {
    blocking(state, |ledger| {
        Ok(TestsResponse {
            test_ids: ledger.get_test_ids()?,
        })
    })
    .await
}

/// GET /api/tree - suite tree of every recorded test.
async fn get_tree(State(state): State<AppState>) -> ApiResult<Vec<TestTreeNode>> {
    blocking(state, |ledger| Ok(ledger.get_test_tree()?)).await
}

/// GET /api/latest - newest entry per (test, runner).
async fn latest_entries(State(state): State<AppState>) -> ApiResult<Vec<LedgerEntry>> {
    blocking(state, |ledger| Ok(ledger.get_latest_entries()?)).await
}

/// GET /api/stats?testId=
async fn get_stats(
    State(state): State<AppState>,
    Query(filter): Query<TestFilter>,
) -> ApiResult<RunStats> {
    blocking(state, move |ledger| {
        Ok(ledger.get_stats(filter.test_id.as_deref())?)
    })
    .await
}
