//! Execute and iterate routes, sync and async.

use axum::{Json, extract::State};
use tracing::info;

use crate::api::AppState;
use crate::core::coordinator::ExecMode;
use crate::models::error::{ApiError, ApiResult};
use crate::models::request::ExecuteRequest;
use crate::models::result::{AcceptedResponse, ExecutionResult};

/// `POST /v1/execute`: run one prompt to completion and return the
/// result. CLI failures surface as 422 with the captured output.
///
/// The work runs on a detached task: a caller hanging up mid-run does
/// not cancel the CLI, and the exchange still lands in the conversation
/// store for later retrieval.
pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecutionResult>> {
    info!(
        repository = request.repository.as_deref().unwrap_or("-"),
        "sync execute request"
    );
    let coordinator = state.coordinator.clone();
    let result = tokio::spawn(async move { coordinator.execute(request).await })
        .await
        .map_err(|join_error| ApiError::Internal(join_error.to_string()))??;
    Ok(Json(result))
}

/// `POST /v1/execute/async`: accept, run in the background, deliver the
/// result to the callback.
pub async fn execute_async(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<AcceptedResponse>> {
    let accepted = state.coordinator.accept_async(request, ExecMode::Single)?;
    Ok(Json(accepted))
}

/// `POST /v1/iterate`: multi-step execution, waiting for the loop to
/// finish.
pub async fn iterate(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecutionResult>> {
    info!(
        repository = request.repository.as_deref().unwrap_or("-"),
        max_iterations = request.max_iterations,
        "sync iterate request"
    );
    let iteration = state.iteration.clone();
    let result = tokio::spawn(async move { iteration.iterate(request).await })
        .await
        .map_err(|join_error| ApiError::Internal(join_error.to_string()))??;
    Ok(Json(result))
}

/// `POST /v1/iterate/async`: accepted iteration, result via callback.
pub async fn iterate_async(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<AcceptedResponse>> {
    let accepted = state.coordinator.accept_async(request, ExecMode::Iterate)?;
    Ok(Json(accepted))
}
