//! Admission-queue visibility.

use axum::{Json, extract::State};
use code_agent_runner::QueueStatus;

use crate::api::AppState;

/// `GET /v1/queue/status`: non-blocking snapshot of the CLI runner's
/// admission semaphore.
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.runner.queue_status())
}
