//! Conversation routes for the human and agent namespaces.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::core::store::{Conversation, ConversationStore};
use crate::models::error::{ApiError, ApiResult};
use crate::models::request::QueueType;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversationRequest {
    #[serde(default)]
    pub queue_type: Option<QueueType>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversationResponse {
    pub conversation_id: String,
    pub queue_type: QueueType,
}

async fn start_conversation(
    store: &ConversationStore,
    request: Option<NewConversationRequest>,
) -> NewConversationResponse {
    let queue = request.and_then(|r| r.queue_type).unwrap_or_default();
    let conversation_id = store.force_new(queue).await;
    NewConversationResponse {
        conversation_id,
        queue_type: queue,
    }
}

/// `POST /v1/conversations/new`: start a fresh conversation and point
/// the queue's "last conversation" slot at it.
pub async fn new_conversation(
    State(state): State<AppState>,
    body: Option<Json<NewConversationRequest>>,
) -> Json<NewConversationResponse> {
    Json(start_conversation(&state.conversations, body.map(|Json(b)| b)).await)
}

/// `GET /v1/conversations/:id`
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    state
        .conversations
        .load(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("conversation not found: {id}")))
}

/// `POST /v1/agent-conversations/new`: same contract, agent namespace.
pub async fn new_agent_conversation(
    State(state): State<AppState>,
    body: Option<Json<NewConversationRequest>>,
) -> Json<NewConversationResponse> {
    Json(start_conversation(&state.agent_conversations, body.map(|Json(b)| b)).await)
}

/// `GET /v1/agent-conversations/:id`
pub async fn get_agent_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    state
        .agent_conversations
        .load(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("conversation not found: {id}")))
}
