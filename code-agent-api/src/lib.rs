//! Code-agent execution server.
//!
//! Accepts prompts tied to a repository checkout, runs them through an
//! external agent CLI under strict resource bounds, and returns or
//! streams results back to callers: synchronously over HTTP or
//! asynchronously via webhook callbacks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tracing::warn;

pub mod api;
pub mod core;
pub mod middleware;
pub mod models;

use code_agent_runner::{CliRunner, RunnerConfig};

use crate::api::AppState;
use crate::core::callback::CallbackDispatcher;
use crate::core::config::Settings;
use crate::core::coordinator::ExecutionCoordinator;
use crate::core::iteration::IterationLoop;
use crate::core::store::{ConversationStore, KeySpace, KvBackend, MemoryKv, StoreTuning};

/// Map the CLI section of the settings onto the runner's tunables.
pub fn runner_config(settings: &Settings) -> RunnerConfig {
    RunnerConfig {
        max_concurrent: settings.cli.max_concurrent,
        main_timeout: Duration::from_millis(settings.cli.main_timeout_ms),
        idle_timeout: Duration::from_millis(settings.cli.idle_timeout_ms),
        safety_slack: Duration::from_millis(settings.cli.safety_slack_ms),
        kill_grace: Duration::from_millis(settings.cli.kill_grace_ms),
        max_output_bytes: settings.cli.max_output_bytes,
        prefer_pty: settings.cli.use_pty,
    }
}

fn store_tuning(settings: &Settings) -> StoreTuning {
    StoreTuning {
        conversation_ttl: Duration::from_secs(settings.store.conversation_ttl_secs),
        last_pointer_ttl: Duration::from_secs(settings.store.last_conversation_ttl_secs),
        recent_tail: settings.store.recent_tail,
    }
}

/// Wire every component together and return the router.
pub async fn create_app(settings: Settings) -> Result<Router> {
    use crate::middleware::request_trace;
    use axum::middleware;

    let settings = Arc::new(settings);
    let cors = CorsLayer::permissive();

    let runner = Arc::new(CliRunner::new(runner_config(&settings)));

    if let Some(url) = settings.store.url.as_deref() {
        warn!(url, "external store configured but not compiled in; using the in-memory backend");
    }
    let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
    let tuning = store_tuning(&settings);
    let probe_interval = Duration::from_secs(settings.store.probe_interval_secs);

    let conversations = Arc::new(ConversationStore::new(
        kv.clone(),
        KeySpace::HUMAN,
        tuning.clone(),
    ));
    conversations.spawn_probe(probe_interval);

    let agent_conversations = Arc::new(ConversationStore::new(kv, KeySpace::AGENT, tuning));
    agent_conversations.spawn_probe(probe_interval);

    let dispatcher = Arc::new(CallbackDispatcher::new(settings.callback.clone())?);

    let coordinator = Arc::new(ExecutionCoordinator::new(
        settings.clone(),
        runner.clone(),
        conversations.clone(),
        dispatcher,
    ));
    let iteration = Arc::new(IterationLoop::new(coordinator.clone()));

    let state = AppState {
        coordinator,
        iteration,
        runner,
        conversations,
        agent_conversations,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/v1/execute", post(api::execute::execute))
        .route("/v1/execute/async", post(api::execute::execute_async))
        .route("/v1/iterate", post(api::execute::iterate))
        .route("/v1/iterate/async", post(api::execute::iterate_async))
        .route(
            "/v1/conversations/new",
            post(api::conversations::new_conversation),
        )
        .route(
            "/v1/conversations/:id",
            get(api::conversations::get_conversation),
        )
        .route(
            "/v1/agent-conversations/new",
            post(api::conversations::new_agent_conversation),
        )
        .route(
            "/v1/agent-conversations/:id",
            get(api::conversations::get_agent_conversation),
        )
        .route("/v1/queue/status", get(api::queue::queue_status))
        .with_state(state)
        .layer(middleware::from_fn(request_trace::trace_request))
        .layer(cors);

    Ok(app)
}

async fn health_check() -> &'static str {
    "OK"
}
