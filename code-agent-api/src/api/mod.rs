pub mod conversations;
pub mod execute;
pub mod queue;

use std::sync::Arc;

use code_agent_runner::CliRunner;

use crate::core::coordinator::ExecutionCoordinator;
use crate::core::iteration::IterationLoop;
use crate::core::store::ConversationStore;

/// Shared handler state, built once at startup and injected by reference.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ExecutionCoordinator>,
    pub iteration: Arc<IterationLoop>,
    pub runner: Arc<CliRunner>,
    pub conversations: Arc<ConversationStore>,
    pub agent_conversations: Arc<ConversationStore>,
}
