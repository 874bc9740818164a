//! The execution coordinator: prompt assembly, CLI invocation, history
//! persistence and sync/async result delivery.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info, warn};

use code_agent_runner::{CliRunner, CommandSpec};

use crate::core::callback::CallbackDispatcher;
use crate::core::config::Settings;
use crate::core::iteration::IterationLoop;
use crate::core::store::{ConversationStore, Message, Role, SummarizeOutcome};
use crate::models::error::ApiError;
use crate::models::request::{ExecuteRequest, QueueType, generate_request_id};
use crate::models::result::{AcceptedResponse, ExecutionResult};

/// How a background (async-accepted) request should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// One CLI invocation.
    Single,
    /// Up to `maxIterations` invocations through the iteration loop.
    Iterate,
}

/// A validated request with queue and conversation already resolved.
/// The iteration loop reuses one of these across steps so every step
/// lands in the same conversation.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub request_id: String,
    pub queue: QueueType,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub prompt: String,
    pub conversation_id: String,
}

pub struct ExecutionCoordinator {
    settings: Arc<Settings>,
    runner: Arc<CliRunner>,
    store: Arc<ConversationStore>,
    dispatcher: Arc<CallbackDispatcher>,
}

impl ExecutionCoordinator {
    pub fn new(
        settings: Arc<Settings>,
        runner: Arc<CliRunner>,
        store: Arc<ConversationStore>,
        dispatcher: Arc<CallbackDispatcher>,
    ) -> Self {
        Self {
            settings,
            runner,
            store,
            dispatcher,
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Synchronous single-shot execution. CLI failures come back as
    /// [`ApiError::CliFailure`] carrying the captured output.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, ApiError> {
        let prepared = self.prepare(&request).await?;
        self.run_step(&prepared).await
    }

    /// Accept an async request: validate, settle the callback URL, then
    /// hand the actual work to a detached task. Returns 200-shaped
    /// acceptance if and only if a usable callback URL exists.
    pub fn accept_async(
        self: &Arc<Self>,
        request: ExecuteRequest,
        mode: ExecMode,
    ) -> Result<AcceptedResponse, ApiError> {
        validate(&request)?;

        let queue = request.resolve_queue_type();
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| generate_request_id(queue));

        let callback_url = request
            .callback
            .clone()
            .or_else(|| self.dispatcher.synthesize_url(&request_id))
            .ok_or_else(|| ApiError::Validation("callback required".into()))?;

        let mut request = request;
        request.request_id = Some(request_id.clone());

        let coordinator = Arc::clone(self);
        let task_request_id = request_id.clone();
        tokio::spawn(async move {
            // A panic in the background work must be logged, never allowed
            // to take the process down or vanish silently.
            let work = std::panic::AssertUnwindSafe(
                coordinator.run_background(request, callback_url, mode),
            )
            .catch_unwind();
            if work.await.is_err() {
                error!(
                    request_id = %task_request_id,
                    "background execution task panicked"
                );
            }
        });

        info!(request_id = %request_id, "async request accepted");
        Ok(AcceptedResponse::new(request_id))
    }

    async fn run_background(
        self: Arc<Self>,
        request: ExecuteRequest,
        callback_url: String,
        mode: ExecMode,
    ) {
        let request_id = request.request_id.clone().unwrap_or_default();
        let repository = request.repository.clone();

        let outcome = match mode {
            ExecMode::Single => self.execute(request).await,
            ExecMode::Iterate => IterationLoop::new(Arc::clone(&self)).iterate(request).await,
        };

        let payload = match outcome {
            Ok(result) => result,
            Err(ApiError::CliFailure(result)) => *result,
            Err(error) => {
                warn!(request_id = %request_id, %error, "async execution failed before the CLI ran");
                ExecutionResult::from_error(&request_id, repository.as_deref(), &error.to_string())
            },
        };

        self.dispatcher.dispatch(callback_url, payload);
    }

    /// Validate and resolve a request into a [`PreparedRequest`].
    pub async fn prepare(&self, request: &ExecuteRequest) -> Result<PreparedRequest, ApiError> {
        validate(request)?;

        let queue = request.resolve_queue_type();
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| generate_request_id(queue));
        let conversation_id = self
            .store
            .get_or_create(queue, request.conversation_id.as_deref())
            .await;

        Ok(PreparedRequest {
            request_id,
            queue,
            repository: request.repository.clone(),
            branch: request.branch.clone(),
            prompt: request.prompt.clone(),
            conversation_id,
        })
    }

    /// One coordinated CLI invocation: build the prompt from stored
    /// history, run the CLI, persist the exchange, and recover once from
    /// a context-window overflow by summarizing and retrying.
    pub async fn run_step(
        &self,
        prepared: &PreparedRequest,
    ) -> Result<ExecutionResult, ApiError> {
        let working_dir = self.resolve_working_dir(prepared.repository.as_deref())?;

        let mut append_user = true;
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let history = self.store.load(&prepared.conversation_id).await;
            let prior = history
                .as_ref()
                .map(|conversation| conversation.effective_messages())
                .unwrap_or_default();
            let prompt_text =
                self.format_prompt(prior, &prepared.prompt, prepared.repository.as_deref());

            let spec = self.command_spec(&prompt_text, working_dir.clone());
            let command = spec.command_line();
            let run = self.runner.run(&prepared.request_id, spec).await;

            if append_user {
                self.store
                    .append(
                        &prepared.conversation_id,
                        prepared.queue,
                        Message::user(prepared.prompt.clone()),
                    )
                    .await;
            }

            let result = match &run {
                Ok(output) => {
                    let reply = if output.stdout.is_empty() {
                        output.stderr.clone()
                    } else {
                        output.stdout.clone()
                    };
                    if !reply.is_empty() {
                        self.store
                            .append(
                                &prepared.conversation_id,
                                prepared.queue,
                                Message::assistant(reply),
                            )
                            .await;
                    }
                    ExecutionResult::from_output(
                        &prepared.request_id,
                        prepared.repository.as_deref(),
                        prepared.branch.as_deref(),
                        command,
                        output,
                    )
                },
                Err(failure) => {
                    warn!(
                        request_id = %prepared.request_id,
                        kind = %failure.kind,
                        "agent CLI invocation failed"
                    );
                    // Partial output still goes into the history so a
                    // later step (or a human) can pick up from it.
                    let partial = if failure.stdout.is_empty() {
                        failure.stderr.clone()
                    } else {
                        failure.stdout.clone()
                    };
                    if !partial.is_empty() {
                        self.store
                            .append(
                                &prepared.conversation_id,
                                prepared.queue,
                                Message::assistant(partial),
                            )
                            .await;
                    }
                    ExecutionResult::from_failure(
                        &prepared.request_id,
                        prepared.repository.as_deref(),
                        prepared.branch.as_deref(),
                        command,
                        failure,
                    )
                },
            };

            // Context-window overflow: summarize and retry, at most once
            // per invocation.
            if attempt == 1
                && self
                    .settings
                    .matches_context_window_marker(&result.combined_output())
            {
                info!(
                    request_id = %prepared.request_id,
                    conversation_id = %prepared.conversation_id,
                    "context-window marker detected, attempting summarization"
                );
                let outcome = self
                    .store
                    .summarize_if_needed(&prepared.conversation_id, summarize_history)
                    .await;
                if outcome == SummarizeOutcome::Summarized {
                    append_user = false;
                    continue;
                }
                // Summarization failed: report the original outcome.
            }

            return if result.success {
                Ok(result)
            } else {
                Err(ApiError::CliFailure(Box::new(result)))
            };
        }
    }

    /// Prior context, system instructions and the current prompt in the
    /// line-oriented form the agent CLI consumes. The repository
    /// working-directory declaration is included whenever a repository is
    /// set.
    fn format_prompt(&self, prior: &[Message], prompt: &str, repository: Option<&str>) -> String {
        let mut text = String::new();

        if let Some(instructions) = &self.settings.cli.system_instructions {
            text.push_str(&format!("System: {instructions}\n"));
        }
        if let Some(repo) = repository {
            text.push_str(&format!(
                "System: The current working directory is a trusted checkout of the \
                 \"{repo}\" repository. Operate on it directly.\n"
            ));
        }

        let window = self.settings.store.history_window;
        let start = prior.len().saturating_sub(window);
        for message in &prior[start..] {
            text.push_str(&format!("{}: {}\n", role_label(message.role), message.content));
        }

        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(prompt);
        text
    }

    fn command_spec(&self, prompt_text: &str, working_dir: Option<PathBuf>) -> CommandSpec {
        let mut spec = CommandSpec::new(self.settings.cli.path.as_str(), [prompt_text])
            .env("NO_COLOR", "1");
        if let Some(dir) = working_dir {
            spec = spec.working_dir(dir);
        }
        spec
    }

    fn resolve_working_dir(&self, repository: Option<&str>) -> Result<Option<PathBuf>, ApiError> {
        let Some(repo) = repository else {
            return Ok(None);
        };
        validate_repository_name(repo)?;
        let dir = Path::new(&self.settings.repositories.root).join(repo);
        if !dir.is_dir() {
            return Err(ApiError::NotFound(format!("unknown repository: {repo}")));
        }
        Ok(Some(dir))
    }
}

fn validate(request: &ExecuteRequest) -> Result<(), ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::Validation("prompt must not be empty".into()));
    }
    if request.max_iterations == Some(0) {
        return Err(ApiError::Validation("maxIterations must be at least 1".into()));
    }
    Ok(())
}

/// Repository names address directories under the repositories root; keep
/// them inside it.
fn validate_repository_name(repository: &str) -> Result<(), ApiError> {
    let path = Path::new(repository);
    let escapes = repository.is_empty()
        || path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir));
    if escapes {
        return Err(ApiError::Validation(format!(
            "invalid repository name: {repository}"
        )));
    }
    Ok(())
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    }
}

/// Compress a message log into a single paragraph: role-tagged snippets
/// of every message, clipped to keep the result prompt-sized.
pub(crate) fn summarize_history(messages: &[Message]) -> anyhow::Result<String> {
    const SNIPPET_CHARS: usize = 160;
    const MAX_CHARS: usize = 4_000;

    let mut parts = Vec::with_capacity(messages.len());
    for message in messages {
        let flat = message
            .content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let mut snippet: String = flat.chars().take(SNIPPET_CHARS).collect();
        if flat.chars().count() > SNIPPET_CHARS {
            snippet.push('…');
        }
        parts.push(format!("{}: {}", role_label(message.role), snippet));
    }

    let summary = parts.join(" | ");
    if summary.chars().count() > MAX_CHARS {
        Ok(summary.chars().take(MAX_CHARS).collect())
    } else {
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::callback::CallbackDispatcher;
    use crate::core::config::test_settings;
    use crate::core::store::{KeySpace, MemoryKv, StoreTuning};
    use code_agent_runner::RunnerConfig;
    use std::time::Duration;

    fn coordinator_with(settings: Settings) -> ExecutionCoordinator {
        let settings = Arc::new(settings);
        let runner = Arc::new(CliRunner::new(RunnerConfig {
            max_concurrent: settings.cli.max_concurrent,
            main_timeout: Duration::from_millis(settings.cli.main_timeout_ms),
            idle_timeout: Duration::from_millis(settings.cli.idle_timeout_ms),
            safety_slack: Duration::from_millis(settings.cli.safety_slack_ms),
            kill_grace: Duration::from_millis(settings.cli.kill_grace_ms),
            max_output_bytes: settings.cli.max_output_bytes,
            prefer_pty: settings.cli.use_pty,
        }));
        let store = Arc::new(ConversationStore::new(
            Arc::new(MemoryKv::new()),
            KeySpace::HUMAN,
            StoreTuning::default(),
        ));
        let dispatcher =
            Arc::new(CallbackDispatcher::new(settings.callback.clone()).unwrap());
        ExecutionCoordinator::new(settings, runner, store, dispatcher)
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let request = ExecuteRequest {
            prompt: "   ".into(),
            ..Default::default()
        };
        assert!(matches!(validate(&request), Err(ApiError::Validation(_))));
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let request = ExecuteRequest {
            prompt: "go".into(),
            max_iterations: Some(0),
            ..Default::default()
        };
        assert!(matches!(validate(&request), Err(ApiError::Validation(_))));
    }

    #[test]
    fn repository_names_cannot_escape_the_root() {
        assert!(validate_repository_name("project").is_ok());
        assert!(validate_repository_name("team/project").is_ok());
        assert!(validate_repository_name("../outside").is_err());
        assert!(validate_repository_name("/etc").is_err());
        assert!(validate_repository_name("a/../../b").is_err());
        assert!(validate_repository_name("").is_err());
    }

    #[test]
    fn prompt_includes_repository_declaration_and_history() {
        let coordinator = coordinator_with(test_settings("/bin/true", "/tmp"));
        let prior = vec![
            Message::user("first question"),
            Message::assistant("first answer"),
        ];
        let prompt = coordinator.format_prompt(&prior, "second question", Some("demo"));

        assert!(prompt.contains("\"demo\" repository"));
        assert!(prompt.contains("User: first question"));
        assert!(prompt.contains("Assistant: first answer"));
        assert!(prompt.ends_with("second question"));

        let repo_pos = prompt.find("demo").unwrap();
        let history_pos = prompt.find("first question").unwrap();
        assert!(repo_pos < history_pos);
    }

    #[test]
    fn prompt_without_context_is_just_the_prompt() {
        let coordinator = coordinator_with(test_settings("/bin/true", "/tmp"));
        assert_eq!(coordinator.format_prompt(&[], "hello", None), "hello");
    }

    #[test]
    fn prompt_history_is_clipped_to_the_window() {
        let mut settings = test_settings("/bin/true", "/tmp");
        settings.store.history_window = 2;
        let coordinator = coordinator_with(settings);
        let prior: Vec<Message> = (0..5).map(|n| Message::user(format!("m{n}"))).collect();
        let prompt = coordinator.format_prompt(&prior, "now", None);
        assert!(!prompt.contains("m2"));
        assert!(prompt.contains("m3"));
        assert!(prompt.contains("m4"));
    }

    #[test]
    fn summary_compresses_to_one_clipped_paragraph() {
        let messages = vec![
            Message::user("a".repeat(500)),
            Message::assistant("short"),
        ];
        let summary = summarize_history(&messages).unwrap();
        assert!(summary.contains("User:"));
        assert!(summary.contains("Assistant: short"));
        assert!(summary.chars().count() < 500);
    }

    #[tokio::test]
    async fn unknown_repository_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let coordinator =
            coordinator_with(test_settings("/bin/true", root.path().to_str().unwrap()));
        let request = ExecuteRequest {
            prompt: "hello".into(),
            repository: Some("missing".into()),
            ..Default::default()
        };
        let error = coordinator.execute(request).await.unwrap_err();
        assert!(matches!(error, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn async_acceptance_requires_a_callback() {
        let coordinator = Arc::new(coordinator_with(test_settings("/bin/true", "/tmp")));
        let request = ExecuteRequest {
            prompt: "hello".into(),
            ..Default::default()
        };
        let error = coordinator
            .accept_async(request, ExecMode::Single)
            .unwrap_err();
        assert!(matches!(error, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn async_acceptance_with_explicit_callback_echoes_request_id() {
        let coordinator = Arc::new(coordinator_with(test_settings("/bin/true", "/tmp")));
        let request = ExecuteRequest {
            request_id: Some("api-1712-0001".into()),
            prompt: "hello".into(),
            callback: Some("http://127.0.0.1:1/cb".into()),
            ..Default::default()
        };
        let accepted = coordinator.accept_async(request, ExecMode::Single).unwrap();
        assert!(accepted.accepted);
        assert_eq!(accepted.request_id, "api-1712-0001");
    }
}
