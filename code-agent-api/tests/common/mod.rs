//! Shared fixtures for the end-to-end tests: a stub agent CLI written to
//! a tempdir, a fully wired coordinator, and a tiny callback receiver.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{Json, Router, http::HeaderMap, http::StatusCode, routing::post};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;

use code_agent_api::core::callback::CallbackDispatcher;
use code_agent_api::core::config::{
    CallbackConfig, CliConfig, IterationConfig, RepositoriesConfig, ServerConfig, Settings,
    StoreConfig,
};
use code_agent_api::core::coordinator::ExecutionCoordinator;
use code_agent_api::core::iteration::IterationLoop;
use code_agent_api::core::store::{ConversationStore, KeySpace, MemoryKv, StoreTuning};
use code_agent_api::runner_config;
use code_agent_runner::CliRunner;

pub struct Harness {
    pub tmp: TempDir,
    pub settings: Settings,
    pub runner: Arc<CliRunner>,
    pub store: Arc<ConversationStore>,
    pub dispatcher: Arc<CallbackDispatcher>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub iteration: Arc<IterationLoop>,
}

impl Harness {
    /// Build a harness around a stub CLI script body (`/bin/sh` syntax,
    /// prompt arrives as `$1`). Returns the harness and the repositories
    /// root, which already contains a checkout named `repo`.
    pub fn with_stub_cli(script_body: &str) -> Harness {
        Self::with_stub_cli_tuned(script_body, |_| {})
    }

    /// Same as [`Harness::with_stub_cli`], with a settings hook applied
    /// before wiring.
    pub fn with_stub_cli_tuned(
        script_body: &str,
        tune: impl FnOnce(&mut Settings),
    ) -> Harness {
        let tmp = TempDir::new().unwrap();
        let cli_path = write_stub_cli(tmp.path(), "agent-cli", script_body);
        let repos_root = tmp.path().join("repos");
        fs::create_dir_all(repos_root.join("repo")).unwrap();
        let mut settings = base_settings(&cli_path, &repos_root);
        tune(&mut settings);
        Self::with_settings(tmp, settings)
    }

    pub fn with_settings(tmp: TempDir, settings: Settings) -> Harness {
        let settings_arc = Arc::new(settings.clone());
        let runner = Arc::new(CliRunner::new(runner_config(&settings_arc)));
        let store = Arc::new(ConversationStore::new(
            Arc::new(MemoryKv::new()),
            KeySpace::HUMAN,
            StoreTuning {
                conversation_ttl: std::time::Duration::from_secs(
                    settings.store.conversation_ttl_secs,
                ),
                last_pointer_ttl: std::time::Duration::from_secs(
                    settings.store.last_conversation_ttl_secs,
                ),
                recent_tail: settings.store.recent_tail,
            },
        ));
        let dispatcher = Arc::new(CallbackDispatcher::new(settings.callback.clone()).unwrap());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            settings_arc,
            runner.clone(),
            store.clone(),
            dispatcher.clone(),
        ));
        let iteration = Arc::new(IterationLoop::new(coordinator.clone()));
        Harness {
            tmp,
            settings,
            runner,
            store,
            dispatcher,
            coordinator,
            iteration,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.tmp.path().to_path_buf()
    }
}

pub fn base_settings(cli_path: &Path, repos_root: &Path) -> Settings {
    Settings {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        cli: CliConfig {
            path: cli_path.to_string_lossy().into_owned(),
            main_timeout_ms: 5_000,
            idle_timeout_ms: 5_000,
            safety_slack_ms: 1_000,
            kill_grace_ms: 500,
            max_output_bytes: 1024 * 1024,
            max_concurrent: 2,
            use_pty: false,
            system_instructions: None,
            done_markers: "[DONE]".into(),
            context_window_markers: "context length exceeded".into(),
        },
        repositories: RepositoriesConfig {
            root: repos_root.to_string_lossy().into_owned(),
        },
        store: StoreConfig::default(),
        callback: CallbackConfig {
            base_url: None,
            timeout_ms: 2_000,
            suppress_pattern: None,
        },
        iteration: IterationConfig::default(),
    }
}

/// Write an executable `/bin/sh` script the coordinator can spawn as the
/// agent CLI.
pub fn write_stub_cli(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// What a callback target observed.
#[derive(Debug)]
pub struct ReceivedCallback {
    pub secret: Option<String>,
    pub body: Value,
}

/// Spawn an HTTP server capturing webhook deliveries. Returns its base
/// URL (no path) and the receiving channel.
pub async fn spawn_callback_server() -> (String, mpsc::Receiver<ReceivedCallback>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel(8);

    let handler = move |headers: HeaderMap, Json(body): Json<Value>| {
        let tx = tx.clone();
        async move {
            let secret = headers
                .get("x-webhook-secret")
                .and_then(|value| value.to_str().ok())
                .map(String::from);
            let _ = tx.send(ReceivedCallback { secret, body }).await;
            StatusCode::OK
        }
    };

    let app = Router::new()
        .route("/cb", post(handler.clone()))
        .route("/cb/:id", post(handler));

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{addr}/cb"), rx)
}
