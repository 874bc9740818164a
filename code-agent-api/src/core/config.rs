use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub cli: CliConfig,
    pub repositories: RepositoriesConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub iteration: IterationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CliConfig {
    /// Path to the agent CLI binary. Required.
    pub path: String,
    pub main_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub safety_slack_ms: u64,
    pub kill_grace_ms: u64,
    pub max_output_bytes: u64,
    pub max_concurrent: usize,
    pub use_pty: bool,
    /// Prepended to every prompt when set.
    #[serde(default)]
    pub system_instructions: Option<String>,
    /// Comma-separated substrings signalling the agent finished its task.
    pub done_markers: String,
    /// Comma-separated substrings signalling a context-window overflow.
    pub context_window_markers: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RepositoriesConfig {
    /// Directory holding one checkout per repository name. Required.
    pub root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    /// External KV store URL. The in-memory backend serves when unset.
    #[serde(default)]
    pub url: Option<String>,
    pub conversation_ttl_secs: u64,
    pub last_conversation_ttl_secs: u64,
    /// Verbatim messages kept after a summarization.
    pub recent_tail: usize,
    /// Prior messages included when building a prompt.
    pub history_window: usize,
    /// How often an unavailable store is probed for recovery.
    pub probe_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            conversation_ttl_secs: 86_400,
            last_conversation_ttl_secs: 86_400,
            recent_tail: 3,
            history_window: 10,
            probe_interval_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CallbackConfig {
    /// Base URL for synthesized async callbacks.
    #[serde(default)]
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    /// Substring matched against callback URLs; matches are dropped.
    #[serde(default)]
    pub suppress_pattern: Option<String>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 10_000,
            suppress_pattern: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IterationConfig {
    pub default_max: u32,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self { default_max: 5 }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("cli.main_timeout_ms", 300_000)?
            .set_default("cli.idle_timeout_ms", 60_000)?
            .set_default("cli.safety_slack_ms", 5_000)?
            .set_default("cli.kill_grace_ms", 2_000)?
            .set_default("cli.max_output_bytes", 10_485_760)?
            .set_default("cli.max_concurrent", 3)?
            .set_default("cli.use_pty", true)?
            .set_default("cli.done_markers", "[DONE]")?
            .set_default(
                "cli.context_window_markers",
                "context length exceeded,context window exceeded,prompt is too long",
            )?
            .set_default("store.conversation_ttl_secs", 86_400)?
            .set_default("store.last_conversation_ttl_secs", 86_400)?
            .set_default("store.recent_tail", 3)?
            .set_default("store.history_window", 10)?
            .set_default("store.probe_interval_secs", 30)?
            .set_default("callback.timeout_ms", 10_000)?
            .set_default("iteration.default_max", 5)?
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("CODE_AGENT").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn main_timeout(&self) -> Duration {
        Duration::from_millis(self.cli.main_timeout_ms)
    }

    pub fn done_markers(&self) -> Vec<String> {
        split_markers(&self.cli.done_markers)
    }

    pub fn context_window_markers(&self) -> Vec<String> {
        split_markers(&self.cli.context_window_markers)
    }

    /// True when `output` contains any of the configured context-window
    /// marker substrings.
    pub fn matches_context_window_marker(&self, output: &str) -> bool {
        self.context_window_markers()
            .iter()
            .any(|marker| output.contains(marker.as_str()))
    }

    pub fn matches_done_marker(&self, output: &str) -> bool {
        self.done_markers()
            .iter()
            .any(|marker| output.contains(marker.as_str()))
    }
}

fn split_markers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub(crate) fn test_settings(cli_path: &str, repositories_root: &str) -> Settings {
    Settings {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        cli: CliConfig {
            path: cli_path.into(),
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
            root: repositories_root.into(),
        },
        store: StoreConfig::default(),
        callback: CallbackConfig::default(),
        iteration: IterationConfig::default(),
    }
}
