//! Execution outcomes as delivered to HTTP callers and webhook targets.

use chrono::{DateTime, Utc};
use code_agent_runner::{RunFailure, RunOutput};
use serde::{Deserialize, Serialize};

/// Outcome of one execute or iterate operation. This exact shape is also
/// the webhook payload for async requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub command: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// Exit code of the agent CLI; -1 when it never exited on its own.
    pub exit_code: i32,
    /// Wall-clock milliseconds.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl ExecutionResult {
    pub fn from_output(
        request_id: &str,
        repository: Option<&str>,
        branch: Option<&str>,
        command: Vec<String>,
        output: &RunOutput,
    ) -> Self {
        Self {
            success: true,
            request_id: request_id.to_string(),
            repository: repository.map(str::to_string),
            branch: branch.map(str::to_string),
            command,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            exit_code: output.exit_code,
            duration_ms: output.duration.as_millis() as u64,
            timestamp: Utc::now(),
            iterations: None,
            max_iterations: None,
        }
    }

    /// Streams stay exactly as captured; the failure kind goes to the
    /// server log, not the wire.
    pub fn from_failure(
        request_id: &str,
        repository: Option<&str>,
        branch: Option<&str>,
        command: Vec<String>,
        failure: &RunFailure,
    ) -> Self {
        Self {
            success: false,
            request_id: request_id.to_string(),
            repository: repository.map(str::to_string),
            branch: branch.map(str::to_string),
            command,
            stdout: failure.stdout.clone(),
            stderr: failure.stderr.clone(),
            exit_code: failure.exit_code.unwrap_or(-1),
            duration_ms: failure.duration.as_millis() as u64,
            timestamp: Utc::now(),
            iterations: None,
            max_iterations: None,
        }
    }

    /// Failure shell for errors that happened before or instead of a CLI
    /// run (unknown repository, store trouble surfaced late, panics in a
    /// background task).
    pub fn from_error(request_id: &str, repository: Option<&str>, message: &str) -> Self {
        Self {
            success: false,
            request_id: request_id.to_string(),
            repository: repository.map(str::to_string),
            branch: None,
            command: Vec::new(),
            stdout: String::new(),
            stderr: message.to_string(),
            exit_code: -1,
            duration_ms: 0,
            timestamp: Utc::now(),
            iterations: None,
            max_iterations: None,
        }
    }

    pub fn with_iterations(mut self, attempted: u32, cap: u32) -> Self {
        self.iterations = Some(attempted);
        self.max_iterations = Some(cap);
        self
    }

    /// Combined output used for marker scans (done markers, context-window
    /// errors).
    pub fn combined_output(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }

    pub fn has_output(&self) -> bool {
        !self.stdout.is_empty() || !self.stderr.is_empty()
    }
}

/// Immediate response for accepted async requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub accepted: bool,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AcceptedResponse {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            request_id: request_id.into(),
            timestamp: Utc::now(),
        }
    }
}
