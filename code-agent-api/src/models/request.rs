//! Incoming execution requests and queue-type resolution.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag selecting an independent "last conversation" slot.
///
/// Request ids carry the tag as their prefix (`telegram-…`, `api-…`);
/// anything unrecognized lands in the default queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    #[default]
    Default,
    Telegram,
    Api,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Default => "default",
            QueueType::Telegram => "telegram",
            QueueType::Api => "api",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "telegram" => Some(QueueType::Telegram),
            "api" => Some(QueueType::Api),
            "default" => Some(QueueType::Default),
            _ => None,
        }
    }

    /// Resolve the queue from a request id: split once on `-`, match the
    /// left side against the known tags, fall back to `default`.
    pub fn from_request_id(request_id: &str) -> Self {
        request_id
            .split_once('-')
            .and_then(|(tag, _)| Self::from_tag(tag))
            .unwrap_or_default()
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of the execute/iterate operations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Stable caller-supplied id; generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Working tree under the repositories root.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    pub prompt: String,
    /// Webhook for async completion; synthesized from config when absent.
    #[serde(default)]
    pub callback: Option<String>,
    /// Continue an existing conversation instead of the queue's last one.
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub queue_type: Option<QueueType>,
    /// Iteration cap for the iterate operations; ignored by single-shot
    /// execute.
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl ExecuteRequest {
    /// Explicit queue type, or the one encoded in the request id.
    pub fn resolve_queue_type(&self) -> QueueType {
        self.queue_type.unwrap_or_else(|| {
            self.request_id
                .as_deref()
                .map(QueueType::from_request_id)
                .unwrap_or_default()
        })
    }
}

/// Generate a request id: `<queue>-<unix_millis>-<4 random digits>`.
pub fn generate_request_id(queue: QueueType) -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("{}-{}-{:04}", queue.as_str(), millis, suffix)
}
