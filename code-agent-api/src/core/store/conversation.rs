//! Per-queue conversation history with TTLs and overflow summarization.
//!
//! Persistence is best-effort: every operation degrades to stateless
//! behavior when the backend is unreachable, and an availability flag
//! (toggled on I/O errors, restored on success) keeps the hot path from
//! hammering a dead store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::store::kv::KvBackend;
use crate::models::request::QueueType;

/// Prefix of the synthetic system message produced by summarization.
pub const SUMMARY_MARKER: &str = "[Conversation Summary] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            source: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub queue_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_messages: Option<Vec<Message>>,
}

impl Conversation {
    fn new(id: &str, queue: QueueType) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            queue_type: queue.as_str().to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            summarized_messages: None,
        }
    }

    /// The history to feed into prompts: the compacted form when a
    /// summarization has run, the raw messages otherwise.
    pub fn effective_messages(&self) -> &[Message] {
        self.summarized_messages
            .as_deref()
            .unwrap_or(&self.messages)
    }
}

/// Key prefixes separating the human and agent conversation namespaces.
#[derive(Debug, Clone, Copy)]
pub struct KeySpace {
    pub conversation: &'static str,
    pub last: &'static str,
}

impl KeySpace {
    pub const HUMAN: KeySpace = KeySpace {
        conversation: "conv:",
        last: "lastConv:",
    };

    pub const AGENT: KeySpace = KeySpace {
        conversation: "agentConv:",
        last: "agentLastConv:",
    };

    fn conversation_key(&self, id: &str) -> String {
        format!("{}{}", self.conversation, id)
    }

    fn last_key(&self, queue: QueueType) -> String {
        format!("{}{}", self.last, queue.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StoreTuning {
    pub conversation_ttl: Duration,
    pub last_pointer_ttl: Duration,
    /// Verbatim recent messages kept alongside the summary.
    pub recent_tail: usize,
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            conversation_ttl: Duration::from_secs(86_400),
            last_pointer_ttl: Duration::from_secs(86_400),
            recent_tail: 3,
        }
    }
}

/// What `summarize_if_needed` accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeOutcome {
    /// History replaced by summary + recent tail; a retry is worthwhile.
    Summarized,
    /// Nothing stored under that id.
    NoConversation,
    /// Summarization or storage failed; caller should proceed stateless.
    Stateless,
}

/// Conversation persistence over a [`KvBackend`].
pub struct ConversationStore {
    kv: Arc<dyn KvBackend>,
    keys: KeySpace,
    tuning: StoreTuning,
    available: AtomicBool,
    // Serializes read-modify-write cycles per conversation so concurrent
    // appends interleave by arrival order instead of losing updates.
    update_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConversationStore {
    pub fn new(kv: Arc<dyn KvBackend>, keys: KeySpace, tuning: StoreTuning) -> Self {
        Self {
            kv,
            keys,
            tuning,
            available: AtomicBool::new(true),
            update_locks: DashMap::new(),
        }
    }

    fn update_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.update_locks
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Background probe that flips the store back to available after an
    /// outage. Sleeps while the store is healthy; while it is down, each
    /// round pings a few times with short doubling pauses, then waits for
    /// the next round. A dead store costs a handful of fail-fast pings
    /// per interval and nothing more.
    pub fn spawn_probe(self: &Arc<Self>, interval: Duration) {
        const PINGS_PER_ROUND: u32 = 3;
        const FIRST_PAUSE: Duration = Duration::from_millis(500);

        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if store.available() {
                    continue;
                }

                let mut pause = FIRST_PAUSE;
                for ping in 1..=PINGS_PER_ROUND {
                    match store.kv.ping().await {
                        Ok(()) => {
                            store.note_success();
                            break;
                        },
                        Err(error) => {
                            debug!(ping, %error, "store still unreachable");
                            if ping < PINGS_PER_ROUND {
                                tokio::time::sleep(pause).await;
                                pause *= 2;
                            }
                        },
                    }
                }
            }
        });
    }

    fn note_success(&self) {
        if !self.available.swap(true, Ordering::AcqRel) {
            info!("conversation store available again");
        }
    }

    fn note_failure(&self, error: &dyn std::fmt::Display) {
        if self.available.swap(false, Ordering::AcqRel) {
            warn!(%error, "conversation store unavailable, continuing stateless");
        }
    }

    async fn kv_get(&self, key: &str) -> Option<String> {
        match self.kv.get(key).await {
            Ok(value) => {
                self.note_success();
                value
            },
            Err(error) => {
                self.note_failure(&error);
                None
            },
        }
    }

    async fn kv_set(&self, key: &str, value: String, ttl: Duration) -> bool {
        match self.kv.set(key, value, ttl).await {
            Ok(()) => {
                self.note_success();
                true
            },
            Err(error) => {
                self.note_failure(&error);
                false
            },
        }
    }

    /// Resolve the conversation to continue: the explicit id when it still
    /// exists, else the queue's last conversation, else a fresh one whose
    /// id becomes the queue's last pointer. With the store down this
    /// always hands out a fresh id and persists nothing.
    pub async fn get_or_create(&self, queue: QueueType, explicit: Option<&str>) -> String {
        if !self.available() {
            return Uuid::new_v4().to_string();
        }

        if let Some(id) = explicit {
            if self
                .kv_get(&self.keys.conversation_key(id))
                .await
                .is_some()
            {
                return id.to_string();
            }
            if !self.available() {
                return Uuid::new_v4().to_string();
            }
        }

        if let Some(id) = self.kv_get(&self.keys.last_key(queue)).await {
            // Touch the pointer so an active queue keeps its slot alive.
            self.kv_set(
                &self.keys.last_key(queue),
                id.clone(),
                self.tuning.last_pointer_ttl,
            )
            .await;
            return id;
        }

        self.force_new(queue).await
    }

    /// Start a fresh conversation and make it the queue's last one.
    pub async fn force_new(&self, queue: QueueType) -> String {
        let id = Uuid::new_v4().to_string();
        if self.available() {
            self.kv_set(
                &self.keys.last_key(queue),
                id.clone(),
                self.tuning.last_pointer_ttl,
            )
            .await;
        }
        debug!(conversation_id = %id, queue = %queue, "new conversation");
        id
    }

    /// Append one message, creating the conversation on first write.
    /// Refreshes both the conversation TTL and the queue's last pointer.
    pub async fn append(&self, conversation_id: &str, queue: QueueType, message: Message) {
        if !self.available() {
            return;
        }

        let lock = self.update_lock(conversation_id);
        let _guard = lock.lock().await;

        let mut conversation = self
            .load(conversation_id)
            .await
            .unwrap_or_else(|| Conversation::new(conversation_id, queue));

        // Exactly one of the two arrays is written per update: the compact
        // array once a summarization has run, the raw log before that.
        match conversation.summarized_messages.as_mut() {
            Some(compact) => compact.push(message),
            None => conversation.messages.push(message),
        }
        conversation.updated_at = Utc::now();

        if self.write(&conversation).await {
            self.kv_set(
                &self.keys.last_key(queue),
                conversation_id.to_string(),
                self.tuning.last_pointer_ttl,
            )
            .await;
        }
    }

    pub async fn load(&self, conversation_id: &str) -> Option<Conversation> {
        if !self.available() {
            return None;
        }
        let raw = self
            .kv_get(&self.keys.conversation_key(conversation_id))
            .await?;
        match serde_json::from_str(&raw) {
            Ok(conversation) => Some(conversation),
            Err(error) => {
                warn!(conversation_id, %error, "discarding undecodable conversation record");
                None
            },
        }
    }

    /// Compact the conversation after a context-window overflow: one
    /// system summary produced by `summarizer`, then the last
    /// `recent_tail` messages verbatim. The original messages stay
    /// untouched when anything fails.
    pub async fn summarize_if_needed<F>(
        &self,
        conversation_id: &str,
        summarizer: F,
    ) -> SummarizeOutcome
    where
        F: FnOnce(&[Message]) -> anyhow::Result<String>,
    {
        if !self.available() {
            return SummarizeOutcome::Stateless;
        }

        let lock = self.update_lock(conversation_id);
        let _guard = lock.lock().await;

        let Some(mut conversation) = self.load(conversation_id).await else {
            return SummarizeOutcome::NoConversation;
        };

        let source = conversation.effective_messages();
        let summary = match summarizer(source) {
            Ok(summary) => summary,
            Err(error) => {
                self.note_failure(&error);
                return SummarizeOutcome::Stateless;
            },
        };

        let tail_start = source.len().saturating_sub(self.tuning.recent_tail);
        let mut compact = Vec::with_capacity(self.tuning.recent_tail + 1);
        compact.push(Message::system(format!("{SUMMARY_MARKER}{summary}")));
        compact.extend_from_slice(&source[tail_start..]);

        conversation.summarized_messages = Some(compact);
        conversation.updated_at = Utc::now();

        if self.write(&conversation).await {
            info!(
                conversation_id,
                kept = self.tuning.recent_tail,
                "conversation summarized after context-window overflow"
            );
            SummarizeOutcome::Summarized
        } else {
            SummarizeOutcome::Stateless
        }
    }

    async fn write(&self, conversation: &Conversation) -> bool {
        let raw = match serde_json::to_string(conversation) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(%error, "failed to encode conversation");
                return false;
            },
        };
        self.kv_set(
            &self.keys.conversation_key(&conversation.id),
            raw,
            self.tuning.conversation_ttl,
        )
        .await
    }
}
