//! Conversation persistence: KV backends and the store built on them.

pub mod conversation;
pub mod kv;

pub use conversation::{
    Conversation, ConversationStore, KeySpace, Message, Role, StoreTuning, SummarizeOutcome,
    SUMMARY_MARKER,
};
pub use kv::{KvBackend, MemoryKv};
