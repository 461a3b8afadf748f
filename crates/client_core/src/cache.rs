use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationKey, UserId},
    protocol::MessageContent,
};
use tracing::debug;

/// One entry in a conversation timeline. Never mutated after insertion.
///
/// The timestamp is informational only: independent transports may stamp
/// the same logical message differently, so it is not part of the
/// duplicate-detection key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub from: UserId,
    pub content: MessageContent,
    pub is_sent: bool,
    pub timestamp: DateTime<Utc>,
}

/// Per-conversation message log with transport-agnostic deduplication.
///
/// Every producer (middleware push, signaling audio frames, the HTTP poll
/// loop, history backfill, locally sent messages) inserts through the
/// same contract, so a message delivered redundantly over several channels
/// collapses to a single entry.
#[derive(Debug, Default)]
pub struct MessageCache {
    conversations: HashMap<ConversationKey, Vec<CachedMessage>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` to the conversation unless an entry with the same
    /// `(from, content)` pair already exists there. Returns whether the
    /// message was appended. The linear scan is fine at chat scale.
    pub fn insert(&mut self, key: ConversationKey, message: CachedMessage) -> bool {
        let log = self.conversations.entry(key).or_default();
        let duplicate = log
            .iter()
            .any(|cached| cached.from == message.from && cached.content == message.content);
        if duplicate {
            debug!(from = %message.from, "duplicate delivery absorbed");
            return false;
        }
        log.push(message);
        true
    }

    pub fn conversation(&self, key: &ConversationKey) -> &[CachedMessage] {
        self.conversations
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConversationKey> {
        self.conversations.keys()
    }

    pub fn clear(&mut self, key: &ConversationKey) {
        self.conversations.remove(key);
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
