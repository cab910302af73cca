mod memory;
mod redis;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use crate::error::StoreError;
use crate::models::chat::{ Conversation, Message, MessageId, MessageUpdate, NewMessage };

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub(crate) use self::redis::connect as connect_redis;

/// Persistence boundary for conversations and messages.
///
/// Within one conversation `list_recent_messages` returns messages in
/// creation order, and `created_at` never goes backwards. At most one
/// message may carry a given `in_reply_to`; a second attempt fails with
/// [`StoreError::ReplyExists`].
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_conversation(
        &self,
        conversation: Conversation
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    /// Default policy: only the owning identity may access a conversation.
    async fn get_conversation_access(
        &self,
        user_id: &str,
        conversation_id: &str
    ) -> Result<bool, StoreError> {
        Ok(
            self
                .get_conversation(conversation_id).await?
                .map(|c| c.owner_id == user_id)
                .unwrap_or(false)
        )
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message, StoreError>;

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Partial update; fields not present in `update` are kept.
    async fn update_message_fields(
        &self,
        id: MessageId,
        update: MessageUpdate
    ) -> Result<Message, StoreError>;

    /// Most recent `limit` messages, oldest first.
    async fn list_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize
    ) -> Result<Vec<Message>, StoreError>;

    /// The bot/system message produced for `source`, if any.
    async fn find_reply(&self, source: MessageId) -> Result<Option<Message>, StoreError>;
}

pub fn create_store(
    store_type: &str,
    url: &str,
    key_prefix: &str
) -> Result<Arc<dyn MessageStore>, StoreError> {
    match store_type.to_lowercase().as_str() {
        "memory" => {
            info!("Messages will be kept in process memory");
            Ok(Arc::new(MemoryStore::new()))
        }
        "redis" => {
            info!("Messages will be stored in Redis at {}", url);
            Ok(Arc::new(RedisStore::new(url, key_prefix)?))
        }
        other => Err(StoreError::Backend(format!("Unsupported store type: {}", other))),
    }
}

/// Parses `conversation_id:owner_id` seed entries.
pub fn parse_seed(entry: &str) -> Option<Conversation> {
    let (conversation_id, owner_id) = entry.split_once(':')?;
    let (conversation_id, owner_id) = (conversation_id.trim(), owner_id.trim());
    if conversation_id.is_empty() || owner_id.is_empty() {
        return None;
    }
    Some(Conversation::new(conversation_id, owner_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_entries() {
        let conv = parse_seed("c1:alice").unwrap();
        assert_eq!(conv.id, "c1");
        assert_eq!(conv.owner_id, "alice");
        assert!(parse_seed("c1").is_none());
        assert!(parse_seed(":alice").is_none());
    }

    #[test]
    fn unknown_store_type() {
        assert!(create_store("sqlite", "", "").is_err());
    }
}
