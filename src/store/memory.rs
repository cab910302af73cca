use async_trait::async_trait;
use chrono::{ DateTime, Duration, Utc };
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::MessageStore;
use crate::error::StoreError;
use crate::models::chat::{ Conversation, Message, MessageId, MessageUpdate, NewMessage };

#[derive(Default)]
struct State {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<MessageId, Message>,
    timelines: HashMap<String, Vec<MessageId>>,
    replies: HashMap<MessageId, MessageId>,
}

/// In-process store used for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self, conversation_id: &str) -> usize {
        self.state.read().await.timelines
            .get(conversation_id)
            .map(|t| t.len())
            .unwrap_or(0)
    }
}

fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match last {
        Some(prev) if prev >= now => prev + Duration::microseconds(1),
        _ => now,
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_conversation(
        &self,
        conversation: Conversation
    ) -> Result<Conversation, StoreError> {
        let mut state = self.state.write().await;
        state.timelines.entry(conversation.id.clone()).or_default();
        state.conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.state.read().await.conversations.get(id).cloned())
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&new.conversation_id) {
            return Err(StoreError::ConversationNotFound(new.conversation_id));
        }
        if let Some(source) = new.in_reply_to {
            if state.replies.contains_key(&source) {
                return Err(StoreError::ReplyExists(source));
            }
        }

        let last = state.timelines
            .get(&new.conversation_id)
            .and_then(|t| t.last())
            .and_then(|id| state.messages.get(id))
            .map(|m| m.created_at);
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender: new.sender,
            text: new.text,
            classification: None,
            flagged: false,
            in_reply_to: new.in_reply_to,
            created_at: next_timestamp(last),
        };

        if let Some(source) = message.in_reply_to {
            state.replies.insert(source, message.id);
        }
        state.timelines.entry(message.conversation_id.clone()).or_default().push(message.id);
        state.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.state.read().await.messages.get(&id).cloned())
    }

    async fn update_message_fields(
        &self,
        id: MessageId,
        update: MessageUpdate
    ) -> Result<Message, StoreError> {
        let mut state = self.state.write().await;
        let message = state.messages.get_mut(&id).ok_or(StoreError::MessageNotFound(id))?;
        update.apply(message);
        Ok(message.clone())
    }

    async fn list_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        let Some(timeline) = state.timelines.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let start = timeline.len().saturating_sub(limit);
        Ok(
            timeline[start..]
                .iter()
                .filter_map(|id| state.messages.get(id).cloned())
                .collect()
        )
    }

    async fn find_reply(&self, source: MessageId) -> Result<Option<Message>, StoreError> {
        let state = self.state.read().await;
        Ok(
            state.replies
                .get(&source)
                .and_then(|id| state.messages.get(id))
                .cloned()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ ClassificationResult, SafetyVerdict, SenderRole };

    async fn store_with_conversation() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_conversation(Conversation::new("c1", "alice")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_requires_live_conversation() {
        let store = MemoryStore::new();
        let err = store.create_message(NewMessage::user("nope", "hi")).await.unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn recent_messages_oldest_first_and_bounded() {
        let store = store_with_conversation().await;
        for i in 0..5 {
            store.create_message(NewMessage::user("c1", format!("m{}", i))).await.unwrap();
        }
        let recent = store.list_recent_messages("c1", 3).await.unwrap();
        let texts: Vec<_> = recent
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert!(recent.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[tokio::test]
    async fn single_reply_per_source() {
        let store = store_with_conversation().await;
        let user = store.create_message(NewMessage::user("c1", "hi")).await.unwrap();
        let reply = store
            .create_message(NewMessage::reply(&user, SenderRole::Bot, "hello")).await
            .unwrap();
        let err = store
            .create_message(NewMessage::reply(&user, SenderRole::Bot, "again")).await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReplyExists(id) if id == user.id));
        assert_eq!(store.find_reply(user.id).await.unwrap().unwrap().id, reply.id);
    }

    #[tokio::test]
    async fn partial_update_keeps_text() {
        let store = store_with_conversation().await;
        let user = store.create_message(NewMessage::user("c1", "hi")).await.unwrap();
        let updated = store
            .update_message_fields(
                user.id,
                MessageUpdate::annotate(ClassificationResult::neutral(), SafetyVerdict::clear())
            ).await
            .unwrap();
        assert_eq!(updated.text, "hi");
        assert!(updated.classification.is_some());
    }

    #[tokio::test]
    async fn access_is_owner_only() {
        let store = store_with_conversation().await;
        assert!(store.get_conversation_access("alice", "c1").await.unwrap());
        assert!(!store.get_conversation_access("bob", "c1").await.unwrap());
        assert!(!store.get_conversation_access("alice", "c2").await.unwrap());
    }
}
