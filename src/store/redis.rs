use async_trait::async_trait;
use chrono::Duration;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{ AsyncCommands, Client, RedisResult, Script };
use uuid::Uuid;

use super::MessageStore;
use crate::error::StoreError;
use crate::models::chat::{ Conversation, Message, MessageId, MessageUpdate, NewMessage };

/// Redis layout, all keys under `key_prefix`:
/// `conv:<id>` conversation JSON, `msg:<id>` message JSON,
/// `timeline:<conv>` list of message ids, `reply:<source>` reply id.
pub struct RedisStore {
    client: Client,
    key_prefix: String,
    append: Script,
}

/// Upper bound on connecting to Redis.
pub const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);
/// Upper bound on waiting for the reply to a single Redis command.
pub const RESPONSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Multiplexed connection that gives up after [`CONNECT_TIMEOUT`] and whose
/// commands fail after [`RESPONSE_TIMEOUT`] instead of waiting on a dead peer.
pub async fn connect(client: &Client) -> RedisResult<MultiplexedConnection> {
    client.get_multiplexed_async_connection_with_timeouts(RESPONSE_TIMEOUT, CONNECT_TIMEOUT).await
}

// KEYS: message, timeline, optional reply claim. ARGV: message JSON, message
// id, message key prefix. The claim, the message and its timeline entry are
// written together or not at all. A claim whose message is missing is taken
// over.
const APPEND_SCRIPT: &str =
    r"
if KEYS[3] then
    local claimed = redis.call('GET', KEYS[3])
    if claimed and redis.call('EXISTS', ARGV[3] .. claimed) == 1 then
        return 0
    end
    redis.call('SET', KEYS[3], ARGV[2])
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('RPUSH', KEYS[2], ARGV[2])
return 1
";

impl RedisStore {
    pub fn new(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(url)?,
            key_prefix: key_prefix.to_string(),
            append: Script::new(APPEND_SCRIPT),
        })
    }

    async fn get_connection(&self) -> RedisResult<MultiplexedConnection> {
        connect(&self.client).await
    }

    fn conversation_key(&self, id: &str) -> String {
        format!("{}conv:{}", self.key_prefix, id)
    }

    fn message_key(&self, id: &MessageId) -> String {
        format!("{}msg:{}", self.key_prefix, id)
    }

    fn timeline_key(&self, conversation_id: &str) -> String {
        format!("{}timeline:{}", self.key_prefix, conversation_id)
    }

    fn reply_key(&self, source: &MessageId) -> String {
        format!("{}reply:{}", self.key_prefix, source)
    }
}

#[async_trait]
impl MessageStore for RedisStore {
    async fn create_conversation(
        &self,
        conversation: Conversation
    ) -> Result<Conversation, StoreError> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(&conversation)?;
        conn.set::<_, _, ()>(self.conversation_key(&conversation.id), json).await?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(self.conversation_key(id)).await?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let mut conn = self.get_connection().await?;
        let exists: bool = conn.exists(self.conversation_key(&new.conversation_id)).await?;
        if !exists {
            return Err(StoreError::ConversationNotFound(new.conversation_id));
        }

        let timeline_key = self.timeline_key(&new.conversation_id);
        let last_id: Option<String> = conn.lindex(&timeline_key, -1).await?;
        let mut created_at = Utc::now();
        if let Some(last_id) = last_id.and_then(|s| Uuid::parse_str(&s).ok()) {
            let raw: Option<String> = conn.get(self.message_key(&last_id)).await?;
            if let Some(prev) = raw.and_then(|r| serde_json::from_str::<Message>(&r).ok()) {
                if prev.created_at >= created_at {
                    created_at = prev.created_at + Duration::microseconds(1);
                }
            }
        }

        let id = Uuid::new_v4();
        let message = Message {
            id,
            conversation_id: new.conversation_id,
            sender: new.sender,
            text: new.text,
            classification: None,
            flagged: false,
            in_reply_to: new.in_reply_to,
            created_at,
        };
        let json = serde_json::to_string(&message)?;

        let mut invocation = self.append.key(self.message_key(&id));
        invocation.key(&timeline_key);
        if let Some(source) = &message.in_reply_to {
            invocation.key(self.reply_key(source));
        }
        let written: i64 = invocation
            .arg(json)
            .arg(id.to_string())
            .arg(format!("{}msg:", self.key_prefix))
            .invoke_async(&mut conn).await?;
        match (written, message.in_reply_to) {
            (0, Some(source)) => Err(StoreError::ReplyExists(source)),
            _ => Ok(message),
        }
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(self.message_key(&id)).await?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    async fn update_message_fields(
        &self,
        id: MessageId,
        update: MessageUpdate
    ) -> Result<Message, StoreError> {
        let mut message = self.get_message(id).await?.ok_or(StoreError::MessageNotFound(id))?;
        update.apply(&mut message);
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(&message)?;
        conn.set::<_, _, ()>(self.message_key(&id), json).await?;
        Ok(message)
    }

    async fn list_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize
    ) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.lrange(
            self.timeline_key(conversation_id),
            -(limit as isize),
            -1
        ).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}msg:{}", self.key_prefix, id))
            .collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        let mut messages = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            match serde_json::from_str::<Message>(&raw) {
                Ok(m) => messages.push(m),
                Err(e) => log::error!("Error parsing stored message: {}", e),
            }
        }
        Ok(messages)
    }

    async fn find_reply(&self, source: MessageId) -> Result<Option<Message>, StoreError> {
        let mut conn = self.get_connection().await?;
        let reply_id: Option<String> = conn.get(self.reply_key(&source)).await?;
        match reply_id.and_then(|s| Uuid::parse_str(&s).ok()) {
            Some(id) => self.get_message(id).await,
            None => Ok(None),
        }
    }
}
