use async_trait::async_trait;
use futures::StreamExt;
use log::{ error, info, warn };
use redis::aio::MultiplexedConnection;
use redis::{ AsyncCommands, Client };
use serde::{ Deserialize, Serialize };
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{ Broadcaster, ConversationRegistry };
use crate::error::StoreError;
use crate::store::connect_redis;
use crate::models::websocket::ServerMessage;

const CHANNEL_PREFIX: &str = "conversation:";
const RELAY_RETRY_DELAY: Duration = Duration::from_secs(2);

pub fn channel_name(conversation_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, conversation_id)
}

/// Wire form of a published event. `origin` names the process that
/// published it; that process already delivered it to its own sessions.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    event: ServerMessage,
}

/// Delivers to this process's sessions first, then publishes on
/// `conversation:<id>` so every other process running [`spawn_relay`]
/// delivers to theirs. Local subscribers see events in the order they were
/// broadcast, whatever the pub/sub round trip does.
pub struct RedisBroadcaster {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    registry: Arc<ConversationRegistry>,
    node_id: Uuid,
}

impl RedisBroadcaster {
    pub fn new(url: &str, registry: Arc<ConversationRegistry>) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(url)?,
            conn: Mutex::new(None),
            registry,
            node_id: Uuid::new_v4(),
        })
    }

    /// Pass to [`spawn_relay`] so this process skips its own events.
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    async fn connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = connect_redis(&self.client).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn publish(&self, conversation_id: &str, payload: String) -> Result<(), redis::RedisError> {
        let mut conn = self.connection().await?;
        let result = conn.publish::<_, _, i64>(channel_name(conversation_id), payload).await;
        if result.is_err() {
            *self.conn.lock().await = None;
        }
        result.map(|_| ())
    }
}

#[async_trait]
impl Broadcaster for RedisBroadcaster {
    async fn broadcast(&self, conversation_id: &str, event: ServerMessage) {
        self.registry.deliver(conversation_id, &event);

        let envelope = Envelope { origin: self.node_id, event };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize event for {}: {}", conversation_id, e);
                return;
            }
        };
        if let Err(e) = self.publish(conversation_id, payload).await {
            warn!("Publish to {} failed ({}); other processes miss this event", conversation_id, e);
        }
    }
}

/// Event to deliver locally, or `None` when `node_id` published it.
fn decode_remote(payload: &str, node_id: Uuid) -> Result<Option<ServerMessage>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(payload)?;
    Ok((envelope.origin != node_id).then_some(envelope.event))
}

/// Pattern-subscribes to `conversation:*` and forwards every event into
/// `registry`. Reconnects until the task is aborted.
pub fn spawn_relay(
    url: String,
    registry: Arc<ConversationRegistry>,
    node_id: Uuid
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match relay_once(&url, &registry, node_id).await {
                Ok(()) => warn!("Pub/sub stream at {} ended, reconnecting", url),
                Err(e) => error!("Pub/sub relay error at {}: {}", url, e),
            }
            tokio::time::sleep(RELAY_RETRY_DELAY).await;
        }
    })
}

async fn relay_once(
    url: &str,
    registry: &ConversationRegistry,
    node_id: Uuid
) -> Result<(), redis::RedisError> {
    let client = Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{}*", CHANNEL_PREFIX)).await?;
    info!("Relaying conversation events from {}", url);

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let channel = msg.get_channel_name();
        let Some(conversation_id) = channel.strip_prefix(CHANNEL_PREFIX) else {
            continue;
        };
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("Unreadable payload on {}: {}", channel, e);
                continue;
            }
        };
        match decode_remote(&payload, node_id) {
            Ok(Some(event)) => {
                registry.deliver(conversation_id, &event);
            }
            Ok(None) => {}
            Err(e) => warn!("Dropping malformed event on {}: {}", channel, e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_per_conversation() {
        assert_eq!(channel_name("42"), "conversation:42");
    }

    fn event() -> ServerMessage {
        ServerMessage::error(crate::models::websocket::ErrorCode::ServerError)
    }

    #[test]
    fn relay_skips_own_events() {
        let me = Uuid::new_v4();
        let own = serde_json::to_string(&Envelope { origin: me, event: event() }).unwrap();
        let foreign = serde_json::to_string(&Envelope { origin: Uuid::new_v4(), event: event() }).unwrap();
        assert_eq!(decode_remote(&own, me).unwrap(), None);
        assert_eq!(decode_remote(&foreign, me).unwrap(), Some(event()));
        assert!(decode_remote(r#"{"type":"pong"}"#, me).is_err());
    }

    #[tokio::test]
    async fn local_sessions_get_events_in_order_without_redis() {
        let registry = Arc::new(ConversationRegistry::new());
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        registry.add("c1", crate::broadcast::SessionHandle::new(Uuid::new_v4(), "alice", tx));
        let broadcaster = RedisBroadcaster::new("redis://127.0.0.1:1/", Arc::clone(&registry)).unwrap();

        let pong = ServerMessage::Pong { ts: chrono::Utc::now() };
        broadcaster.broadcast("c1", event()).await;
        broadcaster.broadcast("c1", pong.clone()).await;
        assert_eq!(rx.try_recv().ok(), Some(event()));
        assert_eq!(rx.try_recv().ok(), Some(pong));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rejects_bad_url() {
        let registry = Arc::new(ConversationRegistry::new());
        assert!(RedisBroadcaster::new("not-a-url", registry).is_err());
    }
}
