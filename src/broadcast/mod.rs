pub mod pubsub;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{ debug, warn };
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{ mpsc, Notify };
use uuid::Uuid;

use crate::models::websocket::ServerMessage;

pub use self::pubsub::{ spawn_relay, RedisBroadcaster };

pub type SessionId = Uuid;

/// Outbound side of one live session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub user_id: String,
    tx: mpsc::Sender<ServerMessage>,
    evicted: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(id: SessionId, user_id: impl Into<String>, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { id, user_id: user_id.into(), tx, evicted: Arc::new(Notify::new()) }
    }

    /// Notified once the registry drops this session for falling behind.
    pub fn eviction(&self) -> Arc<Notify> {
        Arc::clone(&self.evicted)
    }
}

/// Live sessions grouped by conversation.
#[derive(Default)]
pub struct ConversationRegistry {
    conversations: DashMap<String, HashMap<SessionId, SessionHandle>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the session was already registered.
    pub fn add(&self, conversation_id: &str, handle: SessionHandle) -> bool {
        let mut sessions = self.conversations.entry(conversation_id.to_string()).or_default();
        sessions.insert(handle.id, handle).is_none()
    }

    /// Returns false if the session was not registered.
    pub fn remove(&self, conversation_id: &str, session_id: SessionId) -> bool {
        let removed = match self.conversations.get_mut(conversation_id) {
            Some(mut sessions) => sessions.remove(&session_id).is_some(),
            None => false,
        };
        self.conversations.remove_if(conversation_id, |_, sessions| sessions.is_empty());
        removed
    }

    pub fn subscribers(&self, conversation_id: &str) -> Vec<SessionId> {
        self.conversations
            .get(conversation_id)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Queues `event` on every session of the conversation and returns how
    /// many accepted it. The entry is held exclusively while delivering so
    /// concurrent broadcasts reach all subscribers in the same order.
    ///
    /// A session whose queue is full would silently miss this event, so it
    /// is unsubscribed and its eviction is signalled instead; the client
    /// reconnects and reloads the backlog.
    pub fn deliver(&self, conversation_id: &str, event: &ServerMessage) -> usize {
        let Some(mut sessions) = self.conversations.get_mut(conversation_id) else {
            return 0;
        };
        let mut delivered = 0;
        sessions.retain(|id, handle| {
            match handle.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Outbound queue full for session {} ({}), evicting from {}",
                        id,
                        handle.user_id,
                        conversation_id
                    );
                    handle.evicted.notify_one();
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Session {} is gone, pruning from {}", id, conversation_id);
                    false
                }
            }
        });
        delivered
    }

    pub fn session_count(&self) -> usize {
        self.conversations
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

/// Fan-out of conversation events to every live subscriber.
/// Delivery failures are logged and never surface to the caller.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, conversation_id: &str, event: ServerMessage);
}

/// Delivers straight into this process's registry.
pub struct LocalBroadcaster {
    registry: Arc<ConversationRegistry>,
}

impl LocalBroadcaster {
    pub fn new(registry: Arc<ConversationRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn broadcast(&self, conversation_id: &str, event: ServerMessage) {
        let delivered = self.registry.deliver(conversation_id, &event);
        debug!("Broadcast to {} session(s) in {}", delivered, conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::websocket::ErrorCode;

    fn handle(user: &str, cap: usize) -> (SessionHandle, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(cap);
        (SessionHandle::new(Uuid::new_v4(), user, tx), rx)
    }

    fn event() -> ServerMessage {
        ServerMessage::error(ErrorCode::ServerError)
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let registry = ConversationRegistry::new();
        let (h, _rx) = handle("alice", 4);
        let id = h.id;
        assert!(registry.add("c1", h.clone()));
        assert!(!registry.add("c1", h));
        assert_eq!(registry.session_count(), 1);
        assert!(registry.remove("c1", id));
        assert!(!registry.remove("c1", id));
        assert!(!registry.remove("nope", id));
        assert_eq!(registry.conversation_count(), 0);
    }

    #[test]
    fn deliver_reaches_every_subscriber_once() {
        let registry = ConversationRegistry::new();
        let (a, mut rx_a) = handle("alice", 4);
        let (b, mut rx_b) = handle("alice", 4);
        let (other, mut rx_other) = handle("bob", 4);
        registry.add("c1", a);
        registry.add("c1", b);
        registry.add("c2", other);

        assert_eq!(registry.deliver("c1", &event()), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_evicts_only_the_slow_session() {
        let registry = ConversationRegistry::new();
        let (slow, _rx_slow) = handle("alice", 1);
        let (fast, mut rx_fast) = handle("alice", 8);
        let slow_id = slow.id;
        let eviction = slow.eviction();
        registry.add("c1", slow);
        registry.add("c1", fast);

        registry.deliver("c1", &event());
        assert_eq!(registry.deliver("c1", &event()), 1);
        assert!(rx_fast.try_recv().is_ok());
        assert!(rx_fast.try_recv().is_ok());

        eviction.notified().await;
        assert_eq!(registry.session_count(), 1);
        assert!(!registry.subscribers("c1").contains(&slow_id));
    }

    #[test]
    fn closed_sessions_are_pruned() {
        let registry = ConversationRegistry::new();
        let (gone, rx) = handle("alice", 4);
        registry.add("c1", gone);
        drop(rx);
        assert_eq!(registry.deliver("c1", &event()), 0);
        assert!(registry.subscribers("c1").is_empty());
    }

    #[tokio::test]
    async fn local_broadcaster_delivers() {
        let registry = Arc::new(ConversationRegistry::new());
        let (h, mut rx) = handle("alice", 4);
        registry.add("c1", h);
        LocalBroadcaster::new(registry).broadcast("c1", event()).await;
        assert_eq!(rx.recv().await, Some(event()));
    }
}
