use chrono::Utc;
use log::{ debug, error, info, warn };
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{ mpsc, Notify };
use tokio::time::Instant;
use uuid::Uuid;

use super::ChatContext;
use crate::auth::Identity;
use crate::broadcast::{ SessionHandle, SessionId };
use crate::error::StoreError;
use crate::models::chat::Message;
use crate::models::websocket::{ ClientMessage, CloseReason, ErrorCode, ServerMessage };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Subscribed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_message_chars: usize,
    pub backlog_limit: usize,
    pub send_rate_count: usize,
    pub send_rate_period: Duration,
    pub send_queue: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_message_chars: 4000,
            backlog_limit: 50,
            send_rate_count: 6,
            send_rate_period: Duration::from_secs(10),
            send_queue: 256,
        }
    }
}

/// Rolling window of accepted sends for one connection.
#[derive(Debug)]
pub struct SendWindow {
    limit: usize,
    period: Duration,
    accepted: VecDeque<Instant>,
}

impl SendWindow {
    pub fn new(limit: usize, period: Duration) -> Self {
        Self { limit, period, accepted: VecDeque::with_capacity(limit) }
    }

    /// Records a send at `now` unless `limit` sends already happened within
    /// the trailing `period`.
    pub fn try_record(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.accepted.front() {
            if now.duration_since(*oldest) >= self.period {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
        if self.accepted.len() >= self.limit {
            return false;
        }
        self.accepted.push_back(now);
        true
    }
}

/// One client connection bound to one conversation.
pub struct Session {
    id: SessionId,
    user_id: String,
    conversation_id: String,
    state: SessionState,
    window: SendWindow,
    outbound: mpsc::Sender<ServerMessage>,
    eviction: Arc<Notify>,
    ctx: Arc<ChatContext>,
}

impl Session {
    /// Authorizes the caller, subscribes to the conversation and queues the
    /// backlog. On refusal nothing is registered and the close reason is
    /// returned.
    pub async fn open(
        ctx: Arc<ChatContext>,
        identity: Identity,
        conversation_id: Option<String>,
        outbound: mpsc::Sender<ServerMessage>
    ) -> Result<Self, CloseReason> {
        let conversation_id = conversation_id.ok_or(CloseReason::MissingConversation)?;
        let user_id = identity.user_id().ok_or(CloseReason::Anonymous)?.to_string();

        match ctx.store.get_conversation(&conversation_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(CloseReason::ConversationNotFound);
            }
            Err(e) => {
                error!("Conversation lookup for {} failed: {}", conversation_id, e);
                return Err(CloseReason::Internal);
            }
        }
        match ctx.store.get_conversation_access(&user_id, &conversation_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("User {} may not access conversation {}", user_id, conversation_id);
                return Err(CloseReason::Forbidden);
            }
            Err(e) => {
                error!("Access check for {} failed: {}", conversation_id, e);
                return Err(CloseReason::Internal);
            }
        }

        let settings = &ctx.settings;
        let id = Uuid::new_v4();
        let handle = SessionHandle::new(id, user_id.clone(), outbound.clone());
        let mut session = Self {
            id,
            window: SendWindow::new(settings.send_rate_count, settings.send_rate_period),
            user_id,
            conversation_id,
            state: SessionState::Authenticated,
            outbound,
            eviction: handle.eviction(),
            ctx: Arc::clone(&ctx),
        };

        ctx.registry.add(&session.conversation_id, handle);
        session.state = SessionState::Subscribed;
        info!(
            "Session {} for {} subscribed to {}",
            session.id,
            session.user_id,
            session.conversation_id
        );

        match ctx.store.list_recent_messages(&session.conversation_id, settings.backlog_limit).await {
            Ok(messages) => session.emit(ServerMessage::InitialMessages { messages }).await,
            Err(e) => {
                error!("Backlog for {} failed: {}", session.conversation_id, e);
                session.emit(ServerMessage::error(ErrorCode::ServerError)).await;
            }
        }
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Handles one inbound text frame.
    pub async fn receive(&mut self, raw: &str) {
        if self.state != SessionState::Subscribed {
            debug!("Session {} ignoring frame in state {:?}", self.id, self.state);
            return;
        }
        match ClientMessage::parse(raw) {
            Ok(ClientMessage::Ping) => {
                self.emit(ServerMessage::Pong { ts: Utc::now() }).await;
            }
            Ok(ClientMessage::SendMessage { text }) => {
                if let Err(code) = self.send_message(&text).await {
                    self.emit(ServerMessage::error(code)).await;
                }
            }
            Err(code) => {
                debug!("Session {} sent an unknown action", self.id);
                self.emit(ServerMessage::error(code)).await;
            }
        }
    }

    async fn send_message(&mut self, text: &JsonValue) -> Result<Message, ErrorCode> {
        let text = validate_text(text, self.ctx.settings.max_message_chars)?;
        if !self.window.try_record(Instant::now()) {
            info!("Session {} exceeded the send rate", self.id);
            return Err(ErrorCode::RateLimited);
        }

        let ack = self.outbound.clone();
        let accepted = self.ctx.pipeline.accept(&self.conversation_id, &text, move |message| {
            let sent = ServerMessage::MessageSent { message: message.clone() };
            if ack.try_send(sent).is_err() {
                warn!("Could not queue acknowledgement for {}", message.id);
            }
        }).await;

        match accepted {
            Ok((message, _ticket)) => Ok(message),
            Err(StoreError::ConversationNotFound(id)) => {
                warn!("Conversation {} vanished under session {}", id, self.id);
                Err(ErrorCode::PermissionDenied)
            }
            Err(e) => {
                error!("Failed to accept message in {}: {}", self.conversation_id, e);
                Err(ErrorCode::ServerError)
            }
        }
    }

    async fn emit(&self, event: ServerMessage) {
        if self.outbound.send(event).await.is_err() {
            debug!("Session {} outbound closed", self.id);
        }
    }

    /// Fires if the registry evicts this session for a full outbound queue.
    pub fn eviction(&self) -> Arc<Notify> {
        Arc::clone(&self.eviction)
    }

    /// Marks a session the registry already dropped as closed.
    pub fn evicted(&mut self) {
        if self.state != SessionState::Closed {
            warn!("Session {} evicted from {}", self.id, self.conversation_id);
            self.state = SessionState::Closed;
        }
    }

    /// Unsubscribes; safe to call more than once.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if !self.ctx.registry.remove(&self.conversation_id, self.id) {
            warn!("Session {} was not registered in {}", self.id, self.conversation_id);
        }
        self.state = SessionState::Closed;
        info!("Session {} closed", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Trimmed text, or the error code the client should see.
pub fn validate_text(text: &JsonValue, max_chars: usize) -> Result<String, ErrorCode> {
    let text = text.as_str().map(str::trim).unwrap_or("");
    if text.is_empty() {
        return Err(ErrorCode::EmptyMessage);
    }
    if text.chars().count() > max_chars {
        return Err(ErrorCode::MessageTooLong);
    }
    Ok(text.to_string())
}
