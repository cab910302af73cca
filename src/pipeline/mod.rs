pub mod dispatch;
pub mod locks;
pub mod orchestrator;

use log::{ debug, warn };
use std::sync::Arc;

use crate::broadcast::Broadcaster;
use crate::error::StoreError;
use crate::models::chat::{ Message, MessageId, NewMessage };
use crate::models::websocket::ServerMessage;
use crate::store::MessageStore;

pub use self::dispatch::{ DispatchMode, Dispatcher, PipelineTicket };
pub use self::locks::KeyedLocks;
pub use self::orchestrator::{ Orchestrator, PipelineOutcome, PipelineSettings };

/// Entry point for inbound user messages.
///
/// Accepting a message persists it, broadcasts it and submits it for
/// processing while holding the conversation's gate, so messages and their
/// replies are produced in acceptance order.
pub struct Pipeline {
    store: Arc<dyn MessageStore>,
    broadcaster: Arc<dyn Broadcaster>,
    dispatcher: Dispatcher,
    conversation_gate: KeyedLocks,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn MessageStore>,
        broadcaster: Arc<dyn Broadcaster>,
        dispatcher: Dispatcher
    ) -> Self {
        Self {
            store,
            broadcaster,
            dispatcher,
            conversation_gate: KeyedLocks::new(),
        }
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    /// `on_accepted` runs after the message is stored and broadcast but
    /// before processing starts.
    pub async fn accept<F>(
        &self,
        conversation_id: &str,
        text: &str,
        on_accepted: F
    ) -> Result<(Message, PipelineTicket), StoreError>
        where F: FnOnce(&Message) + Send
    {
        let _gate = self.conversation_gate.acquire(conversation_id).await;

        let message = self.store.create_message(NewMessage::user(conversation_id, text)).await?;
        debug!("Accepted message {} in {}", message.id, conversation_id);
        self.broadcaster.broadcast(conversation_id, ServerMessage::Message {
            message: message.clone(),
        }).await;
        on_accepted(&message);

        let ticket = self.dispatcher.submit(conversation_id, message.id).await;
        Ok((message, ticket))
    }

    /// Re-runs processing for a stored message and waits for the outcome.
    pub async fn retry(&self, message_id: MessageId) -> PipelineOutcome {
        let message = match self.store.get_message(message_id).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                return PipelineOutcome::Missing { message_id };
            }
            Err(e) => {
                warn!("Retry lookup for {} failed: {}", message_id, e);
                return PipelineOutcome::error(message_id, e);
            }
        };
        let ticket = {
            let _gate = self.conversation_gate.acquire(&message.conversation_id).await;
            self.dispatcher.submit(&message.conversation_id, message_id).await
        };
        ticket.outcome().await
    }
}
