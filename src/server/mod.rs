pub mod api;
pub mod session;
pub mod websocket;

use std::error::Error;
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::broadcast::ConversationRegistry;
use crate::cli::Args;
use crate::pipeline::Pipeline;
use crate::store::MessageStore;
use self::session::SessionSettings;

/// Everything a connection needs, shared across all sessions.
pub struct ChatContext {
    pub auth: Authenticator,
    pub store: Arc<dyn MessageStore>,
    pub registry: Arc<ConversationRegistry>,
    pub pipeline: Arc<Pipeline>,
    pub settings: SessionSettings,
}

pub struct Server {
    addr: String,
    ctx: Arc<ChatContext>,
    args: Args,
}

impl Server {
    pub fn new(addr: String, ctx: Arc<ChatContext>, args: Args) -> Self {
        Self { addr, ctx, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.args.http_port {
            self.start_http_server(http_port).await?;
        }

        self.start_ws_server().await?;

        Ok(())
    }

    async fn start_http_server(&self, http_port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(http_port, self.ctx.clone(), self.args.clone()).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(&self.addr, self.ctx.clone(), self.args.clone()).await
    }
}
