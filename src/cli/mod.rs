use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the HTTP side API (health, pipeline retry). Disabled when unset.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// API key required in the X-API-Key header by the HTTP side API.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Shared secret used to verify client bearer tokens.
    #[arg(long, env = "AUTH_SECRET")]
    pub auth_secret: String,

    /// Optional path to the TLS certificate file (PEM format) for enabling WSS. Requires --tls-key.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS. Requires --tls-cert.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    // --- Store Args ---
    /// Message store type (memory, redis)
    #[arg(long, env = "STORE_TYPE", default_value = "memory")]
    pub store_type: String,

    /// Message store endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "STORE_URL", default_value = "redis://127.0.0.1:6379")]
    pub store_url: String,

    /// Prefix for Redis store keys.
    #[arg(long, env = "STORE_REDIS_PREFIX", default_value = "chat:")]
    pub store_redis_prefix: String,

    /// Conversations created at startup, as comma separated `conversation_id:owner_id` pairs.
    #[arg(long, env = "SEED_CONVERSATIONS", value_delimiter = ',')]
    pub seed_conversations: Vec<String>,

    // --- Rate Limit Args ---
    /// Backend for the per-user generator quota (memory, redis)
    #[arg(long, env = "RATE_LIMIT_BACKEND", default_value = "memory")]
    pub rate_limit_backend: String,

    #[arg(long, env = "RATE_LIMIT_REDIS_URL")]
    pub rate_limit_redis_url: Option<String>,

    /// Messages a single connection may send per window.
    #[arg(long, env = "SEND_RATE_COUNT", default_value = "6")]
    pub send_rate_count: usize,

    #[arg(long, env = "SEND_RATE_PERIOD_SECS", default_value = "10")]
    pub send_rate_period_secs: u64,

    /// Generator calls allowed per user per window; the fallback reply is used beyond it.
    #[arg(long, env = "LLM_RATE_LIMIT", default_value = "50")]
    pub llm_rate_limit: u32,

    #[arg(long, env = "LLM_RATE_PERIOD_SECS", default_value = "3600")]
    pub llm_rate_period_secs: u64,

    // --- Session Args ---
    #[arg(long, env = "MAX_MESSAGE_CHARS", default_value = "4000")]
    pub max_message_chars: usize,

    /// Messages sent to a client when it subscribes.
    #[arg(long, env = "BACKLOG_LIMIT", default_value = "50")]
    pub backlog_limit: usize,

    /// Outbound queue depth per connection.
    #[arg(long, env = "SEND_QUEUE", default_value = "256")]
    pub send_queue: usize,

    // --- Pipeline Args ---
    /// Prior turns handed to the classifier and generator.
    #[arg(long, env = "HISTORY_LIMIT", default_value = "8")]
    pub history_limit: usize,

    /// Reply generator (fallback, ollama, openai, brain)
    #[arg(long, env = "REPLY_GENERATOR", default_value = "fallback")]
    pub reply_generator: String,

    /// Base URL for the generator API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the generator provider (e.g., OpenAI)
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Model name for replies (e.g., gpt-4o-mini, llama3)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on adapter defaults if None
    pub chat_model: Option<String>,

    /// Upper bound for any single classifier, generator or notifier call.
    #[arg(long, env = "CAPABILITY_TIMEOUT_MS", default_value = "6000")]
    pub capability_timeout_ms: u64,

    /// inline runs the pipeline on the connection task, background on a worker pool.
    #[arg(long, env = "DISPATCH_MODE", default_value = "inline")]
    pub dispatch_mode: String,

    #[arg(long, env = "PIPELINE_WORKERS", default_value = "4")]
    pub pipeline_workers: usize,

    #[arg(long, env = "PIPELINE_QUEUE", default_value = "256")]
    pub pipeline_queue: usize,

    /// Path to a JSON file overriding the built-in safety rules.
    #[arg(long, env = "SAFETY_RULES_PATH")]
    pub safety_rules_path: Option<String>,

    // --- Escalation Args ---
    /// Where high-severity escalations go (log, webhook)
    #[arg(long, env = "NOTIFIER", default_value = "log")]
    pub notifier: String,

    #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
    pub notify_webhook_url: Option<String>,

    /// Comma separated escalation recipients.
    #[arg(long, env = "NOTIFY_RECIPIENTS", value_delimiter = ',')]
    pub notify_recipients: Vec<String>,

    // --- Fan-out Args ---
    /// Redis URL for cross-process fan-out. Local delivery only when unset.
    #[arg(long, env = "PUBSUB_REDIS_URL")]
    pub pubsub_redis_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["safechat-relay", "--auth-secret", "s"]).unwrap();
        assert_eq!(args.server_addr, "127.0.0.1:4000");
        assert_eq!(args.send_rate_count, 6);
        assert_eq!(args.llm_rate_limit, 50);
        assert_eq!(args.history_limit, 8);
        assert_eq!(args.dispatch_mode, "inline");
        assert!(args.seed_conversations.is_empty());
    }

    #[test]
    fn list_arguments_split_on_commas() {
        let args = Args::try_parse_from([
            "safechat-relay",
            "--auth-secret",
            "s",
            "--seed-conversations",
            "c1:alice,c2:bob",
            "--notify-recipients",
            "ops@example.com",
        ]).unwrap();
        assert_eq!(args.seed_conversations, vec!["c1:alice", "c2:bob"]);
        assert_eq!(args.notify_recipients, vec!["ops@example.com"]);
    }
}
