pub mod auth;
pub mod broadcast;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod nlu;
pub mod notify;
pub mod pipeline;
pub mod ratelimit;
pub mod server;
pub mod store;

use auth::Authenticator;
use broadcast::{ spawn_relay, Broadcaster, ConversationRegistry, LocalBroadcaster, RedisBroadcaster };
use cli::Args;
use config::SafetyRules;
use llm::{ new_generator, LlmConfig, LlmType };
use log::{ info, warn };
use nlu::{ FallbackGenerator, LexiconClassifier };
use pipeline::{ DispatchMode, Dispatcher, Orchestrator, Pipeline, PipelineSettings };
use server::session::SessionSettings;
use server::{ ChatContext, Server };
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("HTTP Port: {}", args.http_port.map_or("disabled".to_string(), |p| p.to_string()));
    info!("Store Type: {}", args.store_type);
    if args.store_type.eq_ignore_ascii_case("redis") {
        info!("Store URL: {}", args.store_url);
    }
    info!("Reply Generator: {}", args.reply_generator);
    info!("Dispatch Mode: {}", args.dispatch_mode);
    info!("Send Rate: {} per {}s", args.send_rate_count, args.send_rate_period_secs);
    info!("Generator Quota: {} per {}s ({})", args.llm_rate_limit, args.llm_rate_period_secs, args.rate_limit_backend);
    info!("Capability Timeout: {}ms", args.capability_timeout_ms);
    info!("Safety Rules: {}", args.safety_rules_path.as_deref().unwrap_or("built-in"));
    info!("Notifier: {}", args.notifier);
    info!("Pub/Sub Fan-out: {}", args.pubsub_redis_url.as_deref().unwrap_or("local only"));
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let ctx = build_context(&args).await?;
    info!("Starting server on: {}", args.server_addr);
    let server = Server::new(args.server_addr.clone(), ctx, args.clone());
    server.run().await?;

    Ok(())
}

/// Wires stores, capabilities and the pipeline from the command line.
pub async fn build_context(args: &Args) -> Result<Arc<ChatContext>, Box<dyn Error + Send + Sync>> {
    let rules = SafetyRules::load(args.safety_rules_path.as_deref())?;
    let auth = Authenticator::new(&args.auth_secret)?;

    let store = store::create_store(&args.store_type, &args.store_url, &args.store_redis_prefix)?;
    for entry in &args.seed_conversations {
        match store::parse_seed(entry) {
            Some(conversation) => {
                let created = store.create_conversation(conversation).await?;
                info!("Seeded conversation {} owned by {}", created.id, created.owner_id);
            }
            None => warn!("Ignoring malformed seed entry '{}'", entry),
        }
    }

    let registry = Arc::new(ConversationRegistry::new());
    let broadcaster: Arc<dyn Broadcaster> = match &args.pubsub_redis_url {
        Some(url) => {
            let broadcaster = RedisBroadcaster::new(url, Arc::clone(&registry))?;
            spawn_relay(url.clone(), Arc::clone(&registry), broadcaster.node_id());
            Arc::new(broadcaster)
        }
        None => Arc::new(LocalBroadcaster::new(Arc::clone(&registry))),
    };

    let llm_config = LlmConfig {
        llm_type: args.reply_generator.parse::<LlmType>()?,
        api_key: Some(args.chat_api_key.clone()).filter(|k| !k.is_empty()),
        completion_model: args.chat_model.clone(),
        base_url: args.chat_base_url.clone(),
        request_timeout_ms: args.capability_timeout_ms,
    };
    let generator = new_generator(&llm_config, FallbackGenerator)?;
    let notifier = notify::create_notifier(
        &args.notifier,
        args.notify_webhook_url.as_deref(),
        args.capability_timeout_ms
    )?;
    let limiter = ratelimit::create_rate_limiter(
        &args.rate_limit_backend,
        args.rate_limit_redis_url.as_deref()
    );

    let settings = PipelineSettings {
        history_limit: args.history_limit,
        capability_timeout: Duration::from_millis(args.capability_timeout_ms),
        llm_rate_limit: args.llm_rate_limit,
        llm_rate_period: Duration::from_secs(args.llm_rate_period_secs),
        escalation_recipients: args.notify_recipients
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect(),
    };
    let orchestrator = Arc::new(
        Orchestrator::new(Arc::clone(&store), Arc::clone(&broadcaster), Arc::clone(&rules), settings)
            .with_classifier(Arc::new(LexiconClassifier::new(rules)))
            .with_generator(generator)
            .with_notifier(notifier)
            .with_rate_limiter(limiter)
    );

    let mode: DispatchMode = args.dispatch_mode.parse()?;
    let dispatcher = Dispatcher::new(orchestrator, mode, args.pipeline_workers, args.pipeline_queue);
    let pipeline = Arc::new(Pipeline::new(Arc::clone(&store), broadcaster, dispatcher));

    Ok(
        Arc::new(ChatContext {
            auth,
            store,
            registry,
            pipeline,
            settings: SessionSettings {
                max_message_chars: args.max_message_chars,
                backlog_limit: args.backlog_limit,
                send_rate_count: args.send_rate_count,
                send_rate_period: Duration::from_secs(args.send_rate_period_secs),
                send_queue: args.send_queue,
            },
        })
    )
}
