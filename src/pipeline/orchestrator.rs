use chrono::Utc;
use log::{ debug, error, info, warn };
use serde::{ Deserialize, Serialize };
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use super::locks::KeyedLocks;
use crate::broadcast::Broadcaster;
use crate::config::SafetyRules;
use crate::error::{ CapabilityError, StoreError };
use crate::llm::ReplyGenerator;
use crate::models::chat::{
    ClassificationResult,
    HistoryTurn,
    Message,
    MessageId,
    MessageUpdate,
    NewMessage,
    SafetyVerdict,
    SenderRole,
    Severity,
};
use crate::models::websocket::ServerMessage;
use crate::nlu::{ safety_check, FallbackGenerator, LexiconClassifier, SafetyClassifier };
use crate::notify::{ LogNotifier, Notifier };
use crate::ratelimit::{ MemoryRateLimiter, RateLimiter };
use crate::store::MessageStore;

/// Extra rows read past the history window, so messages accepted after the
/// one being processed do not push earlier turns out of it.
const HISTORY_SLACK: usize = 16;

/// Result of one pipeline run, reported to dispatch callers and the retry API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Ok {
        message_id: MessageId,
        bot_message_id: MessageId,
    },
    Flagged {
        message_id: MessageId,
        severity: Severity,
        system_message_id: MessageId,
    },
    AlreadyProcessed {
        message_id: MessageId,
        reply_message_id: MessageId,
    },
    Missing {
        message_id: MessageId,
    },
    SkippedNonUser {
        message_id: MessageId,
    },
    Error {
        message_id: MessageId,
        error: String,
    },
}

impl PipelineOutcome {
    pub fn error(message_id: MessageId, error: impl ToString) -> Self {
        PipelineOutcome::Error { message_id, error: error.to_string() }
    }

    pub fn status(&self) -> &'static str {
        match self {
            PipelineOutcome::Ok { .. } => "ok",
            PipelineOutcome::Flagged { .. } => "flagged",
            PipelineOutcome::AlreadyProcessed { .. } => "already_processed",
            PipelineOutcome::Missing { .. } => "missing",
            PipelineOutcome::SkippedNonUser { .. } => "skipped_non_user",
            PipelineOutcome::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub history_limit: usize,
    pub capability_timeout: Duration,
    pub llm_rate_limit: u32,
    pub llm_rate_period: Duration,
    pub escalation_recipients: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            history_limit: 8,
            capability_timeout: Duration::from_millis(6000),
            llm_rate_limit: 50,
            llm_rate_period: Duration::from_secs(3600),
            escalation_recipients: Vec::new(),
        }
    }
}

/// Classifies a persisted user message, gates it through the safety check
/// and produces exactly one bot or system reply for it.
pub struct Orchestrator {
    store: Arc<dyn MessageStore>,
    broadcaster: Arc<dyn Broadcaster>,
    rules: Arc<SafetyRules>,
    classifier: Arc<dyn SafetyClassifier>,
    generator: Arc<dyn ReplyGenerator>,
    fallback: FallbackGenerator,
    notifier: Arc<dyn Notifier>,
    limiter: Arc<dyn RateLimiter>,
    settings: PipelineSettings,
    message_locks: KeyedLocks,
}

impl Orchestrator {
    /// Starts with local capabilities: lexicon classifier, fallback replies,
    /// log-only escalation and an in-memory limiter.
    pub fn new(
        store: Arc<dyn MessageStore>,
        broadcaster: Arc<dyn Broadcaster>,
        rules: Arc<SafetyRules>,
        settings: PipelineSettings
    ) -> Self {
        let fallback = FallbackGenerator;
        Self {
            store,
            broadcaster,
            classifier: Arc::new(LexiconClassifier::new(Arc::clone(&rules))),
            generator: Arc::new(fallback),
            fallback,
            notifier: Arc::new(LogNotifier),
            limiter: Arc::new(MemoryRateLimiter::new()),
            rules,
            settings,
            message_locks: KeyedLocks::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SafetyClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn ReplyGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Safe to call any number of times for the same id; runs for one id
    /// are serialized and a message that already has a reply is left alone.
    pub async fn handle_user_message(&self, message_id: MessageId) -> PipelineOutcome {
        let _guard = self.message_locks.acquire(&message_id.to_string()).await;
        match self.process(message_id).await {
            Ok(outcome) => {
                info!("Pipeline for {} finished: {}", message_id, outcome.status());
                outcome
            }
            Err(e) => {
                error!("Pipeline for {} failed: {}", message_id, e);
                PipelineOutcome::error(message_id, e)
            }
        }
    }

    async fn process(&self, message_id: MessageId) -> Result<PipelineOutcome, StoreError> {
        let Some(message) = self.store.get_message(message_id).await? else {
            warn!("Message {} not found, nothing to process", message_id);
            return Ok(PipelineOutcome::Missing { message_id });
        };
        if message.sender != SenderRole::User {
            debug!("Message {} was sent by {}, skipping", message_id, message.sender);
            return Ok(PipelineOutcome::SkippedNonUser { message_id });
        }
        if let Some(reply) = self.store.find_reply(message_id).await? {
            return Ok(PipelineOutcome::AlreadyProcessed {
                message_id,
                reply_message_id: reply.id,
            });
        }

        let history = self.history_for(&message).await;
        let classification = self.classify(&message.text, &history).await;
        let verdict = safety_check(&message.text, &classification, &self.rules);
        let annotated = self.store.update_message_fields(
            message_id,
            MessageUpdate::annotate(classification.clone(), verdict)
        ).await?;

        if verdict.flagged {
            self.respond_flagged(&annotated, &classification, verdict).await
        } else {
            self.respond_with_reply(&annotated, &classification, &history).await
        }
    }

    /// Up to `history_limit` turns that precede `message`, oldest first.
    /// A store failure degrades to an empty history.
    async fn history_for(&self, message: &Message) -> Vec<HistoryTurn> {
        let window = self.settings.history_limit + HISTORY_SLACK;
        let recent = match self.store.list_recent_messages(&message.conversation_id, window).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Could not load history for {}: {}", message.id, e);
                return Vec::new();
            }
        };
        let prior: Vec<&Message> = recent
            .iter()
            .filter(|m| m.id != message.id && m.created_at < message.created_at)
            .collect();
        let start = prior.len().saturating_sub(self.settings.history_limit);
        prior[start..]
            .iter()
            .map(|m| HistoryTurn::from(*m))
            .collect()
    }

    /// Runs a capability call under the configured timeout.
    async fn bounded<T, F>(&self, capability: &'static str, call: F) -> Result<T, CapabilityError>
        where F: Future<Output = Result<T, CapabilityError>>
    {
        let limit = self.settings.capability_timeout;
        timeout(limit, call).await.unwrap_or_else(|_| {
            Err(CapabilityError::Timeout(capability, limit.as_millis()))
        })
    }

    async fn classify(&self, text: &str, history: &[HistoryTurn]) -> ClassificationResult {
        match self.bounded("classifier", self.classifier.classify(text, history)).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Classifier unavailable, using neutral result: {}", e);
                ClassificationResult::neutral()
            }
        }
    }

    async fn respond_flagged(
        &self,
        message: &Message,
        classification: &ClassificationResult,
        verdict: SafetyVerdict
    ) -> Result<PipelineOutcome, StoreError> {
        warn!(
            "Message {} in {} flagged with {} severity",
            message.id,
            message.conversation_id,
            verdict.severity
        );
        let reply = NewMessage::reply(message, SenderRole::System, self.rules.safety_message.clone());
        let system = match self.persist_reply(message.id, reply).await? {
            Ok(system) => system,
            Err(existing) => {
                return Ok(existing);
            }
        };
        self.broadcaster.broadcast(&message.conversation_id, ServerMessage::Message {
            message: system.clone(),
        }).await;

        if verdict.severity == Severity::High {
            self.escalate(message, classification).await;
        }

        Ok(PipelineOutcome::Flagged {
            message_id: message.id,
            severity: verdict.severity,
            system_message_id: system.id,
        })
    }

    async fn respond_with_reply(
        &self,
        message: &Message,
        classification: &ClassificationResult,
        history: &[HistoryTurn]
    ) -> Result<PipelineOutcome, StoreError> {
        let owner = self.store
            .get_conversation(&message.conversation_id).await?
            .ok_or_else(|| StoreError::ConversationNotFound(message.conversation_id.clone()))?
            .owner_id;
        let text = self.generate_reply(&owner, message, classification, history).await;

        let reply = NewMessage::reply(message, SenderRole::Bot, text);
        let bot = match self.persist_reply(message.id, reply).await? {
            Ok(bot) => bot,
            Err(existing) => {
                return Ok(existing);
            }
        };
        self.broadcaster.broadcast(&message.conversation_id, ServerMessage::Message {
            message: bot.clone(),
        }).await;

        Ok(PipelineOutcome::Ok {
            message_id: message.id,
            bot_message_id: bot.id,
        })
    }

    /// Inner `Err` carries the outcome when another run already replied.
    async fn persist_reply(
        &self,
        source: MessageId,
        reply: NewMessage
    ) -> Result<Result<Message, PipelineOutcome>, StoreError> {
        match self.store.create_message(reply).await {
            Ok(message) => Ok(Ok(message)),
            Err(StoreError::ReplyExists(_)) => {
                let existing = self.store.find_reply(source).await?;
                let reply_message_id = existing
                    .map(|m| m.id)
                    .ok_or(StoreError::MessageNotFound(source))?;
                Ok(Err(PipelineOutcome::AlreadyProcessed { message_id: source, reply_message_id }))
            }
            Err(e) => Err(e),
        }
    }

    async fn generate_reply(
        &self,
        user_id: &str,
        message: &Message,
        classification: &ClassificationResult,
        history: &[HistoryTurn]
    ) -> String {
        let fallback = || self.fallback.reply(classification).to_string();

        let quota = self.limiter.allow(
            user_id,
            self.settings.llm_rate_limit,
            self.settings.llm_rate_period
        );
        // A stalled limiter backend fails open like an unreachable one.
        let allowed = match timeout(self.settings.capability_timeout, quota).await {
            Ok(allowed) => allowed,
            Err(_) => {
                warn!("Rate limiter did not answer for {}, allowing", user_id);
                true
            }
        };
        if !allowed {
            info!("Generator quota exhausted for {}, using fallback reply", user_id);
            return fallback();
        }

        let name = self.generator.name().to_string();
        let generated = self.bounded(
            "generator",
            self.generator.generate(&message.text, classification, history)
        ).await;
        match generated {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!("Generator '{}' returned an empty reply, using fallback", name);
                fallback()
            }
            Err(e) => {
                warn!("Generator '{}' failed, using fallback: {}", name, e);
                fallback()
            }
        }
    }

    async fn escalate(&self, message: &Message, classification: &ClassificationResult) {
        let owner = match self.store.get_conversation(&message.conversation_id).await {
            Ok(Some(c)) => c.owner_id,
            Ok(None) => "N/A".to_string(),
            Err(e) => {
                warn!("Could not resolve owner for escalation: {}", e);
                "N/A".to_string()
            }
        };
        let (subject, body) = escalation_notice(message, &owner, classification);
        let sent = self.bounded(
            "notifier",
            self.notifier.notify(&subject, &body, &self.settings.escalation_recipients)
        ).await;
        match sent {
            Ok(()) => info!("Escalation sent for message {}", message.id),
            Err(e) => error!("Escalation for message {} failed: {}", message.id, e),
        }
    }
}

pub fn escalation_notice(
    message: &Message,
    owner_id: &str,
    classification: &ClassificationResult
) -> (String, String) {
    let subject = format!("[Safety] High-severity flag (conversation {})", message.conversation_id);
    let classification_json = serde_json
        ::to_string_pretty(classification)
        .unwrap_or_else(|_| "{}".to_string());
    let body = format!(
        "Conversation: {}\nUser: {}\nMessage ID: {}\nText: {}\nClassification: {}\nTimestamp: {}\n",
        message.conversation_id,
        owner_id,
        message.id,
        message.text,
        classification_json,
        Utc::now().to_rfc3339()
    );
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{ ConversationRegistry, LocalBroadcaster };
    use crate::models::chat::Conversation;
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, Orchestrator) {
        let store = Arc::new(MemoryStore::new());
        store.create_conversation(Conversation::new("c1", "alice")).await.unwrap();
        let broadcaster = Arc::new(LocalBroadcaster::new(Arc::new(ConversationRegistry::new())));
        let orchestrator = Orchestrator::new(
            store.clone(),
            broadcaster,
            Arc::new(SafetyRules::default()),
            PipelineSettings::default()
        );
        (store, orchestrator)
    }

    #[tokio::test]
    async fn missing_message() {
        let (_store, orchestrator) = setup().await;
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            orchestrator.handle_user_message(id).await,
            PipelineOutcome::Missing { message_id: id }
        );
    }

    #[tokio::test]
    async fn bot_messages_are_skipped() {
        let (store, orchestrator) = setup().await;
        let user = store.create_message(NewMessage::user("c1", "hi")).await.unwrap();
        let bot = store
            .create_message(NewMessage::reply(&user, SenderRole::Bot, "hello")).await
            .unwrap();
        assert_eq!(
            orchestrator.handle_user_message(bot.id).await,
            PipelineOutcome::SkippedNonUser { message_id: bot.id }
        );
    }

    #[tokio::test]
    async fn greeting_gets_fallback_reply() {
        let (store, orchestrator) = setup().await;
        let user = store.create_message(NewMessage::user("c1", "hello")).await.unwrap();
        let outcome = orchestrator.handle_user_message(user.id).await;
        let PipelineOutcome::Ok { bot_message_id, .. } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        let bot = store.get_message(bot_message_id).await.unwrap().unwrap();
        assert_eq!(bot.sender, SenderRole::Bot);
        assert_eq!(bot.in_reply_to, Some(user.id));
        assert!(!bot.text.is_empty());

        let annotated = store.get_message(user.id).await.unwrap().unwrap();
        assert!(annotated.classification.is_some());
        assert!(!annotated.flagged);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let (store, orchestrator) = setup().await;
        let user = store.create_message(NewMessage::user("c1", "thanks a lot")).await.unwrap();
        let first = orchestrator.handle_user_message(user.id).await;
        let second = orchestrator.handle_user_message(user.id).await;
        let PipelineOutcome::Ok { bot_message_id, .. } = first else {
            panic!("unexpected outcome {:?}", first);
        };
        assert_eq!(second, PipelineOutcome::AlreadyProcessed {
            message_id: user.id,
            reply_message_id: bot_message_id,
        });
        assert_eq!(store.message_count("c1").await, 2);
    }

    #[tokio::test]
    async fn crisis_message_gets_safety_reply() {
        let (store, orchestrator) = setup().await;
        let user = store
            .create_message(NewMessage::user("c1", "I want to kill myself tonight")).await
            .unwrap();
        let outcome = orchestrator.handle_user_message(user.id).await;
        let PipelineOutcome::Flagged { severity, system_message_id, .. } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(severity, Severity::High);
        let system = store.get_message(system_message_id).await.unwrap().unwrap();
        assert_eq!(system.sender, SenderRole::System);
        assert_eq!(system.text, SafetyRules::default().safety_message);
        assert!(store.get_message(user.id).await.unwrap().unwrap().flagged);
    }

    #[tokio::test]
    async fn history_excludes_current_and_later_messages() {
        let (store, orchestrator) = setup().await;
        for i in 0..10 {
            store.create_message(NewMessage::user("c1", format!("m{}", i))).await.unwrap();
        }
        let current = store.create_message(NewMessage::user("c1", "now")).await.unwrap();
        store.create_message(NewMessage::user("c1", "later")).await.unwrap();

        let history = orchestrator.history_for(&current).await;
        let texts: Vec<_> = history
            .iter()
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(texts, vec!["m2", "m3", "m4", "m5", "m6", "m7", "m8", "m9"]);
    }

    struct StalledLimiter;

    #[async_trait::async_trait]
    impl RateLimiter for StalledLimiter {
        async fn try_acquire(
            &self,
            _: &str,
            _: u32,
            _: Duration
        ) -> Result<bool, crate::error::RateLimitError> {
            std::future::pending().await
        }
    }

    struct EchoGenerator;

    #[async_trait::async_trait]
    impl ReplyGenerator for EchoGenerator {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            text: &str,
            _: &ClassificationResult,
            _: &[HistoryTurn]
        ) -> Result<String, CapabilityError> {
            Ok(format!("echo: {}", text))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_limiter_fails_open() {
        let (store, orchestrator) = setup().await;
        let orchestrator = orchestrator
            .with_rate_limiter(Arc::new(StalledLimiter))
            .with_generator(Arc::new(EchoGenerator));
        let user = store.create_message(NewMessage::user("c1", "tell me more")).await.unwrap();

        let outcome = orchestrator.handle_user_message(user.id).await;
        let PipelineOutcome::Ok { bot_message_id, .. } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        let bot = store.get_message(bot_message_id).await.unwrap().unwrap();
        assert_eq!(bot.text, "echo: tell me more");
    }

    #[test]
    fn escalation_mentions_conversation() {
        let message = Message {
            id: uuid::Uuid::new_v4(),
            conversation_id: "c9".into(),
            sender: SenderRole::User,
            text: "help".into(),
            classification: None,
            flagged: true,
            in_reply_to: None,
            created_at: Utc::now(),
        };
        let (subject, body) = escalation_notice(&message, "alice", &ClassificationResult::neutral());
        assert_eq!(subject, "[Safety] High-severity flag (conversation c9)");
        assert!(body.contains("User: alice"));
        assert!(body.contains(&message.id.to_string()));
    }

    #[test]
    fn outcome_is_tagged_by_status() {
        let id = uuid::Uuid::new_v4();
        let json = serde_json::to_value(PipelineOutcome::Missing { message_id: id }).unwrap();
        assert_eq!(json["status"], "missing");
        assert_eq!(PipelineOutcome::error(id, "boom").status(), "error");
    }
}
