use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type MessageId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    User,
    Bot,
    System,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::User => "user",
            SenderRole::Bot => "bot",
            SenderRole::System => "system",
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    HelpRequest,
    Thanks,
    Suicidal,
    Positive,
    Negative,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::HelpRequest => "help_request",
            Intent::Thanks => "thanks",
            Intent::Suicidal => "suicidal",
            Intent::Positive => "positive",
            Intent::Negative => "negative",
            Intent::Unknown => "unknown",
        }
    }
}

/// Lexicon sentiment counts plus a compound score in [-1, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub neg: f64,
    pub pos: f64,
    pub compound: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub intent: Intent,
    pub confidence: f64,
    /// `None` when the classifier could not score the text.
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub entities: HashMap<String, serde_json::Value>,
}

impl ClassificationResult {
    /// Substituted whenever the classifier fails or times out.
    pub fn neutral() -> Self {
        Self {
            intent: Intent::Unknown,
            confidence: 0.0,
            sentiment: None,
            entities: HashMap::new(),
        }
    }

    pub fn compound(&self) -> f64 {
        self.sentiment.map(|s| s.compound).unwrap_or(0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub flagged: bool,
    pub severity: Severity,
}

impl SafetyVerdict {
    pub fn clear() -> Self {
        Self { flagged: false, severity: Severity::Low }
    }

    pub fn flagged(severity: Severity) -> Self {
        Self { flagged: true, severity }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub sender: SenderRole,
    pub text: String,
    pub classification: Option<ClassificationResult>,
    pub flagged: bool,
    /// Set on bot/system messages produced by the pipeline for a user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

/// A message that has not been persisted yet; the store assigns id and timestamp.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender: SenderRole,
    pub text: String,
    pub in_reply_to: Option<MessageId>,
}

impl NewMessage {
    pub fn user(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender: SenderRole::User,
            text: text.into(),
            in_reply_to: None,
        }
    }

    pub fn reply(source: &Message, sender: SenderRole, text: impl Into<String>) -> Self {
        Self {
            conversation_id: source.conversation_id.clone(),
            sender,
            text: text.into(),
            in_reply_to: Some(source.id),
        }
    }
}

/// Partial update applied by the pipeline. Fields left `None` are untouched.
#[derive(Clone, Debug, Default)]
pub struct MessageUpdate {
    pub classification: Option<ClassificationResult>,
    pub flagged: Option<bool>,
}

impl MessageUpdate {
    pub fn annotate(classification: ClassificationResult, verdict: SafetyVerdict) -> Self {
        Self {
            classification: Some(classification),
            flagged: Some(verdict.flagged),
        }
    }

    pub fn apply(self, message: &mut Message) {
        if let Some(classification) = self.classification {
            message.classification = Some(classification);
        }
        if let Some(flagged) = self.flagged {
            message.flagged = flagged && message.classification.is_some();
        }
    }
}

/// One prior turn handed to classifiers and generators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub sender: SenderRole,
    pub text: String,
}

impl From<&Message> for HistoryTurn {
    fn from(message: &Message) -> Self {
        Self {
            sender: message.sender,
            text: message.text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: "c1".into(),
            sender: SenderRole::User,
            text: "hello".into(),
            classification: None,
            flagged: false,
            in_reply_to: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn update_keeps_untouched_fields() {
        let mut msg = sample();
        MessageUpdate::annotate(ClassificationResult::neutral(), SafetyVerdict::clear()).apply(
            &mut msg
        );
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.sender, SenderRole::User);
        assert!(msg.classification.is_some());
        assert!(!msg.flagged);
    }

    #[test]
    fn flagged_requires_classification() {
        let mut msg = sample();
        MessageUpdate { classification: None, flagged: Some(true) }.apply(&mut msg);
        assert!(!msg.flagged);
    }

    #[test]
    fn intent_serializes_snake_case() {
        let json = serde_json::to_string(&Intent::HelpRequest).unwrap();
        assert_eq!(json, "\"help_request\"");
        assert_eq!(Intent::Suicidal.as_str(), "suicidal");
    }
}
