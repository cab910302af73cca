pub mod brain;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use log::info;
use serde::{ Deserialize, Serialize };
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::CapabilityError;
use crate::models::chat::{ ClassificationResult, HistoryTurn, SenderRole };
use crate::nlu::FallbackGenerator;
use self::brain::BrainClient;
use self::ollama::OllamaClient;
use self::openai::OpenAIChatClient;

/// Number of prior turns forwarded to a remote model.
const PROMPT_HISTORY_TURNS: usize = 6;

const SYSTEM_PROMPT: &str =
    "You are a compassionate, safety-first mental health assistant. \
Be brief and empathetic, validate feelings, offer one short coping suggestion \
and ask one open question. If the user is in immediate danger, instruct them \
to contact local emergency services and offer to provide human resources.";

/// Produces the reply text for a message that passed the safety gate.
///
/// An empty string or an `Err` makes the pipeline substitute the local
/// [`FallbackGenerator`].
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        text: &str,
        classification: &ClassificationResult,
        history: &[HistoryTurn]
    ) -> Result<String, CapabilityError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmType {
    Fallback,
    Ollama,
    OpenAI,
    Brain,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLlmTypeError {
    message: String,
}

impl fmt::Display for ParseLlmTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseLlmTypeError {}

impl FromStr for LlmType {
    type Err = ParseLlmTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fallback" | "local" | "none" => Ok(LlmType::Fallback),
            "ollama" => Ok(LlmType::Ollama),
            "openai" => Ok(LlmType::OpenAI),
            "brain" => Ok(LlmType::Brain),
            _ =>
                Err(ParseLlmTypeError {
                    message: format!("Invalid reply generator type: '{}'", s),
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub llm_type: LlmType,
    pub api_key: Option<String>,
    pub completion_model: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_type: LlmType::Fallback,
            api_key: None,
            completion_model: None,
            base_url: None,
            request_timeout_ms: 6000,
        }
    }
}

/// Builds the configured generator; the local fallback when none is configured.
pub fn new_generator(
    config: &LlmConfig,
    fallback: FallbackGenerator
) -> Result<Arc<dyn ReplyGenerator>, CapabilityError> {
    let generator: Arc<dyn ReplyGenerator> = match config.llm_type {
        LlmType::Fallback => Arc::new(fallback),
        LlmType::Ollama => Arc::new(OllamaClient::from_config(config)?),
        LlmType::OpenAI => Arc::new(OpenAIChatClient::from_config(config)?),
        LlmType::Brain => Arc::new(BrainClient::from_config(config)?),
    };
    info!(
        "Reply generator configured: Type={:?}, Model={}, BaseURL={}",
        config.llm_type,
        config.completion_model.as_deref().unwrap_or("adapter default"),
        config.base_url.as_deref().unwrap_or("adapter default")
    );
    Ok(generator)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// System prompt, the most recent history turns, then the user text.
pub fn build_prompt(history: &[HistoryTurn], text: &str) -> Vec<PromptMessage> {
    let mut messages = vec![PromptMessage {
        role: "system".to_string(),
        content: SYSTEM_PROMPT.to_string(),
    }];
    let start = history.len().saturating_sub(PROMPT_HISTORY_TURNS);
    for turn in &history[start..] {
        let role = match turn.sender {
            SenderRole::User => "user",
            SenderRole::Bot | SenderRole::System => "assistant",
        };
        messages.push(PromptMessage {
            role: role.to_string(),
            content: turn.text.clone(),
        });
    }
    messages.push(PromptMessage {
        role: "user".to_string(),
        content: text.to_string(),
    });
    messages
}

/// Flattened form for completion endpoints that take a single prompt.
pub fn flatten_prompt(messages: &[PromptMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}] {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn http_client(timeout_ms: u64) -> Result<reqwest::Client, CapabilityError> {
    Ok(
        reqwest::Client
            ::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()?
    )
}
