use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };

use super::{ http_client, LlmConfig, ReplyGenerator };
use crate::error::CapabilityError;
use crate::models::chat::{ ClassificationResult, HistoryTurn };

const CRISIS_REPLY: &str =
    "I'm really sorry you're going through this. Your safety matters most. \
If you're in immediate danger, please call your local emergency number right now. \
If you can, reach out to someone you trust and don't stay alone. \
Would you like help finding local crisis resources or connecting to a human?";

const NO_HIT_REPLY: &str =
    "Thanks for sharing that. Can you tell me a little more about what's been going on?";

/// Client for the `/predict` companion service.
pub struct BrainClient {
    http: HttpClient,
    base_url: String,
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    message: &'a str,
}

#[derive(Deserialize, Debug, Default)]
pub struct Prediction {
    #[serde(default)]
    pub crisis: bool,
    #[serde(default)]
    pub kb_hits: Vec<serde_json::Value>,
    #[serde(default)]
    pub reply: Option<String>,
}

impl Prediction {
    /// Server-provided reply, else crisis text, else the top knowledge-base hit.
    pub fn into_reply(self) -> String {
        if let Some(reply) = self.reply.filter(|r| !r.trim().is_empty()) {
            return reply;
        }
        if self.crisis {
            return CRISIS_REPLY.to_string();
        }
        let top = self.kb_hits.into_iter().find_map(|hit| {
            match hit {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) if s.is_empty() => None,
                serde_json::Value::String(s) => Some(s),
                other => Some(other.to_string()),
            }
        });
        match top {
            Some(hit) =>
                format!("{}\n\nWould you like to try that now, or share more about what you're feeling?", hit),
            None => NO_HIT_REPLY.to_string(),
        }
    }
}

impl BrainClient {
    pub fn new(base_url: Option<String>, timeout_ms: u64) -> Result<Self, CapabilityError> {
        Ok(Self {
            http: http_client(timeout_ms)?,
            base_url: base_url.unwrap_or_else(|| "http://127.0.0.1:8001".to_string()),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, CapabilityError> {
        Self::new(config.base_url.clone(), config.request_timeout_ms)
    }

    pub async fn predict(&self, message: &str) -> Result<Prediction, CapabilityError> {
        let url = format!("{}/predict", self.base_url.trim_end_matches('/'));
        let resp = self.http
            .post(&url)
            .json(&(PredictRequest { message }))
            .send().await?
            .error_for_status()?;
        Ok(resp.json::<Prediction>().await?)
    }
}

#[async_trait]
impl ReplyGenerator for BrainClient {
    fn name(&self) -> &str {
        "brain"
    }

    async fn generate(
        &self,
        text: &str,
        _classification: &ClassificationResult,
        _history: &[HistoryTurn]
    ) -> Result<String, CapabilityError> {
        Ok(self.predict(text).await?.into_reply())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Prediction {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn explicit_reply_wins() {
        let p = parse(r#"{"crisis": true, "reply": "custom"}"#);
        assert_eq!(p.into_reply(), "custom");
    }

    #[test]
    fn crisis_without_reply() {
        assert_eq!(parse(r#"{"crisis": true}"#).into_reply(), CRISIS_REPLY);
    }

    #[test]
    fn top_kb_hit() {
        let reply = parse(r#"{"kb_hits": ["", "Try box breathing."]}"#).into_reply();
        assert!(reply.starts_with("Try box breathing."));
    }

    #[test]
    fn empty_prediction() {
        assert_eq!(parse("{}").into_reply(), NO_HIT_REPLY);
    }
}
