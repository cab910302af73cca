use async_trait::async_trait;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use std::time::Duration;

use super::{ build_prompt, LlmConfig, PromptMessage, ReplyGenerator };
use crate::error::CapabilityError;
use crate::models::chat::{ ClassificationResult, HistoryTurn };

pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<PromptMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAIChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        timeout_ms: u64
    ) -> Result<Self, CapabilityError> {
        let chat_model = model.unwrap_or_else(|| "gpt-4o-mini".to_string());
        let api_url = base_url.unwrap_or_else(||
            "https://api.openai.com/v1/chat/completions".to_string()
        );
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                CapabilityError::NotConfigured(format!("Invalid API key format: {}", e))
            )?
        );

        let http = HttpClient::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;

        Ok(Self {
            http,
            model: chat_model,
            base_url: api_url,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, CapabilityError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CapabilityError::NotConfigured("OpenAI API key is required".into()))?;

        Self::new(
            api_key,
            config.completion_model.clone(),
            config.base_url.clone(),
            config.request_timeout_ms
        )
    }
}

#[async_trait]
impl ReplyGenerator for OpenAIChatClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        text: &str,
        _classification: &ClassificationResult,
        history: &[HistoryTurn]
    ) -> Result<String, CapabilityError> {
        let req = OpenAIChatRequest {
            model: self.model.clone(),
            messages: build_prompt(history, text),
            temperature: 0.7,
            max_tokens: Some(256),
        };
        let resp = self.http
            .post(self.base_url.trim_end_matches('/'))
            .json(&req)
            .send().await?
            .error_for_status()?;
        let data = resp.json::<OpenAIResponse>().await?;
        let content = data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CapabilityError::InvalidResponse("no choices in completion".into()))?;
        Ok(content.trim().to_string())
    }
}
