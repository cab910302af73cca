use async_trait::async_trait;
use log::debug;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };

use super::{ build_prompt, flatten_prompt, http_client, LlmConfig, LlmType, ReplyGenerator };
use crate::error::CapabilityError;
use crate::models::chat::{ ClassificationResult, HistoryTurn };

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
pub struct GenerateResponse {
    pub response: String,
}

impl OllamaClient {
    pub fn new(
        base_url: Option<String>,
        completion_model: Option<String>,
        timeout_ms: u64
    ) -> Result<Self, CapabilityError> {
        let model = completion_model.unwrap_or_else(|| "llama3".to_string());
        let url = base_url.unwrap_or_else(|| "http://localhost:11434".into());

        Ok(Self {
            http: http_client(timeout_ms)?,
            base_url: url,
            completion_model: model,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, CapabilityError> {
        if config.llm_type != LlmType::Ollama {
            return Err(CapabilityError::NotConfigured("Invalid config type for OllamaClient".into()));
        }

        Self::new(config.base_url.clone(), config.completion_model.clone(), config.request_timeout_ms)
    }

    pub async fn generate_raw(&self, prompt: &str) -> Result<GenerateResponse, CapabilityError> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let req = GenerateRequest {
            model: self.completion_model.clone(),
            prompt: prompt.to_string(),
            stream: false,
        };
        let resp = self.http.post(&url).json(&req).send().await?.error_for_status()?;
        let data = resp.json::<GenerateResponse>().await?;
        Ok(data)
    }
}

#[async_trait]
impl ReplyGenerator for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        text: &str,
        _classification: &ClassificationResult,
        history: &[HistoryTurn]
    ) -> Result<String, CapabilityError> {
        let prompt = flatten_prompt(&build_prompt(history, text));
        let resp = self.generate_raw(&prompt).await?;
        debug!("Ollama returned {} chars", resp.response.len());
        Ok(resp.response.trim().to_string())
    }
}
