use super::{LLMError, LLMProvider, Message};
use crate::config::OpenAIConfig;
use async_trait::async_trait;
use serde_json::json;

pub struct OpenAIProvider {
    config: OpenAIConfig,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig, temperature: f32) -> Self {
        Self {
            config,
            temperature,
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> super::Result<String> {
        std::env::var(&self.config.api_key_env).map_err(|_| {
            LLMError::AuthenticationFailed(format!("{} is not set", self.config.api_key_env))
        })
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn check_health(&self) -> bool {
        self.api_key().is_ok()
    }

    async fn generate(&self, messages: &[Message]) -> super::Result<String> {
        let api_key = self.api_key()?;

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let api_messages: Vec<_> = messages
            .iter()
            .map(|msg| {
                json!({
                    "role": msg.role.to_string(),
                    "content": msg.content
                })
            })
            .collect();

        let payload = json!({
            "model": self.config.model,
            "messages": api_messages,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| LLMError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(LLMError::AuthenticationFailed(text));
            } else if status.as_u16() == 429 {
                return Err(LLMError::RateLimitExceeded);
            } else {
                return Err(LLMError::InvalidRequest(text));
            }
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        let choice = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| LLMError::ParseError("No choices in response".to_string()))?;

        choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| LLMError::ParseError("Empty content".to_string()))
    }
}
