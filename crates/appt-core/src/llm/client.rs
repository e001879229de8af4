//! LLM API HTTP Client
//!
//! Supports both Claude API and OpenAI-compatible APIs

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{Error, Result};

use super::types::*;

/// Free-text generation capability
///
/// The extraction engine only needs "send an instruction and a user text, get
/// text back". Replies are not guaranteed to be well-formed.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String>;
}

/// LLM API client (supports Claude and OpenAI-compatible APIs)
#[derive(Clone)]
pub struct ClaudeClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    provider: LlmProvider,
}

impl ClaudeClient {
    /// Create a new LLM client
    pub fn new(llm_config: &LlmConfig) -> Result<Self> {
        if llm_config.api_key.is_empty() {
            return Err(Error::Config("LLM API key is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(llm_config.timeout())
            .build()
            .map_err(Error::Http)?;

        let base_url = match &llm_config.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => match llm_config.provider {
                LlmProvider::Claude => "https://api.anthropic.com/v1".to_string(),
                LlmProvider::OpenAi => "https://api.openai.com/v1".to_string(),
            },
        };

        Ok(Self {
            client,
            api_key: llm_config.api_key.clone(),
            model: llm_config.model.clone(),
            base_url,
            provider: llm_config.provider.clone(),
        })
    }

    /// Send a message to the LLM API
    pub async fn messages(&self, request: MessagesRequest) -> Result<MessagesResponse> {
        match self.provider {
            LlmProvider::Claude => self.send_claude_request(request).await,
            LlmProvider::OpenAi => self.send_openai_request(request).await,
        }
    }

    async fn send_claude_request(&self, request: MessagesRequest) -> Result<MessagesResponse> {
        let url = format!("{}/messages", self.base_url);

        debug!("Sending request to Claude API: {}", url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_send_error)?;

        if !status.is_success() {
            warn!("Claude API error: {} - {}", status, body);
            return Err(Error::Llm(format!("{}: {}", status, body)));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body).map_err(|e| {
            Error::Llm(format!("Failed to parse response: {} - {}", e, body))
        })?;

        info!(
            "Claude API response: stop_reason={:?}, tokens={}",
            parsed.stop_reason,
            parsed.usage.as_ref().map(|u| u.output_tokens).unwrap_or(0)
        );

        Ok(parsed)
    }

    async fn send_openai_request(&self, request: MessagesRequest) -> Result<MessagesResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!("Sending request to OpenAI-compatible API: {}", url);

        let openai_request = ChatCompletionRequest::from_claude_request(&request);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&openai_request)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_send_error)?;

        if !status.is_success() {
            warn!("OpenAI API error: {} - {}", status, body);
            return Err(Error::Llm(format!("{}: {}", status, body)));
        }

        let openai_response: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            Error::Llm(format!("Failed to parse response: {} - {}", e, body))
        })?;

        let parsed = openai_response.to_claude_response();

        info!(
            "OpenAI API response: stop_reason={:?}, tokens={}",
            parsed.stop_reason,
            parsed.usage.as_ref().map(|u| u.output_tokens).unwrap_or(0)
        );

        Ok(parsed)
    }

    /// Create a messages request builder
    pub fn request_builder(&self) -> MessagesRequestBuilder {
        MessagesRequestBuilder::new(self.model.clone())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }
}

#[async_trait]
impl TextGenerator for ClaudeClient {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let request = self
            .request_builder()
            .system(system)
            .user(prompt)
            .temperature(0.0)
            .build();

        let response = self.messages(request).await?;
        Ok(response.text())
    }
}

fn map_send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_requires_api_key() {
        let config = LlmConfig::default();
        assert!(matches!(ClaudeClient::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_client_base_url_defaults_by_provider() {
        let config = LlmConfig {
            api_key: "k".to_string(),
            provider: LlmProvider::OpenAi,
            ..Default::default()
        };
        let client = ClaudeClient::new(&config).unwrap();
        assert_eq!(client.base_url, "https://api.openai.com/v1");
        assert_eq!(client.provider(), &LlmProvider::OpenAi);

        let config = LlmConfig {
            api_key: "k".to_string(),
            base_url: Some("http://localhost:8080/v1/".to_string()),
            ..Default::default()
        };
        let client = ClaudeClient::new(&config).unwrap();
        assert_eq!(client.base_url, "http://localhost:8080/v1");
        assert_eq!(client.model(), "claude-sonnet-4-20250514");
    }
}
