//! Anthropic API key provider (Messages API).

use anyhow::Result;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;

use super::sse::SseParser;
use super::types::{ApiMessage, ApiToolDef, StreamingMessagesRequest, SystemBlock, ThinkingConfig};
use crate::config::AnthropicProviderConfig;
use crate::providers::shared::{
    ProviderError, ProviderErrorKind, ProviderStream, USER_AGENT, resolve_api_key,
    resolve_base_url,
};
use crate::providers::{ModelClient, ModelRequest};

/// Default base URL for the Anthropic API.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const API_VERSION: &str = "2023-06-01";
const BETA_HEADER: &str = "fine-grained-tool-streaming-2025-05-14,interleaved-thinking-2025-05-14";

/// Connection settings for the Anthropic client.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
}

impl AnthropicConfig {
    /// Resolves settings from config and environment.
    ///
    /// API key: config, then `ANTHROPIC_API_KEY`.
    /// Base URL: `ANTHROPIC_BASE_URL`, then config, then the public endpoint.
    ///
    /// # Errors
    /// Returns an error if no API key is available or the base URL is invalid.
    pub fn from_env(config: &AnthropicProviderConfig) -> Result<Self> {
        let api_key = resolve_api_key(config.api_key.as_deref(), "ANTHROPIC_API_KEY", "anthropic")?;
        let base_url = resolve_base_url(
            config.base_url.as_deref(),
            "ANTHROPIC_BASE_URL",
            DEFAULT_BASE_URL,
            "Anthropic",
        )?;
        Ok(Self { api_key, base_url })
    }
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    config: AnthropicConfig,
    http: reqwest::Client,
}

impl AnthropicClient {
    /// Creates a new Anthropic client.
    ///
    /// # Panics
    /// In test builds, panics if `base_url` is the production API so tests
    /// never reach the network by accident.
    pub fn new(config: AnthropicConfig) -> Self {
        #[cfg(test)]
        assert!(
            config.base_url != DEFAULT_BASE_URL,
            "Tests must not use the production Anthropic API; point base_url at a mock server"
        );

        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn send(&self, request: ModelRequest<'_>) -> Result<ProviderStream> {
        let body = StreamingMessagesRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .iter()
                .map(ApiMessage::from_chat_message)
                .collect(),
            tools: (!request.tools.is_empty())
                .then(|| request.tools.iter().map(ApiToolDef::from).collect()),
            system: request
                .system
                .filter(|s| !s.trim().is_empty())
                .map(|s| vec![SystemBlock::with_cache_control(s)]),
            thinking: request.thinking_budget.map(ThinkingConfig::enabled),
            stream: true,
        };

        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        tracing::debug!(model = request.model, messages = request.messages.len(), "anthropic request");

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .header("user-agent", USER_AGENT)
            .header("anthropic-version", API_VERSION)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-beta", BETA_HEADER)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http_status(status.as_u16(), &error_body).into());
        }

        Ok(SseParser::new(response.bytes_stream()).boxed())
    }
}

impl ModelClient for AnthropicClient {
    fn stream<'a>(&'a self, request: ModelRequest<'a>) -> BoxFuture<'a, Result<ProviderStream>> {
        Box::pin(self.send(request))
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::timeout(format!("Connection failed: {e}"))
    } else if e.is_request() {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Request error: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Network error: {e}"))
    }
}
