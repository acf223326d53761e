//! Provider-agnostic types shared across LLM backends.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolResult;

/// Standard User-Agent header for delegate API requests.
pub const USER_AGENT: &str = concat!("delegate/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Config resolution helpers
// ============================================================================

/// Resolves an API key with precedence: config > env.
///
/// # Errors
/// Returns an error if neither the config value nor the env var is set.
pub fn resolve_api_key(
    config_api_key: Option<&str>,
    env_var: &str,
    config_section: &str,
) -> Result<String> {
    if let Some(key) = config_api_key {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    std::env::var(env_var).context(format!(
        "No API key available. Set {env_var} or api_key in [providers.{config_section}]."
    ))
}

/// Resolves a base URL with precedence: env > config > default.
///
/// # Errors
/// Returns an error if the chosen URL does not parse.
pub fn resolve_base_url(
    config_base_url: Option<&str>,
    env_var: &str,
    default_url: &str,
    provider_name: &str,
) -> Result<String> {
    if let Ok(env_url) = std::env::var(env_var) {
        let trimmed = env_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, provider_name)?;
            return Ok(trimmed.to_string());
        }
    }

    if let Some(config_url) = config_base_url {
        let trimmed = config_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, provider_name)?;
            return Ok(trimmed.to_string());
        }
    }

    Ok(default_url.to_string())
}

fn validate_url(url: &str, provider_name: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid {provider_name} base URL: {url}"))?;
    Ok(())
}

/// Content block kinds emitted by streaming APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentBlockType {
    Text,
    ToolUse,
    Reasoning,
}

impl FromStr for ContentBlockType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(Self::Text),
            "tool_use" => Ok(Self::ToolUse),
            "thinking" | "reasoning" => Ok(Self::Reasoning),
            _ => Err(format!("Unknown content block type: {value}")),
        }
    }
}

/// Content block in a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatContentBlock {
    /// Model reasoning. `signature` is required to replay it to Anthropic.
    #[serde(rename = "reasoning")]
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult(ToolResult),
}

/// Message content - either simple text or structured blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ChatContentBlock>),
}

/// A chat message with owned data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    /// Creates an assistant message with content blocks (for tool use).
    pub fn assistant_blocks(blocks: Vec<ChatContentBlock>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Creates a user message with tool results.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        let blocks: Vec<ChatContentBlock> = results
            .into_iter()
            .map(ChatContentBlock::ToolResult)
            .collect();
        Self {
            role: "user".to_string(),
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn blocks(&self) -> &[ChatContentBlock] {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        }
    }

    /// Tool results carried by this message, in order.
    pub fn tool_results_iter(&self) -> impl Iterator<Item = &ToolResult> {
        self.blocks().iter().filter_map(|block| match block {
            ChatContentBlock::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    /// Ids of the tool calls requested by this message, in order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks()
            .iter()
            .filter_map(|block| match block {
                ChatContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Categories of provider errors for consistent error handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection timeout or request timeout
    Timeout,
    /// Failed to parse response (JSON parse error, invalid SSE, etc.)
    Parse,
    /// API-level error returned by the provider (e.g., overloaded, `rate_limit`)
    ApiError,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::HttpStatus => write!(f, "http_status"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Parse => write!(f, "parse"),
            ProviderErrorKind::ApiError => write!(f, "api_error"),
        }
    }
}

/// Structured error from the provider with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Creates an HTTP status error, lifting `error.message` out of a JSON body.
    pub fn http_status(status: u16, body: &str) -> Self {
        if body.is_empty() {
            return Self::new(ProviderErrorKind::HttpStatus, format!("HTTP {status}"));
        }
        if let Ok(json) = serde_json::from_str::<Value>(body)
            && let Some(msg) = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
        {
            return Self {
                kind: ProviderErrorKind::HttpStatus,
                message: format!("HTTP {status}: {msg}"),
                details: Some(body.to_string()),
            };
        }
        Self {
            kind: ProviderErrorKind::HttpStatus,
            message: format!("HTTP {status}"),
            details: Some(body.to_string()),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    /// Creates an API error (from mid-stream error event).
    pub fn api_error(error_type: &str, message: &str) -> Self {
        Self::new(
            ProviderErrorKind::ApiError,
            format!("{error_type}: {message}"),
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Events emitted during streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        model: String,
        usage: Usage,
    },
    /// A content block has started (text, `tool_use`, reasoning)
    ContentBlockStart {
        index: usize,
        block_type: ContentBlockType,
        /// For `tool_use` blocks: the tool use ID
        id: Option<String>,
        /// For `tool_use` blocks: the tool name
        name: Option<String>,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    /// Partial JSON delta for tool input
    InputJsonDelta {
        index: usize,
        partial_json: String,
    },
    ReasoningDelta {
        index: usize,
        reasoning: String,
    },
    ReasoningSignatureDelta {
        index: usize,
        signature: String,
    },
    ContentBlockCompleted {
        index: usize,
    },
    /// Message delta (e.g., `stop_reason` update, final usage)
    MessageDelta {
        stop_reason: Option<String>,
        usage: Option<Usage>,
    },
    MessageCompleted,
    Ping,
    Error {
        error_type: String,
        message: String,
    },
}

/// Boxed stream of provider events.
pub type ProviderStream = BoxStream<'static, ProviderResult<StreamEvent>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_extracts_json_error_message() {
        let err = ProviderError::http_status(
            429,
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"Slow down"}}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::HttpStatus);
        assert_eq!(err.message, "HTTP 429: Slow down");
        assert!(err.details.is_some());

        let plain = ProviderError::http_status(502, "bad gateway");
        assert_eq!(plain.message, "HTTP 502");
        assert_eq!(plain.details.as_deref(), Some("bad gateway"));
    }

    #[test]
    fn content_block_type_parses_thinking_as_reasoning() {
        assert_eq!(
            ContentBlockType::from_str("thinking").unwrap(),
            ContentBlockType::Reasoning
        );
        assert_eq!(
            ContentBlockType::from_str("tool_use").unwrap(),
            ContentBlockType::ToolUse
        );
        assert!(ContentBlockType::from_str("image").is_err());
    }

    #[test]
    fn config_api_key_wins_over_env() {
        let key = resolve_api_key(Some("  from-config "), "DELEGATE_TEST_UNSET_KEY", "anthropic")
            .unwrap();
        assert_eq!(key, "from-config");

        let err = resolve_api_key(None, "DELEGATE_TEST_UNSET_KEY", "anthropic").unwrap_err();
        assert!(err.to_string().contains("[providers.anthropic]"));
    }

    #[test]
    fn base_url_falls_back_to_default_and_validates_config() {
        let url = resolve_base_url(None, "DELEGATE_TEST_UNSET_URL", "https://x.test", "Test")
            .unwrap();
        assert_eq!(url, "https://x.test");
        assert!(
            resolve_base_url(Some("not a url"), "DELEGATE_TEST_UNSET_URL", "https://x.test", "Test")
                .is_err()
        );
    }
}
