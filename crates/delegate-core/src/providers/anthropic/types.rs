use serde::Serialize;
use serde_json::Value;

use crate::providers::shared::{ChatContentBlock, ChatMessage, MessageContent};
use crate::tools::ToolDefinition;

// === API Request Types ===

/// Thinking configuration for extended thinking feature.
#[derive(Debug, Serialize)]
pub(crate) struct ThinkingConfig {
    #[serde(rename = "type")]
    thinking_type: &'static str,
    budget_tokens: u32,
}

impl ThinkingConfig {
    pub(crate) fn enabled(budget_tokens: u32) -> Self {
        Self {
            thinking_type: "enabled",
            budget_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamingMessagesRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) max_tokens: u32,
    pub(crate) messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) tools: Option<Vec<ApiToolDef<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) system: Option<Vec<SystemBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) thinking: Option<ThinkingConfig>,
    pub(crate) stream: bool,
}

/// System message block with cache control.
#[derive(Debug, Serialize)]
pub(crate) struct SystemBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

impl SystemBlock {
    pub(crate) fn with_cache_control(text: impl Into<String>) -> Self {
        Self {
            block_type: "text",
            text: text.into(),
            cache_control: Some(CacheControl::ephemeral()),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CacheControl {
    #[serde(rename = "type")]
    cache_type: &'static str,
}

impl CacheControl {
    pub(crate) fn ephemeral() -> Self {
        Self {
            cache_type: "ephemeral",
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiToolDef<'a> {
    pub(crate) name: &'a str,
    pub(crate) description: &'a str,
    pub(crate) input_schema: &'a Value,
}

impl<'a> From<&'a ToolDefinition> for ApiToolDef<'a> {
    fn from(def: &'a ToolDefinition) -> Self {
        Self {
            name: &def.name,
            description: &def.description,
            input_schema: &def.input_schema,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiMessage {
    pub(crate) role: String,
    pub(crate) content: ApiMessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum ApiMessageContent {
    Text(String),
    Blocks(Vec<ApiContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum ApiContentBlock {
    #[serde(rename = "thinking")]
    Thinking { thinking: String, signature: String },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ApiMessage {
    /// Converts a `ChatMessage` to the Messages API shape.
    ///
    /// Reasoning without a signature cannot be replayed, so it is sent back
    /// as text wrapped in `<thinking>` tags.
    pub(crate) fn from_chat_message(msg: &ChatMessage) -> Self {
        let content = match &msg.content {
            MessageContent::Text(text) => ApiMessageContent::Text(text.clone()),
            MessageContent::Blocks(blocks) => ApiMessageContent::Blocks(
                blocks
                    .iter()
                    .filter_map(|block| match block {
                        ChatContentBlock::Reasoning { text, signature } => match signature {
                            Some(signature) if !signature.is_empty() => {
                                Some(ApiContentBlock::Thinking {
                                    thinking: text.clone(),
                                    signature: signature.clone(),
                                })
                            }
                            _ if text.is_empty() => None,
                            _ => Some(ApiContentBlock::Text {
                                text: format!("<thinking>\n{text}\n</thinking>"),
                            }),
                        },
                        ChatContentBlock::Text { text } => {
                            Some(ApiContentBlock::Text { text: text.clone() })
                        }
                        ChatContentBlock::ToolUse { id, name, input } => {
                            Some(ApiContentBlock::ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            })
                        }
                        ChatContentBlock::ToolResult(result) => Some(ApiContentBlock::ToolResult {
                            tool_use_id: result.tool_use_id.clone(),
                            content: result.content.clone(),
                            is_error: result.is_error,
                            cache_control: None,
                        }),
                    })
                    .collect(),
            ),
        };
        ApiMessage {
            role: msg.role.clone(),
            content,
        }
    }
}
