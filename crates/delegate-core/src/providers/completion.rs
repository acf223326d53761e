//! Assembles a provider event stream into one assistant response.

use futures_util::StreamExt;
use serde_json::{Value, json};

use super::shared::{
    ChatContentBlock, ContentBlockType, ProviderError, ProviderStream, StreamEvent, Usage,
};
use super::{ModelClient, ModelRequest};

const MALFORMED_PREVIEW_CHARS: usize = 500;

/// Builder for accumulating tool use data from streaming events.
#[derive(Debug, Clone)]
pub struct ToolUseBuilder {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub input_json: String,
}

impl ToolUseBuilder {
    /// Parses the accumulated JSON. An empty buffer means no arguments.
    ///
    /// # Errors
    /// Returns the parse error when the JSON is malformed.
    pub fn finalize(self) -> Result<ToolCall, (Self, serde_json::Error)> {
        let raw = self.input_json.trim();
        let parsed = if raw.is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str(raw)
        };
        match parsed {
            Ok(input) => Ok(ToolCall {
                id: self.id,
                name: self.name,
                input,
                malformed: None,
            }),
            Err(e) => Err((self, e)),
        }
    }
}

/// Builder for accumulating thinking block data from streaming events.
#[derive(Debug, Clone, Default)]
pub struct ThinkingBuilder {
    pub index: usize,
    pub text: String,
    pub signature: String,
}

/// Tool call requested by the model.
///
/// When the streamed arguments were not valid JSON, `input` is
/// `{"_raw_malformed": <raw>}` and `malformed` holds the parse error.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub malformed: Option<String>,
}

/// Builder for accumulating all assistant turn content from streaming events.
#[derive(Debug, Default)]
pub struct AssistantTurnBuilder {
    pub thinking_blocks: Vec<ThinkingBuilder>,
    pub text: String,
    pub tool_uses: Vec<ToolUseBuilder>,
}

impl AssistantTurnBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_tool_use_mut(&mut self, index: usize) -> Option<&mut ToolUseBuilder> {
        self.tool_uses.iter_mut().find(|t| t.index == index)
    }

    pub fn find_thinking_mut(&mut self, index: usize) -> Option<&mut ThinkingBuilder> {
        self.thinking_blocks.iter_mut().find(|t| t.index == index)
    }

    /// Finalizes tool calls and builds the assistant content blocks
    /// (reasoning first, then text, then tool calls).
    fn finish(self) -> (Vec<ChatContentBlock>, Vec<ToolCall>, String) {
        let tool_calls: Vec<ToolCall> = self
            .tool_uses
            .into_iter()
            .map(|builder| match builder.finalize() {
                Ok(call) => call,
                Err((builder, e)) => {
                    tracing::warn!(tool = %builder.name, "invalid tool input JSON: {e}");
                    ToolCall {
                        id: builder.id,
                        name: builder.name,
                        input: json!({ "_raw_malformed": truncate(&builder.input_json) }),
                        malformed: Some(e.to_string()),
                    }
                }
            })
            .collect();

        let mut blocks = Vec::with_capacity(self.thinking_blocks.len() + 1 + tool_calls.len());
        for tb in self.thinking_blocks {
            if tb.text.is_empty() {
                continue;
            }
            blocks.push(ChatContentBlock::Reasoning {
                text: tb.text,
                signature: (!tb.signature.is_empty()).then_some(tb.signature),
            });
        }
        if !self.text.is_empty() {
            blocks.push(ChatContentBlock::Text {
                text: self.text.clone(),
            });
        }
        for call in &tool_calls {
            blocks.push(ChatContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
        }
        (blocks, tool_calls, self.text)
    }
}

fn truncate(s: &str) -> String {
    match s.char_indices().nth(MALFORMED_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// One complete model response.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub stop_reason: Option<String>,
    /// Assistant content blocks, ready to append to the conversation.
    pub content: Vec<ChatContentBlock>,
    pub tool_calls: Vec<ToolCall>,
    /// Concatenated text output.
    pub text: String,
    pub usage: Usage,
}

impl Completion {
    /// True when the model stopped to have tools executed.
    pub fn needs_tool_execution(&self) -> bool {
        self.stop_reason.as_deref() == Some("tool_use") && !self.tool_calls.is_empty()
    }
}

/// Drains a provider stream into a [`Completion`], handing every event to
/// `on_event` as it arrives.
///
/// # Errors
/// Returns the stream's `ProviderError` (inside `anyhow::Error`) on transport
/// failures and on an `error` event.
pub async fn consume_stream(
    mut stream: ProviderStream,
    mut on_event: impl FnMut(&StreamEvent),
) -> anyhow::Result<Completion> {
    let mut turn = AssistantTurnBuilder::new();
    let mut stop_reason = None;
    let mut usage = Usage::default();

    while let Some(event) = stream.next().await {
        let event = event.map_err(anyhow::Error::new)?;
        on_event(&event);
        match event {
            StreamEvent::TextDelta { text, .. } => turn.text.push_str(&text),
            StreamEvent::ContentBlockStart {
                index,
                block_type: ContentBlockType::ToolUse,
                id,
                name,
            } => turn.tool_uses.push(ToolUseBuilder {
                index,
                id: id.unwrap_or_default(),
                name: name.unwrap_or_default(),
                input_json: String::new(),
            }),
            StreamEvent::ContentBlockStart {
                index,
                block_type: ContentBlockType::Reasoning,
                ..
            } => turn.thinking_blocks.push(ThinkingBuilder {
                index,
                ..ThinkingBuilder::default()
            }),
            StreamEvent::InputJsonDelta {
                index,
                partial_json,
            } => {
                if let Some(tu) = turn.find_tool_use_mut(index) {
                    tu.input_json.push_str(&partial_json);
                }
            }
            StreamEvent::ReasoningDelta { index, reasoning } => {
                if let Some(tb) = turn.find_thinking_mut(index) {
                    tb.text.push_str(&reasoning);
                }
            }
            StreamEvent::ReasoningSignatureDelta { index, signature } => {
                if let Some(tb) = turn.find_thinking_mut(index) {
                    tb.signature.push_str(&signature);
                }
            }
            StreamEvent::MessageStart { usage: start, .. } => usage.add(start),
            StreamEvent::MessageDelta {
                stop_reason: reason,
                usage: delta,
            } => {
                if reason.is_some() {
                    stop_reason = reason;
                }
                if let Some(delta) = delta {
                    usage.output_tokens = delta.output_tokens.max(usage.output_tokens);
                }
            }
            StreamEvent::Error {
                error_type,
                message,
            } => {
                return Err(ProviderError::api_error(&error_type, &message).into());
            }
            _ => {}
        }
    }

    let (content, tool_calls, text) = turn.finish();
    Ok(Completion {
        stop_reason,
        content,
        tool_calls,
        text,
        usage,
    })
}

/// Non-streaming completion built on the same stream consumer.
///
/// # Errors
/// Returns the provider error when the request or the stream fails.
pub async fn create_completion(
    client: &dyn ModelClient,
    request: ModelRequest<'_>,
) -> anyhow::Result<Completion> {
    let stream = client.stream(request).await?;
    consume_stream(stream, |_| {}).await
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;
    use crate::providers::ProviderErrorKind;

    fn events(events: Vec<StreamEvent>) -> ProviderStream {
        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    fn tool_start(index: usize, id: &str, name: &str) -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index,
            block_type: ContentBlockType::ToolUse,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
        }
    }

    #[tokio::test]
    async fn assembles_text_reasoning_and_tool_calls() {
        let stream = events(vec![
            StreamEvent::ContentBlockStart {
                index: 0,
                block_type: ContentBlockType::Reasoning,
                id: None,
                name: None,
            },
            StreamEvent::ReasoningDelta {
                index: 0,
                reasoning: "adding".to_string(),
            },
            StreamEvent::ReasoningSignatureDelta {
                index: 0,
                signature: "sig".to_string(),
            },
            StreamEvent::TextDelta {
                index: 1,
                text: "Let me add.".to_string(),
            },
            tool_start(2, "toolu_1", "add_numbers"),
            StreamEvent::InputJsonDelta {
                index: 2,
                partial_json: "{\"a\": 2,".to_string(),
            },
            StreamEvent::InputJsonDelta {
                index: 2,
                partial_json: " \"b\": 3}".to_string(),
            },
            StreamEvent::MessageDelta {
                stop_reason: Some("tool_use".to_string()),
                usage: None,
            },
        ]);

        let mut seen = 0;
        let completion = consume_stream(stream, |_| seen += 1).await.unwrap();

        assert_eq!(seen, 8);
        assert!(completion.needs_tool_execution());
        assert_eq!(completion.text, "Let me add.");
        assert_eq!(
            completion.tool_calls,
            vec![ToolCall {
                id: "toolu_1".to_string(),
                name: "add_numbers".to_string(),
                input: json!({"a": 2, "b": 3}),
                malformed: None,
            }]
        );
        assert_eq!(
            completion.content[0],
            ChatContentBlock::Reasoning {
                text: "adding".to_string(),
                signature: Some("sig".to_string()),
            }
        );
        assert_eq!(completion.content.len(), 3);
    }

    #[tokio::test]
    async fn malformed_arguments_are_kept_raw() {
        let stream = events(vec![
            tool_start(0, "toolu_1", "lookup"),
            StreamEvent::InputJsonDelta {
                index: 0,
                partial_json: "{\"q\": ".to_string(),
            },
            tool_start(1, "toolu_2", "now"),
            StreamEvent::MessageDelta {
                stop_reason: Some("tool_use".to_string()),
                usage: None,
            },
        ]);

        let completion = consume_stream(stream, |_| {}).await.unwrap();
        assert_eq!(completion.tool_calls[0].input, json!({"_raw_malformed": "{\"q\": "}));
        assert!(completion.tool_calls[0].malformed.is_some());
        assert_eq!(completion.tool_calls[1].input, json!({}));
        assert!(completion.tool_calls[1].malformed.is_none());
    }

    #[tokio::test]
    async fn error_event_becomes_provider_error() {
        let stream = events(vec![StreamEvent::Error {
            error_type: "overloaded_error".to_string(),
            message: "busy".to_string(),
        }]);

        let err = consume_stream(stream, |_| {}).await.unwrap_err();
        let provider = err.downcast_ref::<ProviderError>().unwrap();
        assert_eq!(provider.kind, ProviderErrorKind::ApiError);
        assert_eq!(provider.message, "overloaded_error: busy");
    }

    #[tokio::test]
    async fn end_turn_without_tools_does_not_need_execution() {
        let stream = events(vec![
            StreamEvent::TextDelta {
                index: 0,
                text: "5".to_string(),
            },
            StreamEvent::MessageDelta {
                stop_reason: Some("end_turn".to_string()),
                usage: Some(Usage {
                    input_tokens: 0,
                    output_tokens: 3,
                }),
            },
            StreamEvent::MessageCompleted,
        ]);

        let completion = consume_stream(stream, |_| {}).await.unwrap();
        assert!(!completion.needs_tool_execution());
        assert_eq!(completion.usage.output_tokens, 3);
        assert_eq!(
            completion.content,
            vec![ChatContentBlock::Text {
                text: "5".to_string()
            }]
        );
    }
}
