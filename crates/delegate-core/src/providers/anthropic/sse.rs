use std::pin::Pin;
use std::task::{Context, Poll};

use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::providers::shared::{
    ContentBlockType, ProviderError, ProviderErrorKind, ProviderResult, StreamEvent, Usage,
};

/// SSE parser that converts a byte stream into `StreamEvent`s.
pub struct SseParser<S> {
    inner: EventStream<S>,
}

impl<S> SseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
        }
    }
}

impl<S, E> Stream for SseParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ProviderResult<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
                Poll::Ready(Some(parse_sse_event_fields(&event.event, &event.data)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(ProviderError::new(
                ProviderErrorKind::Parse,
                format!("SSE stream error: {e}"),
            )))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn parse_data<T: DeserializeOwned>(event_type: &str, data: &str) -> ProviderResult<T> {
    if data.trim().is_empty() {
        return Err(ProviderError::new(
            ProviderErrorKind::Parse,
            format!("Missing data for {event_type}"),
        ));
    }
    serde_json::from_str(data).map_err(|err| {
        ProviderError::new(
            ProviderErrorKind::Parse,
            format!("Failed to parse {event_type}: {err}"),
        )
    })
}

fn parse_sse_event_fields(event_type: &str, data: &str) -> ProviderResult<StreamEvent> {
    match event_type {
        "ping" => Ok(StreamEvent::Ping),
        "message_stop" => Ok(StreamEvent::MessageCompleted),
        "message_start" => {
            let parsed: SseMessageStart = parse_data(event_type, data)?;
            Ok(StreamEvent::MessageStart {
                model: parsed.message.model,
                usage: parsed.message.usage.into(),
            })
        }
        "content_block_start" => {
            let parsed: SseContentBlockStart = parse_data(event_type, data)?;
            let block_type = parsed
                .content_block
                .block_type
                .parse::<ContentBlockType>()
                .map_err(|e| ProviderError::new(ProviderErrorKind::Parse, e))?;
            Ok(StreamEvent::ContentBlockStart {
                index: parsed.index,
                block_type,
                id: parsed.content_block.id,
                name: parsed.content_block.name,
            })
        }
        "content_block_delta" => {
            let parsed: SseContentBlockDelta = parse_data(event_type, data)?;
            let index = parsed.index;
            let delta = parsed.delta;
            match delta.delta_type.as_str() {
                "text_delta" => Ok(StreamEvent::TextDelta {
                    index,
                    text: delta.text.unwrap_or_default(),
                }),
                "input_json_delta" => Ok(StreamEvent::InputJsonDelta {
                    index,
                    partial_json: delta.partial_json.unwrap_or_default(),
                }),
                "thinking_delta" => Ok(StreamEvent::ReasoningDelta {
                    index,
                    reasoning: delta.thinking.unwrap_or_default(),
                }),
                "signature_delta" => Ok(StreamEvent::ReasoningSignatureDelta {
                    index,
                    signature: delta.signature.unwrap_or_default(),
                }),
                other => Err(ProviderError::new(
                    ProviderErrorKind::Parse,
                    format!("Unknown delta type: {other}"),
                )),
            }
        }
        "content_block_stop" => {
            let parsed: SseIndexOnly = parse_data(event_type, data)?;
            Ok(StreamEvent::ContentBlockCompleted {
                index: parsed.index,
            })
        }
        "message_delta" => {
            let parsed: SseMessageDelta = parse_data(event_type, data)?;
            Ok(StreamEvent::MessageDelta {
                stop_reason: parsed.delta.stop_reason,
                usage: parsed.usage.map(Into::into),
            })
        }
        "error" => {
            let parsed: SseError = parse_data(event_type, data)?;
            Ok(StreamEvent::Error {
                error_type: parsed.error.error_type,
                message: parsed.error.message,
            })
        }
        other => Err(ProviderError::new(
            ProviderErrorKind::Parse,
            format!("Unknown SSE event type: {other}"),
        )),
    }
}

// === SSE Response Structures ===

#[derive(Debug, Deserialize)]
struct SseMessageStart {
    message: SseMessageInfo,
}

#[derive(Debug, Deserialize)]
struct SseMessageInfo {
    model: String,
    #[serde(default)]
    usage: SseUsage,
}

#[derive(Debug, Default, Deserialize)]
struct SseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl From<SseUsage> for Usage {
    fn from(u: SseUsage) -> Self {
        Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SseContentBlockStart {
    index: usize,
    content_block: SseContentBlock,
}

#[derive(Debug, Deserialize)]
struct SseContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseContentBlockDelta {
    index: usize,
    delta: SseDelta,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseIndexOnly {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct SseMessageDelta {
    delta: SseMessageDeltaInner,
    #[serde(default)]
    usage: Option<SseUsage>,
}

#[derive(Debug, Deserialize)]
struct SseMessageDeltaInner {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    error: SseErrorInfo,
}

#[derive(Debug, Deserialize)]
struct SseErrorInfo {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
