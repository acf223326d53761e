//! LLM provider boundary and implementations.

pub mod anthropic;
pub mod completion;
pub mod scripted;
pub mod shared;

use futures_util::future::BoxFuture;

pub use completion::{Completion, ToolCall, consume_stream, create_completion};
pub use scripted::{ScriptedClient, ScriptedTurn};
pub use shared::{
    ChatContentBlock, ChatMessage, ContentBlockType, MessageContent, ProviderError,
    ProviderErrorKind, ProviderResult, ProviderStream, StreamEvent, Usage, resolve_api_key,
    resolve_base_url,
};

use crate::tools::ToolDefinition;

/// One model call.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub system: Option<&'a str>,
    pub tools: &'a [ToolDefinition],
    pub messages: &'a [ChatMessage],
    pub max_tokens: u32,
    /// Extended thinking budget; `None` disables thinking.
    pub thinking_budget: Option<u32>,
}

/// A language model that streams responses.
pub trait ModelClient: Send + Sync {
    /// Starts a streaming call.
    ///
    /// Errors before the first event (HTTP status, connection) are returned
    /// here; errors after that arrive on the stream.
    fn stream<'a>(&'a self, request: ModelRequest<'a>) -> BoxFuture<'a, anyhow::Result<ProviderStream>>;
}
