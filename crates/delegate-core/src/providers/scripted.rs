//! Deterministic model client that replays scripted turns.
//!
//! Each call pops the next turn and replays it as provider stream events, so
//! the agent loop sees exactly what a real provider would send. Tool call ids
//! are numbered per client (`call_1`, `call_2`, ...) and never repeat.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde_json::Value;

use super::shared::{ChatMessage, ContentBlockType, ProviderError, ProviderStream, StreamEvent};
use super::{ModelClient, ModelRequest};

/// A single scripted tool call.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub name: String,
    /// Raw argument JSON, streamed as-is.
    pub input_json: String,
}

/// One scripted model response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub reasoning: Option<String>,
    pub text: Option<String>,
    pub calls: Vec<ScriptedCall>,
    /// Fails the call before any event with this API error.
    pub error: Option<String>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(name: &str, input: &Value) -> Self {
        Self::default().with_call(name, input)
    }

    /// A call whose arguments are not valid JSON.
    pub fn malformed_call(name: &str, raw: &str) -> Self {
        Self {
            calls: vec![ScriptedCall {
                name: name.to_string(),
                input_json: raw.to_string(),
            }],
            ..Self::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_call(mut self, name: &str, input: &Value) -> Self {
        self.calls.push(ScriptedCall {
            name: name.to_string(),
            input_json: input.to_string(),
        });
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    fn into_events(self, next_id: impl Fn() -> String) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::MessageStart {
            model: "scripted".to_string(),
            usage: super::Usage::default(),
        }];
        let mut index = 0;
        if let Some(reasoning) = self.reasoning {
            events.push(StreamEvent::ContentBlockStart {
                index,
                block_type: ContentBlockType::Reasoning,
                id: None,
                name: None,
            });
            events.push(StreamEvent::ReasoningDelta { index, reasoning });
            events.push(StreamEvent::ContentBlockCompleted { index });
            index += 1;
        }
        if let Some(text) = self.text {
            events.push(StreamEvent::ContentBlockStart {
                index,
                block_type: ContentBlockType::Text,
                id: None,
                name: None,
            });
            events.push(StreamEvent::TextDelta { index, text });
            events.push(StreamEvent::ContentBlockCompleted { index });
            index += 1;
        }
        let stop_reason = if self.calls.is_empty() {
            "end_turn"
        } else {
            "tool_use"
        };
        for call in self.calls {
            events.push(StreamEvent::ContentBlockStart {
                index,
                block_type: ContentBlockType::ToolUse,
                id: Some(next_id()),
                name: Some(call.name),
            });
            events.push(StreamEvent::InputJsonDelta {
                index,
                partial_json: call.input_json,
            });
            events.push(StreamEvent::ContentBlockCompleted { index });
            index += 1;
        }
        events.push(StreamEvent::MessageDelta {
            stop_reason: Some(stop_reason.to_string()),
            usage: None,
        });
        events.push(StreamEvent::MessageCompleted);
        events
    }
}

/// A request as seen by the scripted client.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub system: Option<String>,
    pub tool_names: Vec<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub thinking_budget: Option<u32>,
}

#[derive(Debug)]
enum Script {
    Queue(Mutex<VecDeque<ScriptedTurn>>),
    Repeat(ScriptedTurn),
}

/// Model client that replays a fixed script.
#[derive(Debug)]
pub struct ScriptedClient {
    script: Script,
    requests: Mutex<Vec<RecordedRequest>>,
    next_call: AtomicUsize,
}

impl ScriptedClient {
    /// Replays `turns` in order; calls past the end fail.
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self::with_script(Script::Queue(Mutex::new(turns.into_iter().collect())))
    }

    /// Answers every call with `turn`.
    pub fn repeating(turn: ScriptedTurn) -> Self {
        Self::with_script(Script::Repeat(turn))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
            next_call: AtomicUsize::new(1),
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        match &self.script {
            Script::Queue(turns) => turns
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop_front(),
            Script::Repeat(turn) => Some(turn.clone()),
        }
    }

    fn record(&self, request: &ModelRequest<'_>) {
        let recorded = RecordedRequest {
            model: request.model.to_string(),
            system: request.system.map(str::to_string),
            tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
            messages: request.messages.to_vec(),
            max_tokens: request.max_tokens,
            thinking_budget: request.thinking_budget,
        };
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(recorded);
    }
}

impl ModelClient for ScriptedClient {
    fn stream<'a>(&'a self, request: ModelRequest<'a>) -> BoxFuture<'a, Result<ProviderStream>> {
        self.record(&request);
        let turn = self.next_turn();
        Box::pin(async move {
            let turn = turn.ok_or_else(|| anyhow!("scripted client has no more turns"))?;
            if let Some(message) = turn.error {
                return Err(ProviderError::api_error("scripted_error", &message).into());
            }
            let events = turn.into_events(|| {
                format!("call_{}", self.next_call.fetch_add(1, Ordering::SeqCst))
            });
            Ok(futures_util::stream::iter(events.into_iter().map(Ok)).boxed())
        })
    }
}
