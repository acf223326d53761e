//! Agent definition and the tool-calling loop.
//!
//! A run alternates between one streaming model call and one round of
//! concurrent tool executions until the model stops asking for tools or the
//! round cap is reached. At most `max_tool_iterations` tool rounds run, so a
//! run makes at most `max_tool_iterations + 1` model calls.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::core::call_tree::{BlockHandle, CallKind};
use crate::core::events::ToolOutput;
use crate::core::job::JobContext;
use crate::core::stream::AgentStreams;
use crate::providers::{
    ChatMessage, Completion, ModelClient, ModelRequest, StreamEvent, ToolCall, consume_stream,
};
use crate::tools::{Tool, ToolContext, ToolDefinition, ToolResult, ToolSet, schema};

/// Final answer used when the model produced no text.
pub const NO_RESPONSE: &str = "No response";

type InstructionsFn = Arc<dyn Fn(&JobContext) -> String + Send + Sync>;

/// System prompt source.
#[derive(Clone)]
pub enum Instructions {
    Static(String),
    /// Built per run from the job.
    Dynamic(InstructionsFn),
}

impl Instructions {
    pub fn resolve(&self, job: &JobContext) -> String {
        match self {
            Instructions::Static(text) => text.clone(),
            Instructions::Dynamic(build) => build(job),
        }
    }
}

impl fmt::Debug for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instructions::Static(text) => f.debug_tuple("Static").field(&text.len()).finish(),
            Instructions::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// Everything one agent run reports into.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub job: JobContext,
    /// Node of the agent being run; tool calls become its children.
    pub node: BlockHandle,
    pub streams: AgentStreams,
}

impl RunContext {
    pub fn new(job: JobContext, node: BlockHandle, streams: AgentStreams) -> Self {
        Self { job, node, streams }
    }
}

/// The final answer did not match the declared output schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputValidationError {
    pub agent: String,
    pub message: String,
    /// The rejected answer.
    pub output: String,
}

impl fmt::Display for OutputValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} returned invalid output: {}", self.agent, self.message)
    }
}

impl std::error::Error for OutputValidationError {}

/// An LLM-backed agent. Immutable once built; `run` may be called
/// concurrently.
pub struct Agent {
    name: String,
    model: String,
    instructions: Instructions,
    tools: ToolSet,
    max_output_tokens: u32,
    reasoning_budget: Option<u32>,
    output_schema: Option<Value>,
    max_tool_iterations: usize,
    tool_timeout: Option<Duration>,
    client: Arc<dyn ModelClient>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tools", &self.tools.names())
            .field("max_tool_iterations", &self.max_tool_iterations)
            .finish_non_exhaustive()
    }
}

pub struct AgentBuilder {
    name: String,
    model: String,
    instructions: Instructions,
    tools: ToolSet,
    max_output_tokens: u32,
    reasoning_budget: Option<u32>,
    output_schema: Option<Value>,
    max_tool_iterations: usize,
    tool_timeout: Option<Duration>,
    client: Arc<dyn ModelClient>,
}

impl AgentBuilder {
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn instructions(mut self, text: impl Into<String>) -> Self {
        self.instructions = Instructions::Static(text.into());
        self
    }

    #[must_use]
    pub fn dynamic_instructions(
        mut self,
        build: impl Fn(&JobContext) -> String + Send + Sync + 'static,
    ) -> Self {
        self.instructions = Instructions::Dynamic(Arc::new(build));
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.register(tool);
        self
    }

    #[must_use]
    pub fn max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    #[must_use]
    pub fn reasoning_budget(mut self, budget: Option<u32>) -> Self {
        self.reasoning_budget = budget;
        self
    }

    #[must_use]
    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn max_tool_iterations(mut self, rounds: usize) -> Self {
        self.max_tool_iterations = rounds;
        self
    }

    #[must_use]
    pub fn tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Applies model, token, thinking, round cap and timeout settings.
    #[must_use]
    pub fn with_config(self, config: &Config) -> Self {
        self.model(config.model.clone())
            .max_output_tokens(config.max_output_tokens)
            .reasoning_budget(config.thinking_budget())
            .max_tool_iterations(config.max_tool_iterations)
            .tool_timeout(config.tool_timeout())
    }

    /// # Errors
    /// Returns an error for an empty name or model, or a non-object output
    /// schema.
    pub fn build(self) -> Result<Agent> {
        if self.name.trim().is_empty() {
            bail!("agent name must not be empty");
        }
        if self.model.trim().is_empty() {
            bail!("agent '{}' has no model", self.name);
        }
        if let Some(schema) = &self.output_schema
            && !schema.is_object()
        {
            bail!("agent '{}' output schema must be a JSON object", self.name);
        }
        Ok(Agent {
            name: self.name,
            model: self.model,
            instructions: self.instructions,
            tools: self.tools,
            max_output_tokens: self.max_output_tokens,
            reasoning_budget: self.reasoning_budget,
            output_schema: self.output_schema,
            max_tool_iterations: self.max_tool_iterations,
            tool_timeout: self.tool_timeout,
            client: self.client,
        })
    }
}

impl Agent {
    pub fn builder(name: impl Into<String>, client: Arc<dyn ModelClient>) -> AgentBuilder {
        let defaults = Config::default();
        AgentBuilder {
            name: name.into(),
            model: defaults.model,
            instructions: Instructions::Static(String::new()),
            tools: ToolSet::new(),
            max_output_tokens: defaults.max_output_tokens,
            reasoning_budget: None,
            output_schema: None,
            max_tool_iterations: Config::DEFAULT_MAX_TOOL_ITERATIONS,
            tool_timeout: None,
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn max_tool_iterations(&self) -> usize {
        self.max_tool_iterations
    }

    fn system_prompt(&self, job: &JobContext) -> String {
        let mut prompt = self.instructions.resolve(job);
        if let Some(schema) = &self.output_schema {
            let rendered = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str("Respond only with a JSON value matching this schema:\n");
            prompt.push_str(&rendered);
        }
        prompt
    }

    /// Runs the tool-calling loop for `input` and returns the final answer.
    ///
    /// # Errors
    /// Model failures propagate as `ProviderError` inside `anyhow::Error`;
    /// an answer violating the output schema yields
    /// [`OutputValidationError`].
    pub async fn run(&self, input: &str, ctx: &RunContext) -> Result<String> {
        let system = self.system_prompt(&ctx.job);
        let definitions = self.tools.definitions();
        let mut messages = vec![ChatMessage::user(input)];
        let mut rounds = 0;

        loop {
            let completion = self
                .call_model(&system, &definitions, &messages, &ctx.streams)
                .await?;

            if !completion.needs_tool_execution() || rounds >= self.max_tool_iterations {
                tracing::debug!(agent = %self.name, rounds, "agent finished");
                return self.finish(completion.text);
            }

            let results = self.execute_tools(&completion.tool_calls, ctx).await;
            messages.push(ChatMessage::assistant_blocks(completion.content));
            messages.push(ChatMessage::tool_results(results));
            rounds += 1;

            if rounds >= self.max_tool_iterations {
                let line = format!("Stopped after {rounds} tool rounds");
                tracing::warn!(agent = %self.name, job_id = %ctx.job.job_id(), "{line}");
                ctx.streams.log.emit(line);
            }
        }
    }

    async fn call_model(
        &self,
        system: &str,
        tools: &[ToolDefinition],
        messages: &[ChatMessage],
        streams: &AgentStreams,
    ) -> Result<Completion> {
        let request = ModelRequest {
            model: &self.model,
            system: Some(system),
            tools,
            messages,
            max_tokens: self.max_output_tokens,
            thinking_budget: self.reasoning_budget,
        };
        let stream = self.client.stream(request).await?;
        let completion = consume_stream(stream, |event| match event {
            StreamEvent::ReasoningDelta { reasoning, .. } => streams.reasoning.delta(reasoning.as_str()),
            StreamEvent::TextDelta { text, .. } => streams.output.delta(text.as_str()),
            StreamEvent::ContentBlockCompleted { .. } => {
                streams.reasoning.end();
                streams.output.end();
            }
            _ => {}
        })
        .await;
        streams.reasoning.end();
        streams.output.end();
        completion
    }

    fn finish(&self, text: String) -> Result<String> {
        let text = if text.trim().is_empty() {
            NO_RESPONSE.to_string()
        } else {
            text
        };
        if let Some(declared) = &self.output_schema {
            self.validate_output(declared, &text)?;
        }
        Ok(text)
    }

    fn validate_output(&self, declared: &Value, text: &str) -> Result<(), OutputValidationError> {
        let rejected = |message: String| OutputValidationError {
            agent: self.name.clone(),
            message,
            output: text.to_string(),
        };
        let value: Value = serde_json::from_str(strip_code_fence(text))
            .map_err(|e| rejected(format!("not valid JSON: {e}")))?;
        schema::validate(declared, &value).map_err(|errors| rejected(schema::describe(&errors)))
    }

    /// Runs every call concurrently. Results come back in request order.
    async fn execute_tools(&self, calls: &[ToolCall], ctx: &RunContext) -> Vec<ToolResult> {
        let mut join_set = JoinSet::new();
        let mut nodes = Vec::with_capacity(calls.len());

        for (idx, call) in calls.iter().enumerate() {
            let tool = self.tools.get(&call.name).cloned();
            let kind = match &tool {
                Some(tool) if tool.kind().is_agent() => CallKind::Agent,
                _ => CallKind::Tool,
            };
            let node = ctx.node.add_child(kind, &call.name, Some(call.input.clone()));
            ctx.streams.call.emit(node.id());
            tracing::debug!(agent = %self.name, tool = %call.name, id = %call.id, "tool started");

            let runnable = match (tool, &call.malformed) {
                (_, Some(reason)) => Err(ToolOutput::failure_with_details(
                    "invalid_json",
                    format!("Invalid JSON arguments for tool '{}'", call.name),
                    reason.clone(),
                )),
                (None, None) => Err(self.tools.unknown_tool_output(&call.name)),
                (Some(tool), None) => Ok(tool),
            };
            let tool_ctx = ToolContext::new(ctx.job.clone(), node.clone(), self.tool_timeout);
            let input = call.input.clone();
            nodes.push(node);

            join_set.spawn(async move {
                let output = match runnable {
                    Ok(tool) => AssertUnwindSafe(tool.execute(&input, &tool_ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            ToolOutput::failure(
                                "panic",
                                "Tool execution panicked",
                                Some(panic_message(panic.as_ref())),
                            )
                        }),
                    Err(output) => output,
                };
                (idx, output)
            });
        }

        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, output)) => {
                    let output = record_outcome(&nodes[idx], &ctx.job, output);
                    results[idx] = Some(ToolResult::from_output(calls[idx].id.clone(), &output));
                }
                Err(e) => tracing::warn!(agent = %self.name, "tool task failed to join: {e}"),
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    let output = record_outcome(
                        &nodes[idx],
                        &ctx.job,
                        ToolOutput::failure("panic", "Tool task was cancelled", None),
                    );
                    ToolResult::from_output(calls[idx].id.clone(), &output)
                })
            })
            .collect()
    }
}

/// Moves files to the job's sinks and settles the call node.
fn record_outcome(node: &BlockHandle, job: &JobContext, mut output: ToolOutput) -> ToolOutput {
    for file in output.take_files() {
        node.add_child(CallKind::File, &file.filename, None).complete(None);
        job.attach_file(file);
    }
    match output.error_info() {
        None => {
            node.complete(Some(output.to_value()));
        }
        Some((_, message)) => {
            node.set_output(output.to_value());
            node.fail(message);
        }
    }
    output
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Strips a surrounding Markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.strip_suffix("```").unwrap_or(body);
    match body.split_once('\n') {
        Some((lang, rest)) if !lang.contains('{') && !lang.contains('[') => rest.trim(),
        _ => body.trim(),
    }
}
