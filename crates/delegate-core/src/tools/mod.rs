//! Tool system for agentic capabilities.
//!
//! A [`Tool`] is one of three kinds: a typed function, an SDK tool described
//! by raw provider JSON, or a nested agent. [`ToolSet`] holds the tools an
//! agent may call and resolves names case-insensitively.

pub mod nested;
pub mod schema;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::agent::Agent;
use crate::core::call_tree::BlockHandle;
use crate::core::events::{FileOutput, ToolOutput};
use crate::core::job::JobContext;

/// Tool definition as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "parameters")]
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Result of executing a tool, as sent back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn from_output(tool_use_id: String, output: &ToolOutput) -> Self {
        Self {
            tool_use_id,
            content: output.to_json_string(),
            is_error: !output.is_ok(),
        }
    }
}

/// Everything a tool can reach while it runs.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub job: JobContext,
    /// The call node representing this execution.
    pub node: BlockHandle,
    pub timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(job: JobContext, node: BlockHandle, timeout: Option<Duration>) -> Self {
        Self { job, node, timeout }
    }

    /// Adds a progress line to this call's timeline.
    pub fn log(&self, line: impl Into<String>) {
        self.node.log(line);
    }

    /// Delivers a file to the job's output targets.
    pub fn attach_file(&self, file: FileOutput) {
        self.job.attach_file(file);
    }
}

/// Async tool handler function.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send>>;
pub type ToolHandler = Arc<dyn Fn(&Value, &ToolContext) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
pub enum ToolKind {
    /// Typed handler; input is schema-checked before it is called.
    Function(ToolHandler),
    /// Handler receiving raw JSON from a provider-defined tool.
    Sdk(ToolHandler),
    /// Nested agent run with a single `input` string.
    Agent(Arc<Agent>),
}

impl ToolKind {
    pub fn is_agent(&self) -> bool {
        matches!(self, ToolKind::Agent(_))
    }
}

#[derive(Clone)]
pub struct Tool {
    definition: ToolDefinition,
    kind: ToolKind,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            ToolKind::Function(_) => "function",
            ToolKind::Sdk(_) => "sdk",
            ToolKind::Agent(_) => "agent",
        };
        f.debug_struct("Tool")
            .field("name", &self.definition.name)
            .field("kind", &kind)
            .finish()
    }
}

impl Tool {
    /// Builds a function tool with a typed input.
    ///
    /// The input is validated against `input_schema` and then deserialized
    /// into `I`; either failure yields an `invalid_input` output without
    /// calling `handler`.
    pub fn function<I, F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(I, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        let definition = ToolDefinition::new(name, description, input_schema);
        let declared = definition.input_schema.clone();
        let handler: ToolHandler = Arc::new(move |input: &Value, ctx: &ToolContext| -> ToolFuture {
            if let Err(errors) = schema::validate(&declared, input) {
                let output = ToolOutput::failure_with_details(
                    "invalid_input",
                    "Input does not match the tool schema",
                    schema::describe(&errors),
                );
                return Box::pin(async move { Ok(output) });
            }
            match serde_json::from_value::<I>(input.clone()) {
                Ok(typed) => Box::pin(handler(typed, ctx.clone())),
                Err(e) => {
                    let output = ToolOutput::failure_with_details(
                        "invalid_input",
                        "Input could not be decoded",
                        e.to_string(),
                    );
                    Box::pin(async move { Ok(output) })
                }
            }
        });
        Self {
            definition,
            kind: ToolKind::Function(handler),
        }
    }

    /// Builds a tool from a raw provider definition such as
    /// `{"name": .., "description": .., "input_schema": {..}}`
    /// (`parameters` is accepted in place of `input_schema`).
    ///
    /// # Errors
    /// Returns an error if the definition is not an object with a name and
    /// an object schema.
    pub fn sdk(raw: Value, handler: ToolHandler) -> Result<Self> {
        let definition: ToolDefinition =
            serde_json::from_value(raw).context("invalid SDK tool definition")?;
        if definition.name.trim().is_empty() {
            bail!("SDK tool definition has an empty name");
        }
        if !definition.input_schema.is_object() {
            bail!("SDK tool '{}' must declare an object schema", definition.name);
        }
        Ok(Self {
            definition,
            kind: ToolKind::Sdk(handler),
        })
    }

    /// Exposes `agent` as a tool taking `{"input": string}`.
    pub fn agent(agent: Arc<Agent>, description: impl Into<String>) -> Self {
        let definition = ToolDefinition::new(
            agent.name(),
            description,
            json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "The task for the agent, in plain language"
                    }
                },
                "required": ["input"]
            }),
        );
        Self {
            definition,
            kind: ToolKind::Agent(agent),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    pub fn kind(&self) -> &ToolKind {
        &self.kind
    }

    /// Runs the tool.
    ///
    /// A handler returning `Err` is reported as a bare `{"error": ..}`
    /// failure. The context timeout applies to function and SDK tools only.
    pub async fn execute(&self, input: &Value, ctx: &ToolContext) -> ToolOutput {
        let handler = match &self.kind {
            ToolKind::Agent(agent) => return nested::execute(agent, input, ctx).await,
            ToolKind::Function(handler) | ToolKind::Sdk(handler) => handler,
        };

        let future = handler(input, ctx);
        let result = match ctx.timeout {
            Some(limit) => match tokio::time::timeout(limit, future).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    tracing::warn!(tool = %self.name(), "tool timed out");
                    return ToolOutput::failure(
                        "timeout",
                        format!("Tool execution timed out after {} seconds", limit.as_secs()),
                        Some("Consider breaking up large tasks".to_string()),
                    );
                }
            },
            None => future.await,
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(tool = %self.name(), "tool failed: {e:#}");
            ToolOutput::error(format!("{e:#}"))
        })
    }
}

/// Tools available to one agent.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<Tool>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.register(tool);
        self
    }

    /// Adds `tool`, replacing any tool with the same name (ignoring case)
    /// in place.
    pub fn register(&mut self, tool: Tool) {
        match self
            .tools
            .iter()
            .position(|t| t.name().eq_ignore_ascii_case(tool.name()))
        {
            Some(pos) => self.tools[pos] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name().eq_ignore_ascii_case(name))
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn unknown_tool_output(&self, name: &str) -> ToolOutput {
        let mut available = self.names();
        available.sort();
        ToolOutput::failure_with_details(
            "unknown_tool",
            format!("Unknown tool: {name}"),
            format!("Available tools: {}", available.join(", ")),
        )
    }
}
