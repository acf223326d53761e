//! The agents the bot runs jobs through.

use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use delegate_core::config::Config;
use delegate_core::core::agent::Agent;
use delegate_core::core::events::{FileOutput, ToolOutput};
use delegate_core::providers::ModelClient;
use delegate_core::tools::{Tool, ToolContext};
use serde::Deserialize;
use serde_json::json;

use crate::telegram::{TelegramClient, telegram_send_tool};

const MASTER_PROMPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/master_agent.md"));
const RESEARCH_PROMPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/research_agent.md"));

const MAX_FILE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct CurrentTimeInput {}

pub fn current_time_tool() -> Tool {
    Tool::function(
        "current_time",
        "Returns the current UTC date and time.",
        json!({"type": "object", "properties": {}}),
        |_input: CurrentTimeInput, _ctx: ToolContext| async move {
            let now = Utc::now();
            Ok(ToolOutput::success(json!({
                "utc": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                "unix": now.timestamp(),
            })))
        },
    )
}

#[derive(Debug, Deserialize)]
struct MakeTextFileInput {
    filename: String,
    content: String,
}

pub fn make_text_file_tool() -> Tool {
    Tool::function(
        "make_text_file",
        "Creates a text file and sends it to the user.",
        json!({
            "type": "object",
            "properties": {
                "filename": {
                    "type": "string",
                    "description": "File name including extension, e.g. notes.md"
                },
                "content": {"type": "string"}
            },
            "required": ["filename", "content"]
        }),
        |input: MakeTextFileInput, ctx: ToolContext| async move {
            let filename = input.filename.trim();
            if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
                return Ok(ToolOutput::failure(
                    "invalid_input",
                    "filename must be a plain file name",
                    None,
                ));
            }
            if input.content.len() > MAX_FILE_BYTES {
                return Ok(ToolOutput::failure(
                    "too_large",
                    format!("content exceeds {MAX_FILE_BYTES} bytes"),
                    None,
                ));
            }

            ctx.log(format!("writing {filename}"));
            let mime = if filename.ends_with(".md") {
                "text/markdown"
            } else {
                "text/plain"
            };
            let bytes = input.content.into_bytes();
            let size = bytes.len();
            Ok(ToolOutput::success_with_files(
                json!({"filename": filename, "bytes": size}),
                vec![FileOutput::new(filename, mime, bytes)],
            ))
        },
    )
}

/// Nested agent the master delegates multi-step questions to.
///
/// # Errors
/// Returns an error if the agent settings are invalid.
pub fn research_agent(config: &Config, client: Arc<dyn ModelClient>) -> Result<Agent> {
    Agent::builder("research_agent", client)
        .with_config(config)
        .instructions(RESEARCH_PROMPT.trim())
        .tool(current_time_tool())
        .build()
}

/// Entry agent for every job. `telegram` adds the `telegram_send` tool.
///
/// # Errors
/// Returns an error if an agent or tool definition is invalid.
pub fn master_agent(config: &Config, client: Arc<dyn ModelClient>, telegram: Option<TelegramClient>) -> Result<Agent> {
    let research = Arc::new(research_agent(config, Arc::clone(&client))?);
    let mut builder = Agent::builder("master_agent", client)
        .with_config(config)
        .dynamic_instructions(|job| {
            let user = job.chat().username.as_deref().unwrap_or("a user");
            MASTER_PROMPT
                .trim()
                .replace("{date}", &Utc::now().format("%Y-%m-%d").to_string())
                .replace("{user}", user)
        })
        .tool(current_time_tool())
        .tool(make_text_file_tool())
        .tool(Tool::agent(
            research,
            "Researches a question in several steps and reports a short answer.",
        ));
    if let Some(telegram) = telegram {
        builder = builder.tool(telegram_send_tool(telegram)?);
    }
    builder.build()
}
