use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use delegate_core::config::Config;
use delegate_core::core::events::{FileOutput, ToolOutput};
use delegate_core::core::job::ChatBinding;
use delegate_core::output::ChatApi;
use delegate_core::tools::{Tool, ToolContext, ToolFuture, ToolHandler};
use futures_util::future::BoxFuture;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

mod types;

pub use types::{Chat, Message, Update, User};

pub const TOKEN_ENV: &str = "DELEGATE_TELEGRAM_BOT_TOKEN";

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

pub struct TelegramSettings {
    pub bot_token: String,
    pub allowlist_user_ids: HashSet<i64>,
    pub allowlist_chat_ids: HashSet<i64>,
}

impl TelegramSettings {
    /// # Errors
    /// Returns an error if no token is configured or the user allowlist is
    /// empty.
    pub fn from_config(config: &Config) -> Result<Self> {
        let token = config
            .telegram
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .or_else(|| {
                std::env::var(TOKEN_ENV)
                    .ok()
                    .map(|token| token.trim().to_string())
                    .filter(|token| !token.is_empty())
            })
            .unwrap_or_default();
        if token.is_empty() {
            bail!("telegram.bot_token or {TOKEN_ENV} is required");
        }

        let allowlist_user_ids: HashSet<i64> = config.telegram.allowlist_user_ids.iter().copied().collect();
        if allowlist_user_ids.is_empty() {
            bail!("telegram.allowlist_user_ids must contain at least one user ID");
        }

        Ok(Self {
            bot_token: token,
            allowlist_user_ids,
            allowlist_chat_ids: config.telegram.allowlist_chat_ids.iter().copied().collect(),
        })
    }
}

/// Minimal Bot API client.
#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(token: String) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(token: String, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub async fn get_updates(&self, offset: Option<i64>, timeout: Duration) -> Result<Vec<Update>> {
        let request = GetUpdatesRequest {
            offset,
            timeout: timeout.as_secs(),
            allowed_updates: Some(vec!["message"]),
        };
        self.post("getUpdates", &request).await
    }

    /// Returns the id of the sent message.
    pub async fn send_message(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64> {
        let request = SendMessageRequest {
            chat_id,
            message_thread_id: thread_id,
            text,
            reply_to_message_id,
            allow_sending_without_reply: reply_to_message_id.map(|_| true),
        };
        let message: Message = self.post("sendMessage", &request).await?;
        Ok(message.message_id)
    }

    pub async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        let request = EditMessageTextRequest {
            chat_id,
            message_id,
            text,
        };
        match self.post::<Value, _>("editMessageText", &request).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let request = DeleteMessageRequest { chat_id, message_id };
        let _: bool = self.post("deleteMessage", &request).await?;
        Ok(())
    }

    /// Uploads `file` as a document. Returns the id of the sent message.
    pub async fn send_document(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        file: &FileOutput,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64> {
        let part = Part::bytes(file.bytes.clone())
            .file_name(file.filename.clone())
            .mime_str(&file.mime_type)
            .with_context(|| format!("invalid mime type '{}'", file.mime_type))?;
        let mut form = Form::new().text("chat_id", chat_id.to_string()).part("document", part);
        if let Some(thread_id) = thread_id {
            form = form.text("message_thread_id", thread_id.to_string());
        }
        if let Some(reply_to) = reply_to_message_id {
            form = form
                .text("reply_to_message_id", reply_to.to_string())
                .text("allow_sending_without_reply", "true");
        }

        let response = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .context("Telegram upload failed")?;
        let message: Message = decode(response).await?;
        Ok(message.message_id)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, method: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Telegram request {method} failed"))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let payload: TelegramResponse<T> = response
        .json()
        .await
        .context("Failed to decode Telegram response")?;

    if !payload.ok {
        let description = payload
            .description
            .unwrap_or_else(|| "Telegram API error".to_string());
        bail!("{description}");
    }

    payload.result.context("Telegram response has no result")
}

impl ChatApi for TelegramClient {
    fn send_text<'a>(
        &'a self,
        chat: &'a ChatBinding,
        text: &'a str,
        reply_to: Option<i64>,
    ) -> BoxFuture<'a, Result<i64>> {
        Box::pin(self.send_message(chat.chat_id, chat.thread_id, text, reply_to))
    }

    fn edit_text<'a>(&'a self, chat: &'a ChatBinding, message_id: i64, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.edit_message_text(chat.chat_id, message_id, text))
    }

    fn delete_message<'a>(&'a self, chat: &'a ChatBinding, message_id: i64) -> BoxFuture<'a, Result<()>> {
        Box::pin(TelegramClient::delete_message(self, chat.chat_id, message_id))
    }

    fn send_file<'a>(
        &'a self,
        chat: &'a ChatBinding,
        file: &'a FileOutput,
        reply_to: Option<i64>,
    ) -> BoxFuture<'a, Result<i64>> {
        Box::pin(self.send_document(chat.chat_id, chat.thread_id, file, reply_to))
    }
}

#[derive(Debug, Deserialize)]
struct TelegramSendInput {
    text: String,
    #[serde(default)]
    chat_id: Option<i64>,
}

/// `telegram_send`: posts a message to the current chat, or to `chat_id`.
///
/// Declared as a raw provider definition.
///
/// # Errors
/// Returns an error if the definition is rejected.
pub fn telegram_send_tool(client: TelegramClient) -> Result<Tool> {
    let definition = json!({
        "name": "telegram_send",
        "description": "Send a separate Telegram message. Defaults to the current chat.",
        "input_schema": {
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Message text to send"
                },
                "chat_id": {
                    "type": "integer",
                    "description": "Optional target chat ID"
                }
            },
            "required": ["text"],
            "additionalProperties": false
        }
    });

    let client = Arc::new(client);
    let handler: ToolHandler = Arc::new(move |input: &Value, ctx: &ToolContext| -> ToolFuture {
        let client = Arc::clone(&client);
        let input = input.clone();
        let chat = ctx.job.chat().clone();
        Box::pin(async move {
            let parsed: TelegramSendInput = match serde_json::from_value(input) {
                Ok(parsed) => parsed,
                Err(err) => {
                    return Ok(ToolOutput::failure_with_details(
                        "invalid_input",
                        "Invalid input for telegram_send",
                        err.to_string(),
                    ));
                }
            };

            let text = parsed.text.trim();
            if text.is_empty() {
                return Ok(ToolOutput::failure("invalid_input", "text must not be empty", None));
            }

            let (chat_id, thread_id) = match parsed.chat_id {
                Some(chat_id) if chat_id != chat.chat_id => (chat_id, None),
                _ => (chat.chat_id, chat.thread_id),
            };
            Ok(match client.send_message(chat_id, thread_id, text, None).await {
                Ok(message_id) => ToolOutput::success(json!({
                    "sent": true,
                    "chat_id": chat_id,
                    "message_id": message_id,
                })),
                Err(err) => ToolOutput::failure_with_details(
                    "telegram_error",
                    "Failed to send Telegram message",
                    format!("{err:#}"),
                ),
            })
        })
    });

    Tool::sdk(definition, handler)
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_updates: Option<Vec<&'static str>>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_sending_without_reply: Option<bool>,
}

#[derive(Debug, Serialize)]
struct EditMessageTextRequest<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct DeleteMessageRequest {
    chat_id: i64,
    message_id: i64,
}
