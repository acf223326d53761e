//! One-line summaries of finished tool and agent calls.
//!
//! Summaries are generated with a small model, cleaned up and cached by
//! call name plus the first 50 characters of the input.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use regex::Regex;
use serde_json::Value;

use crate::core::call_tree::{BlockHandle, CallKind, CallNode, CallState};
use crate::providers::{ChatMessage, ModelClient, ModelRequest, create_completion};

const TOOL_PROMPT: &str = "Describe this tool's result in 5-10 words. No questions. No tool name.
Input: {{input}}
Output: {{output}}
Example: \"Found 3 character files\" or \"Listed 5 items in folder\"";

const AGENT_PROMPT: &str = "Describe what was done in 5-10 words. No questions. No agent name.
Task: {{task}}
Result: {{result}}
Example: \"Found 2D Characters folder\" or \"Searched drive for assets\"";

/// Returned when no summary could be generated.
pub const PENDING_SUMMARY: &str = "Processing...";
const EMPTY_SUMMARY: &str = "Completed";
const KEY_PREFIX_CHARS: usize = 50;
const SUMMARY_MAX_TOKENS: u32 = 64;
const CACHE_CAPACITY: usize = 512;

static QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"^["'](.*)["']$"#).expect("valid regex"));
static QUESTION_STARTERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(do you want|would you like|shall I|want me to|should I|can I|may I)\s+")
        .expect("valid regex")
});

/// Insertion-ordered cache that evicts the oldest entry when full.
#[derive(Debug, Default)]
struct SummaryCache {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SummaryCache {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ..Self::default()
        }
    }

    fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: String, summary: String) {
        if self.entries.insert(key.clone(), summary).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct Summarizer {
    client: Arc<dyn ModelClient>,
    model: String,
    cache: Mutex<SummaryCache>,
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl Summarizer {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            cache: Mutex::new(SummaryCache::with_capacity(CACHE_CAPACITY)),
        }
    }

    /// Caps how many summaries are kept. The oldest entries go first.
    #[must_use]
    pub fn cache_capacity(self, capacity: usize) -> Self {
        Self {
            cache: Mutex::new(SummaryCache::with_capacity(capacity)),
            ..self
        }
    }

    pub fn cached_summaries(&self) -> usize {
        self.cache().len()
    }

    pub async fn summarize_tool(&self, name: &str, input: Option<&Value>, output: Option<&Value>) -> String {
        self.tool_summary(name, input, output)
            .await
            .unwrap_or_else(|| PENDING_SUMMARY.to_string())
    }

    pub async fn summarize_agent(&self, name: &str, task: &str, result: Option<&str>) -> String {
        self.agent_summary(name, task, result)
            .await
            .unwrap_or_else(|| PENDING_SUMMARY.to_string())
    }

    async fn tool_summary(&self, name: &str, input: Option<&Value>, output: Option<&Value>) -> Option<String> {
        let input = render_value(input);
        let output = render_value(output);
        let prompt = TOOL_PROMPT
            .replace("{{input}}", &input)
            .replace("{{output}}", &output);
        let key = format!("tool:{name}:{}", prefix(&input));
        let raw = self.generate(&prompt, key).await?;
        Some(clean_summary(&raw, name))
    }

    async fn agent_summary(&self, name: &str, task: &str, result: Option<&str>) -> Option<String> {
        let prompt = AGENT_PROMPT
            .replace("{{task}}", task)
            .replace("{{result}}", result.unwrap_or("pending"));
        let key = format!("agent:{name}:{}", prefix(task));
        let raw = self.generate(&prompt, key).await?;
        Some(clean_summary(&raw, name))
    }

    async fn generate(&self, prompt: &str, key: String) -> Option<String> {
        if let Some(cached) = self.cache().get(&key) {
            return Some(cached.clone());
        }

        let messages = [ChatMessage::user(prompt)];
        let request = ModelRequest {
            model: &self.model,
            system: None,
            tools: &[],
            messages: &messages,
            max_tokens: SUMMARY_MAX_TOKENS,
            thinking_budget: None,
        };
        match create_completion(self.client.as_ref(), request).await {
            Ok(completion) => {
                let summary = completion.text.trim().to_string();
                if summary.is_empty() {
                    return None;
                }
                self.cache().insert(key, summary.clone());
                Some(summary)
            }
            Err(e) => {
                tracing::debug!("summary generation failed: {e:#}");
                None
            }
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, SummaryCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn summarize_node(&self, node: &CallNode) -> Option<String> {
        match node.kind {
            CallKind::Tool => {
                self.tool_summary(&node.name, node.input.as_ref(), node.output.as_ref())
                    .await
            }
            CallKind::Agent => {
                let result = node.output.as_ref().map(|output| match output {
                    Value::String(s) => s.clone(),
                    other => other
                        .get("result")
                        .and_then(Value::as_str)
                        .map_or_else(|| other.to_string(), str::to_string),
                });
                self.agent_summary(
                    &node.name,
                    node.task().unwrap_or("unknown task"),
                    result.as_deref(),
                )
                .await
            }
            _ => None,
        }
    }

    /// Summarizes a non-root agent or tool node that just completed, in the
    /// background. Does nothing outside a tokio runtime.
    pub(crate) fn spawn_for(self: &Arc<Self>, handle: &BlockHandle) {
        let Some(node) = handle.node() else {
            return;
        };
        if node.is_root()
            || node.state != CallState::Completed
            || !matches!(node.kind, CallKind::Agent | CallKind::Tool)
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let summarizer = Arc::clone(self);
        let handle = handle.clone();
        runtime.spawn(async move {
            if let Some(summary) = summarizer.summarize_node(&node).await {
                handle.set_summary(summary);
            }
        });
    }
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "none".to_string(),
        Some(value) => value.to_string(),
    }
}

fn prefix(s: &str) -> &str {
    match s.char_indices().nth(KEY_PREFIX_CHARS) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn strip_prefix_ci(text: &str, name: &str) -> String {
    if name.is_empty() {
        return text.to_string();
    }
    match text.get(..name.len()) {
        Some(head) if head.eq_ignore_ascii_case(name) => {
            let rest = &text[name.len()..];
            rest.strip_prefix(':').unwrap_or(rest).trim_start().to_string()
        }
        _ => text.to_string(),
    }
}

/// Normalizes a raw model summary: drops a leading call name, wrapping
/// quotes, questions and trailing `?`/`!`, and capitalizes the first letter.
pub fn clean_summary(summary: &str, name: &str) -> String {
    let compact = name.replace('_', "");
    let mut cleaned = summary.trim().to_string();
    for candidate in [name.to_string(), compact.to_lowercase(), compact] {
        cleaned = strip_prefix_ci(&cleaned, &candidate);
    }

    cleaned = QUOTED.replace(&cleaned, "$1").into_owned();

    if let Some((before, _)) = cleaned.split_once('?') {
        cleaned = before.trim().to_string();
    }

    cleaned = QUESTION_STARTERS.replace(&cleaned, "").into_owned();

    cleaned = cleaned.trim_end_matches(['?', '!']).trim().to_string();

    let mut chars = cleaned.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => EMPTY_SUMMARY.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::call_tree::CallTree;
    use crate::providers::{ScriptedClient, ScriptedTurn};

    #[test]
    fn cleans_names_quotes_and_questions() {
        assert_eq!(
            clean_summary("search_drive_files: found 3 files", "search_drive_files"),
            "Found 3 files"
        );
        assert_eq!(clean_summary("SearchDriveFiles found 3", "search_drive_files"), "Found 3");
        assert_eq!(clean_summary("\"listed 5 items\"", "list"), "Listed 5 items");
        assert_eq!(
            clean_summary("Uploaded the file. Do you want more?", "upload_file"),
            "Uploaded the file. Do you want more"
        );
        assert_eq!(clean_summary("would you like a summary?", "x"), "A summary");
        assert_eq!(clean_summary("Done!!", "x"), "Done");
        assert_eq!(clean_summary("", "x"), "Completed");
    }

    #[tokio::test]
    async fn tool_summaries_are_cached_by_name_and_input_prefix() {
        let client = Arc::new(ScriptedClient::new([ScriptedTurn::text("  opened the file  ")]));
        let summarizer = Summarizer::new(Arc::<ScriptedClient>::clone(&client), "small");
        let input = json!({"path": "a.txt"});

        let first = summarizer
            .summarize_tool("read", Some(&input), Some(&json!({"ok": true})))
            .await;
        let second = summarizer
            .summarize_tool("read", Some(&input), Some(&json!({"ok": false})))
            .await;

        assert_eq!(first, "Opened the file");
        assert_eq!(second, first);
        assert_eq!(client.call_count(), 1);
        let prompt = &client.requests()[0].messages[0];
        assert!(matches!(
            &prompt.content,
            crate::providers::MessageContent::Text(text) if text.contains("Input: {\"path\":\"a.txt\"}")
        ));
    }

    #[tokio::test]
    async fn cache_evicts_the_oldest_summaries() {
        let client = Arc::new(ScriptedClient::repeating(ScriptedTurn::text("did it")));
        let summarizer = Summarizer::new(Arc::<ScriptedClient>::clone(&client), "small").cache_capacity(2);

        for task in ["first", "second", "third"] {
            summarizer.summarize_agent("worker", task, None).await;
        }
        assert_eq!(summarizer.cached_summaries(), 2);
        assert_eq!(client.call_count(), 3);

        summarizer.summarize_agent("worker", "third", None).await;
        assert_eq!(client.call_count(), 3);
        summarizer.summarize_agent("worker", "first", None).await;
        assert_eq!(client.call_count(), 4);
        assert_eq!(summarizer.cached_summaries(), 2);
    }

    #[tokio::test]
    async fn failures_fall_back_to_processing() {
        let summarizer = Summarizer::new(Arc::new(ScriptedClient::new([ScriptedTurn::fail("down")])), "small");
        assert_eq!(
            summarizer.summarize_agent("drive_agent", "find files", None).await,
            PENDING_SUMMARY
        );
    }

    #[tokio::test]
    async fn completed_child_nodes_get_a_summary() {
        let summarizer = Arc::new(Summarizer::new(
            Arc::new(ScriptedClient::new([ScriptedTurn::text("Added two numbers")])),
            "small",
        ));
        let tree = CallTree::new(None, Some(summarizer));
        let root = tree.add_root(CallKind::Agent, "master_agent", Some(json!("sum")));
        let child = root.add_child(CallKind::Tool, "add_numbers", Some(json!({"a": 2, "b": 3})));

        child.complete(Some(json!({"sum": 5})));
        root.complete(None);

        for _ in 0..100 {
            if child.node().and_then(|n| n.summary).is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(child.node().unwrap().summary.as_deref(), Some("Added two numbers"));
        assert_eq!(root.node().unwrap().summary, None);
    }
}
