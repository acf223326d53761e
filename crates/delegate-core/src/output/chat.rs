//! Chat message target.
//!
//! Each job is shown as one status message (split over several when long)
//! that is edited in place as the call tree changes. Text updates land in a
//! `watch` buffer; a debouncer task forwards the latest text at most once per
//! window to a single writer task, which also carries file uploads and
//! clears so chat API calls for one message never overlap.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::OutputConfig;
use crate::core::call_tree::{TreeChange, TreeSnapshot};
use crate::core::events::FileOutput;
use crate::core::job::{ChatBinding, JobInfo, JobOutcome};
use crate::output::render::{RenderOptions, render_tree, split_message};
use crate::output::{MessageSink, OutputTarget};

/// Chat surface the target writes to. Message ids are the surface's own.
pub trait ChatApi: Send + Sync {
    /// Sends `text`, optionally as a reply. Returns the new message id.
    fn send_text<'a>(
        &'a self,
        chat: &'a ChatBinding,
        text: &'a str,
        reply_to: Option<i64>,
    ) -> BoxFuture<'a, Result<i64>>;

    fn edit_text<'a>(&'a self, chat: &'a ChatBinding, message_id: i64, text: &'a str) -> BoxFuture<'a, Result<()>>;

    fn delete_message<'a>(&'a self, chat: &'a ChatBinding, message_id: i64) -> BoxFuture<'a, Result<()>>;

    fn send_file<'a>(
        &'a self,
        chat: &'a ChatBinding,
        file: &'a FileOutput,
        reply_to: Option<i64>,
    ) -> BoxFuture<'a, Result<i64>>;
}

pub struct ChatTarget {
    api: Arc<dyn ChatApi>,
    config: OutputConfig,
}

impl ChatTarget {
    pub fn new(api: Arc<dyn ChatApi>, config: OutputConfig) -> Self {
        Self { api, config }
    }
}

impl OutputTarget for ChatTarget {
    fn open(&self, job: &JobInfo, initial: &str) -> Arc<dyn MessageSink> {
        let options = RenderOptions {
            verbose: self.config.verbose,
            job_link: self.config.job_link(&job.id),
        };
        Arc::new(ChatSink::open(
            Arc::clone(&self.api),
            job.chat.clone(),
            initial,
            options,
            self.config.debounce(),
            self.config.message_limit,
        ))
    }
}

enum Op {
    Flush(String),
    File(FileOutput),
    Clear,
    Finish(oneshot::Sender<()>),
}

#[derive(Default)]
struct Content {
    manual: String,
    rendered: Option<String>,
    rendered_at: Option<Instant>,
    cleared: bool,
}

impl Content {
    fn current(&self) -> &str {
        self.rendered
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(&self.manual)
    }
}

struct ChatSink {
    content: Mutex<Content>,
    text: watch::Sender<String>,
    ops: mpsc::UnboundedSender<Op>,
    options: RenderOptions,
    window: Duration,
    debouncer: JoinHandle<()>,
}

impl ChatSink {
    fn open(
        api: Arc<dyn ChatApi>,
        chat: ChatBinding,
        initial: &str,
        options: RenderOptions,
        debounce: Duration,
        limit: usize,
    ) -> Self {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (text, text_rx) = watch::channel(initial.to_string());

        let writer = Writer {
            api,
            reply_to: chat.message_id,
            chat,
            limit,
            message_ids: Vec::new(),
            chunks: Vec::new(),
            last_sent: None,
            cleared: false,
        };
        tokio::spawn(writer.run(ops_rx));
        // The status message goes out right away; later edits are debounced.
        let _ = ops.send(Op::Flush(initial.to_string()));
        let debouncer = tokio::spawn(debounce_loop(text_rx, ops.clone(), debounce));

        Self {
            content: Mutex::new(Content {
                manual: initial.to_string(),
                ..Content::default()
            }),
            text,
            ops,
            options,
            window: debounce,
            debouncer,
        }
    }

    fn content(&self) -> std::sync::MutexGuard<'_, Content> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Content)) {
        let mut content = self.content();
        f(&mut content);
        if content.cleared {
            return;
        }
        let current = content.current().to_string();
        self.text.send_replace(current);
    }
}

impl Drop for ChatSink {
    fn drop(&mut self) {
        self.debouncer.abort();
    }
}

impl MessageSink for ChatSink {
    fn append(&self, text: &str) {
        self.update(|content| content.manual.push_str(text));
    }

    fn replace_with(&self, text: &str) {
        self.update(|content| content.manual = text.to_string());
    }

    fn add_file(&self, file: &FileOutput) {
        let _ = self.ops.send(Op::File(file.clone()));
    }

    fn clear(&self) {
        self.content().cleared = true;
        let _ = self.ops.send(Op::Clear);
    }

    /// Streaming deltas re-render at most once per debounce window; the
    /// next structural change or `finish` picks up whatever was skipped.
    fn blocks_changed(&self, tree: &TreeSnapshot, change: TreeChange) {
        if change.is_delta()
            && self
                .content()
                .rendered_at
                .is_some_and(|at| at.elapsed() < self.window)
        {
            return;
        }
        let rendered = render_tree(tree, &self.options);
        self.update(|content| {
            content.rendered = Some(rendered);
            content.rendered_at = Some(Instant::now());
        });
    }

    fn finish<'a>(&'a self, tree: &'a TreeSnapshot, outcome: &'a JobOutcome) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.debouncer.abort();
            let text = {
                let mut content = self.content();
                content.rendered = Some(render_tree(tree, &self.options));
                (!content.cleared).then(|| content.current().to_string())
            };
            if let Some(text) = text {
                let _ = self.ops.send(Op::Flush(text));
            }
            let (done, wait) = oneshot::channel();
            if self.ops.send(Op::Finish(done)).is_ok() {
                let _ = wait.await;
            }
            tracing::debug!(success = outcome.is_success(), "chat message finished");
        })
    }
}

/// Forwards the latest text once per window, starting at the first change.
async fn debounce_loop(mut text: watch::Receiver<String>, ops: mpsc::UnboundedSender<Op>, window: Duration) {
    while text.changed().await.is_ok() {
        tokio::time::sleep(window).await;
        let latest = text.borrow_and_update().clone();
        if ops.send(Op::Flush(latest)).is_err() {
            break;
        }
    }
}

struct Writer {
    api: Arc<dyn ChatApi>,
    chat: ChatBinding,
    reply_to: Option<i64>,
    limit: usize,
    message_ids: Vec<i64>,
    chunks: Vec<String>,
    last_sent: Option<String>,
    cleared: bool,
}

impl Writer {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        while let Some(op) = ops.recv().await {
            match op {
                Op::Flush(text) => self.flush(text).await,
                Op::File(file) => self.send_file(&file).await,
                Op::Clear => self.clear().await,
                Op::Finish(done) => {
                    let _ = done.send(());
                    break;
                }
            }
        }
    }

    async fn flush(&mut self, text: String) {
        if self.cleared || self.last_sent.as_deref() == Some(text.as_str()) {
            return;
        }
        let chunks = split_message(&text, self.limit);
        if chunks.is_empty() {
            return;
        }

        // What each message actually shows, so failed edits are retried.
        let mut delivered: Vec<String> = Vec::with_capacity(chunks.len());
        let mut complete = true;
        for (i, chunk) in chunks.into_iter().enumerate() {
            if let Some(&message_id) = self.message_ids.get(i) {
                if self.chunks.get(i) != Some(&chunk)
                    && let Err(e) = self.api.edit_text(&self.chat, message_id, &chunk).await
                {
                    tracing::warn!(chat_id = self.chat.chat_id, message_id, "failed to edit message: {e:#}");
                    complete = false;
                    delivered.push(self.chunks.get(i).cloned().unwrap_or_default());
                    continue;
                }
                delivered.push(chunk);
            } else {
                let reply_to = if i == 0 {
                    self.reply_to
                } else {
                    self.message_ids.get(i - 1).copied()
                };
                match self.api.send_text(&self.chat, &chunk, reply_to).await {
                    Ok(message_id) => {
                        self.message_ids.push(message_id);
                        delivered.push(chunk);
                    }
                    Err(e) => {
                        tracing::warn!(chat_id = self.chat.chat_id, "failed to send message: {e:#}");
                        // Later chunks would reply to a message that does not exist.
                        self.chunks = delivered;
                        return;
                    }
                }
            }
        }

        for message_id in self.message_ids.split_off(delivered.len()) {
            self.delete(message_id).await;
        }
        self.chunks = delivered;
        if complete {
            self.last_sent = Some(text);
        }
    }

    async fn send_file(&self, file: &FileOutput) {
        let reply_to = self.message_ids.first().copied().or(self.reply_to);
        if let Err(e) = self.api.send_file(&self.chat, file, reply_to).await {
            tracing::warn!(chat_id = self.chat.chat_id, file = %file.filename, "failed to send file: {e:#}");
        }
    }

    async fn clear(&mut self) {
        self.cleared = true;
        for message_id in std::mem::take(&mut self.message_ids) {
            self.delete(message_id).await;
        }
        self.chunks.clear();
    }

    async fn delete(&self, message_id: i64) {
        if let Err(e) = self.api.delete_message(&self.chat, message_id).await {
            tracing::warn!(chat_id = self.chat.chat_id, message_id, "failed to delete message: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::core::call_tree::CallKind;
    use crate::output::Output;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Send { text: String, reply_to: Option<i64> },
        Edit { id: i64, text: String },
        Delete { id: i64 },
        File { name: String, reply_to: Option<i64> },
    }

    #[derive(Default)]
    struct FakeChat {
        calls: Mutex<Vec<Call>>,
        next_id: AtomicI64,
        failing_edits: AtomicUsize,
    }

    impl FakeChat {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn id(&self) -> i64 {
            100 + self.next_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    impl ChatApi for FakeChat {
        fn send_text<'a>(
            &'a self,
            _chat: &'a ChatBinding,
            text: &'a str,
            reply_to: Option<i64>,
        ) -> BoxFuture<'a, Result<i64>> {
            self.record(Call::Send {
                text: text.to_string(),
                reply_to,
            });
            let id = self.id();
            Box::pin(async move { Ok(id) })
        }

        fn edit_text<'a>(&'a self, _chat: &'a ChatBinding, message_id: i64, text: &'a str) -> BoxFuture<'a, Result<()>> {
            self.record(Call::Edit {
                id: message_id,
                text: text.to_string(),
            });
            let failed = self
                .failing_edits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Box::pin(async move {
                if failed {
                    anyhow::bail!("Too Many Requests: retry after 1");
                }
                Ok(())
            })
        }

        fn delete_message<'a>(&'a self, _chat: &'a ChatBinding, message_id: i64) -> BoxFuture<'a, Result<()>> {
            self.record(Call::Delete { id: message_id });
            Box::pin(async { Ok(()) })
        }

        fn send_file<'a>(
            &'a self,
            _chat: &'a ChatBinding,
            file: &'a FileOutput,
            reply_to: Option<i64>,
        ) -> BoxFuture<'a, Result<i64>> {
            self.record(Call::File {
                name: file.filename.clone(),
                reply_to,
            });
            let id = self.id();
            Box::pin(async move { Ok(id) })
        }
    }

    fn open(chat: &Arc<FakeChat>, limit: usize) -> Arc<dyn MessageSink> {
        let api: Arc<dyn ChatApi> = Arc::<FakeChat>::clone(chat);
        let config = OutputConfig {
            message_limit: limit,
            ..OutputConfig::default()
        };
        let job = JobInfo::new(
            ChatBinding {
                chat_id: 1,
                message_id: Some(7),
                ..ChatBinding::default()
            },
            "hi",
        );
        ChatTarget::new(api, config).open(&job, "Processing...")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(600)).await;
    }

    fn send(text: &str, reply_to: Option<i64>) -> Call {
        Call::Send {
            text: text.to_string(),
            reply_to,
        }
    }

    fn edit(id: i64, text: &str) -> Call {
        Call::Edit {
            id,
            text: text.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn updates_within_a_window_coalesce_into_one_edit() {
        let chat = Arc::new(FakeChat::default());
        let sink = open(&chat, 4096);
        tokio::task::yield_now().await;

        for i in 1..=5 {
            sink.replace_with(&format!("v{i}"));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        settle().await;

        assert_eq!(chat.calls(), vec![send("Processing...", Some(7)), edit(100, "v5")]);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_text_is_not_resent() {
        let chat = Arc::new(FakeChat::default());
        let sink = open(&chat, 4096);

        sink.replace_with("same");
        settle().await;
        sink.replace_with("other");
        sink.replace_with("same");
        settle().await;

        assert_eq!(chat.calls(), vec![send("Processing...", Some(7)), edit(100, "same")]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_edits_are_retried_on_the_next_flush() {
        let chat = Arc::new(FakeChat::default());
        let sink = open(&chat, 4096);
        settle().await;

        chat.failing_edits.store(1, Ordering::SeqCst);
        sink.replace_with("first");
        settle().await;
        sink.replace_with("first");
        settle().await;

        assert_eq!(
            chat.calls(),
            vec![
                send("Processing...", Some(7)),
                edit(100, "first"),
                edit(100, "first"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_text_renders_at_most_once_per_window() {
        let chat = Arc::new(FakeChat::default());
        let api: Arc<dyn ChatApi> = Arc::<FakeChat>::clone(&chat);
        let output = Output::new(vec![Arc::new(ChatTarget::new(api, OutputConfig::default()))]);
        let message = output.send_message(&JobInfo::new(ChatBinding::default(), "hi"), "Processing...");
        let root = message.create_block(CallKind::Agent, "master_agent", Some(json!("hi")));

        for _ in 0..100 {
            root.append_text("x");
        }
        settle().await;
        let shows_text = |call: &Call| matches!(call, Call::Edit { text, .. } if text.contains('x'));
        assert!(!chat.calls().iter().any(shows_text));

        root.append_text("y");
        settle().await;
        let expected = format!("{}y", "x".repeat(100));
        assert!(matches!(chat.calls().last(), Some(Call::Edit { text, .. }) if text.contains(&expected)));
    }

    #[tokio::test(start_paused = true)]
    async fn long_text_splits_into_replies_and_surplus_is_deleted() {
        let chat = Arc::new(FakeChat::default());
        let sink = open(&chat, 15);

        sink.replace_with("aaaa bbbb cccc dddd eeee");
        settle().await;
        sink.replace_with("aaaa bbbb cccc");
        settle().await;

        assert_eq!(
            chat.calls(),
            vec![
                send("Processing...", Some(7)),
                edit(100, "aaaa bbbb cccc"),
                send("dddd eeee", Some(100)),
                Call::Delete { id: 101 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_deletes_and_ignores_later_text() {
        let chat = Arc::new(FakeChat::default());
        let sink = open(&chat, 4096);
        settle().await;

        sink.clear();
        sink.replace_with("ignored");
        settle().await;

        assert_eq!(
            chat.calls(),
            vec![send("Processing...", Some(7)), Call::Delete { id: 100 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finish_flushes_immediately_and_files_reply_to_status() {
        let chat = Arc::new(FakeChat::default());
        let api: Arc<dyn ChatApi> = Arc::<FakeChat>::clone(&chat);
        let output = Output::new(vec![Arc::new(ChatTarget::new(api, OutputConfig::default()))]);
        let message = output.send_message(
            &JobInfo::new(
                ChatBinding {
                    chat_id: 1,
                    ..ChatBinding::default()
                },
                "hi",
            ),
            "Processing...",
        );
        tokio::task::yield_now().await;

        let root = message.create_block(CallKind::Agent, "master_agent", Some(json!("hi")));
        (message.file_sink())(FileOutput::new("notes.txt", "text/plain", b"n".to_vec()));
        root.append_text("All done.");
        root.complete(None);
        message
            .finish(&JobOutcome::Completed {
                text: "All done.".to_string(),
            })
            .await;

        assert_eq!(
            chat.calls(),
            vec![
                send("Processing...", None),
                Call::File {
                    name: "notes.txt".to_string(),
                    reply_to: Some(100),
                },
                edit(100, "All done."),
            ]
        );
    }
}
