//! Jobs: one inbound request, its context and its execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::agent::{Agent, RunContext};
use crate::core::call_tree::{BlockHandle, CallKind};
use crate::core::events::FileOutput;
use crate::core::stream::{AgentStreams, StreamProxy};
use crate::output::Output;

/// Status text shown before the first block appears.
pub const PROCESSING: &str = "Processing...";

/// Receives files produced by tools.
pub type FileSink = Arc<dyn Fn(FileOutput) + Send + Sync>;

/// Where a job came from and where its replies go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBinding {
    pub chat_id: i64,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Immutable description of a job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub chat: ChatBinding,
    pub user_message: String,
    pub created_at: DateTime<Utc>,
}

impl JobInfo {
    pub fn new(chat: ChatBinding, user_message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat,
            user_message: user_message.into(),
            created_at: Utc::now(),
        }
    }
}

struct JobContextInner {
    info: JobInfo,
    files: Option<FileSink>,
}

/// Job data visible to agents and tools.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<JobContextInner>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.inner.info.id)
            .field("chat_id", &self.inner.info.chat.chat_id)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub fn new(info: JobInfo) -> Self {
        Self {
            inner: Arc::new(JobContextInner { info, files: None }),
        }
    }

    pub fn with_file_sink(info: JobInfo, files: FileSink) -> Self {
        Self {
            inner: Arc::new(JobContextInner {
                info,
                files: Some(files),
            }),
        }
    }

    pub fn info(&self) -> &JobInfo {
        &self.inner.info
    }

    pub fn job_id(&self) -> &str {
        &self.inner.info.id
    }

    pub fn chat(&self) -> &ChatBinding {
        &self.inner.info.chat
    }

    pub fn user_message(&self) -> &str {
        &self.inner.info.user_message
    }

    /// Hands `file` to the job's output targets. Dropped when the job has no
    /// file sink.
    pub fn attach_file(&self, file: FileOutput) {
        match &self.inner.files {
            Some(sink) => sink(file),
            None => tracing::debug!(job_id = %self.job_id(), file = %file.filename, "no file sink, file dropped"),
        }
    }
}

/// A queued unit of work.
pub struct Job {
    info: JobInfo,
    done: AtomicBool,
    root: OnceLock<BlockHandle>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.info.id)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new(chat: ChatBinding, user_message: impl Into<String>) -> Self {
        Self::from_info(JobInfo::new(chat, user_message))
    }

    pub fn from_info(info: JobInfo) -> Self {
        Self {
            info,
            done: AtomicBool::new(false),
            root: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    /// Binds the root call node. Only the first call has an effect.
    pub fn bind_root(&self, root: BlockHandle) -> bool {
        self.root.set(root).is_ok()
    }

    pub fn root(&self) -> Option<&BlockHandle> {
        self.root.get()
    }

    /// Marks the job done. Returns `true` only for the first call.
    pub fn complete(&self) -> bool {
        !self.done.swap(true, Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { text: String },
    Failed { error: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }
}

/// Runs jobs through an agent and reports them to the output targets.
pub struct JobRunner {
    agent: Arc<Agent>,
    output: Arc<Output>,
}

impl JobRunner {
    pub fn new(agent: Arc<Agent>, output: Arc<Output>) -> Self {
        Self { agent, output }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Executes `job` to completion.
    ///
    /// Model failures do not escape: the root node is marked failed, an error
    /// block is added and targets finish with a failed outcome.
    pub async fn run(&self, job: &Job) -> JobOutcome {
        let info = job.info().clone();
        tracing::info!(job_id = %info.id, chat_id = info.chat.chat_id, agent = %self.agent.name(), "job started");

        let message = self.output.send_message(&info, PROCESSING);
        let root = message.create_block(
            CallKind::Agent,
            self.agent.name(),
            Some(Value::String(info.user_message.clone())),
        );
        job.bind_root(root.clone());

        let job_ctx = JobContext::with_file_sink(info.clone(), message.file_sink());
        let streams = AgentStreams::new();
        let proxy = StreamProxy::attach(&streams, root.clone());
        let run_ctx = RunContext::new(job_ctx, root.clone(), streams);

        let result = self.agent.run(&info.user_message, &run_ctx).await;
        proxy.finish().await;

        let outcome = match result {
            Ok(text) => {
                root.complete(Some(Value::String(text.clone())));
                JobOutcome::Completed { text }
            }
            Err(e) => {
                let error = format!("{e:#}");
                tracing::warn!(job_id = %info.id, "job failed: {error}");
                root.fail(error.clone());
                let block = message.create_block(CallKind::Error, "error", Some(json!(error)));
                block.fail(error.clone());
                JobOutcome::Failed { error }
            }
        };

        if job.complete() {
            message.finish(&outcome).await;
        }
        tracing::info!(job_id = %info.id, success = outcome.is_success(), "job finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_is_idempotent() {
        let job = Job::new(ChatBinding::default(), "hello");
        assert!(!job.is_done());
        assert!(job.complete());
        assert!(!job.complete());
        assert!(job.is_done());
    }

    #[test]
    fn job_ids_are_unique_uuids() {
        let a = Job::new(ChatBinding::default(), "a");
        let b = Job::new(ChatBinding::default(), "b");
        assert_ne!(a.id(), b.id());
        assert!(uuid::Uuid::parse_str(a.id()).is_ok());
    }

    #[test]
    fn file_sink_receives_attached_files() {
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&received);
        let ctx = JobContext::with_file_sink(
            JobInfo::new(ChatBinding::default(), "x"),
            Arc::new(move |file: FileOutput| sink_store.lock().unwrap().push(file.filename)),
        );

        ctx.attach_file(FileOutput::new("a.txt", "text/plain", b"a".to_vec()));
        JobContext::new(ctx.info().clone()).attach_file(FileOutput::new("b.txt", "text/plain", vec![]));

        assert_eq!(*received.lock().unwrap(), vec!["a.txt".to_string()]);
    }
}
