//! Persisted job records for the web inspector.
//!
//! Each job is one JSON file `<dir>/<job_id>.json`, rewritten in full on
//! every structural change of its call tree. Writes go through a temp file
//! in the same directory and an atomic rename, so readers never see a
//! partial record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::call_tree::{CallKind, CallState, NodeId, TreeChange, TreeSnapshot};
use crate::core::job::{JobInfo, JobOutcome};
use crate::output::{MessageSink, OutputTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Error,
}

impl From<&JobOutcome> for JobStatus {
    fn from(outcome: &JobOutcome) -> Self {
        if outcome.is_success() {
            JobStatus::Completed
        } else {
            JobStatus::Error
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredJob {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub status: JobStatus,
    pub task: String,
    #[serde(default)]
    pub blocks: Vec<StoredBlock>,
}

impl StoredJob {
    pub fn new(info: &JobInfo) -> Self {
        Self {
            id: info.id.clone(),
            chat_id: Some(info.chat.chat_id),
            message_id: info.chat.message_id,
            user_id: info.chat.user_id,
            username: info.chat.username.clone(),
            started_at: info.created_at,
            completed_at: None,
            duration: None,
            status: JobStatus::Running,
            task: info.user_message.clone(),
            blocks: Vec::new(),
        }
    }

    fn finish(&mut self, status: JobStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration = Some((now - self.started_at).num_milliseconds());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlock {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CallKind,
    pub name: String,
    pub state: CallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default)]
    pub children: Vec<StoredBlock>,
}

impl StoredBlock {
    /// Converts the subtree rooted at `id`.
    pub fn from_tree(tree: &TreeSnapshot, id: NodeId) -> Option<Self> {
        let node = tree.node(id)?;
        let task = (node.kind == CallKind::Agent)
            .then(|| node.task().map(str::to_string))
            .flatten();
        // Root agents keep their streamed answer as output until completion.
        let output = node
            .output
            .clone()
            .or_else(|| (!node.text.is_empty()).then(|| Value::String(node.text.clone())));

        Some(Self {
            id: id.to_string(),
            kind: node.kind,
            name: node.name.clone(),
            state: node.state,
            task,
            input: node.input.clone(),
            output,
            error: node.error.clone(),
            thinking: (!node.reasoning.is_empty()).then(|| node.reasoning.clone()),
            summary: node.summary.clone(),
            started_at: node.started_at,
            completed_at: node.completed_at,
            duration: node.duration_ms(),
            children: node
                .children
                .iter()
                .filter_map(|child| Self::from_tree(tree, *child))
                .collect(),
        })
    }
}

/// Every root of `tree` as stored blocks.
pub fn stored_blocks(tree: &TreeSnapshot) -> Vec<StoredBlock> {
    tree.roots()
        .iter()
        .filter_map(|id| StoredBlock::from_tree(tree, *id))
        .collect()
}

#[derive(Debug, Clone)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record path for `id`. Ids that could name a file outside the store
    /// directory have no path.
    fn path(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.dir.join(format!("{id}.json")))
    }

    /// Writes the initial `running` record.
    pub fn create_job(&self, info: &JobInfo) -> Result<StoredJob> {
        let job = StoredJob::new(info);
        self.update_job(&job)?;
        Ok(job)
    }

    /// Atomically replaces the record for `job.id`.
    pub fn update_job(&self, job: &StoredJob) -> Result<()> {
        let Some(path) = self.path(&job.id) else {
            anyhow::bail!("Invalid job id {:?}", job.id);
        };
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create job directory {}", self.dir.display()))?;
        let json = serde_json::to_vec_pretty(job).context("Failed to serialize job")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).context("Failed to create temp job file")?;
        tmp.write_all(&json).context("Failed to write job file")?;
        tmp.as_file().sync_all().context("Failed to sync job file")?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Marks a stored job finished. Returns `None` when it does not exist.
    pub fn complete_job(&self, id: &str, status: JobStatus) -> Result<Option<StoredJob>> {
        let Some(mut job) = self.load(id)? else {
            return Ok(None);
        };
        job.finish(status);
        self.update_job(&job)?;
        Ok(Some(job))
    }

    pub fn load(&self, id: &str) -> Result<Option<StoredJob>> {
        let Some(path) = self.path(id) else {
            return Ok(None);
        };
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let job = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(job))
    }

    /// All stored jobs, newest first. Unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<StoredJob>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", self.dir.display()));
            }
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let path = entry.context("Failed to read job directory entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.load(id) {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => tracing::warn!("skipping job record: {e:#}"),
            }
        }
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }
}

/// Persists every job to a [`JobStore`].
pub struct JobStoreTarget {
    store: Arc<JobStore>,
}

impl JobStoreTarget {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }
}

impl OutputTarget for JobStoreTarget {
    fn open(&self, job: &JobInfo, _initial: &str) -> Arc<dyn MessageSink> {
        let record = StoredJob::new(job);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(record.clone());
        let writer = tokio::spawn(write_loop(Arc::clone(&self.store), rx));
        Arc::new(JobStoreSink {
            record: Mutex::new(record),
            writes: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }
}

/// Writes queued records in order, skipping to the newest when behind.
async fn write_loop(store: Arc<JobStore>, mut rx: mpsc::UnboundedReceiver<StoredJob>) {
    while let Some(mut job) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            job = newer;
        }
        let store = Arc::clone(&store);
        let id = job.id.clone();
        match tokio::task::spawn_blocking(move || store.update_job(&job)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(job_id = %id, "failed to persist job: {e:#}"),
            Err(e) => tracing::warn!(job_id = %id, "job persistence task failed: {e}"),
        }
    }
}

struct JobStoreSink {
    record: Mutex<StoredJob>,
    writes: Mutex<Option<mpsc::UnboundedSender<StoredJob>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl JobStoreSink {
    fn save(&self, record: StoredJob) {
        let writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = writes.as_ref() {
            let _ = tx.send(record);
        }
    }
}

impl MessageSink for JobStoreSink {
    fn blocks_changed(&self, tree: &TreeSnapshot, change: TreeChange) {
        if change.is_delta() {
            return;
        }
        let record = {
            let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
            record.blocks = stored_blocks(tree);
            record.clone()
        };
        self.save(record);
    }

    fn finish<'a>(&'a self, tree: &'a TreeSnapshot, outcome: &'a JobOutcome) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let record = {
                let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
                record.blocks = stored_blocks(tree);
                record.finish(JobStatus::from(outcome));
                record.clone()
            };
            self.save(record);

            // Closing the queue lets the writer drain and exit.
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let writer = self
                .writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(writer) = writer
                && let Err(e) = writer.await
            {
                tracing::warn!("job writer failed: {e}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::job::ChatBinding;
    use crate::output::Output;

    fn info(message: &str) -> JobInfo {
        JobInfo::new(
            ChatBinding {
                chat_id: 42,
                message_id: Some(9),
                username: Some("ana".to_string()),
                ..ChatBinding::default()
            },
            message,
        )
    }

    #[test]
    fn create_load_complete_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("jobs"));
        assert!(store.list().unwrap().is_empty());

        let first = store.create_job(&info("first")).unwrap();
        let mut second_info = info("second");
        second_info.created_at = first.started_at + chrono::Duration::seconds(5);
        let second = store.create_job(&second_info).unwrap();

        let loaded = store.load(&first.id).unwrap().unwrap();
        assert_eq!(loaded, first);
        assert_eq!(loaded.status, JobStatus::Running);

        let done = store.complete_job(&first.id, JobStatus::Completed).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.duration.is_some());

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert!(store.complete_job("missing", JobStatus::Error).unwrap().is_none());
    }

    #[test]
    fn ids_cannot_escape_the_store_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("jobs"));
        fs::write(dir.path().join("secret.json"), "{}").unwrap();

        for id in ["../secret", "", "a/b", "..\\secret", "/etc/passwd"] {
            assert!(store.load(id).unwrap().is_none(), "{id:?}");
            assert!(store.complete_job(id, JobStatus::Error).unwrap().is_none());
        }

        let mut job = StoredJob::new(&info("task"));
        job.id = "../escaped".to_string();
        assert!(store.update_job(&job).is_err());
        assert!(!dir.path().join("escaped.json").exists());
    }

    #[test]
    fn records_use_inspector_field_names() {
        let job = StoredJob::new(&info("task"));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["chatId"], 42);
        assert_eq!(value["messageId"], 9);
        assert_eq!(value["status"], "running");
        assert!(value.get("startedAt").is_some());
        assert!(value.get("completedAt").is_none());
    }

    #[tokio::test]
    async fn target_persists_tree_and_final_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path()));
        let output = Output::new(vec![Arc::new(JobStoreTarget::new(Arc::clone(&store)))]);
        let job = info("sum");
        let message = output.send_message(&job, "Processing...");

        let root = message.create_block(CallKind::Agent, "math_agent", Some(json!("sum")));
        let tool = root.add_child(CallKind::Tool, "add_numbers", Some(json!({"a": 2, "b": 3})));
        tool.complete(Some(json!({"sum": 5})));
        root.append_reasoning("adding");
        root.append_text("5");
        root.complete(Some(json!("5")));
        message
            .finish(&JobOutcome::Completed {
                text: "5".to_string(),
            })
            .await;

        let stored = store.load(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.task, "sum");
        let root = &stored.blocks[0];
        assert_eq!(root.kind, CallKind::Agent);
        assert_eq!(root.task.as_deref(), Some("sum"));
        assert_eq!(root.thinking.as_deref(), Some("adding"));
        assert_eq!(root.output, Some(json!("5")));
        assert_eq!(root.children[0].name, "add_numbers");
        assert_eq!(root.children[0].output, Some(json!({"sum": 5})));
        assert_eq!(root.children[0].state, CallState::Completed);
    }
}
