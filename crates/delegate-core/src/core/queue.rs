//! Per-conversation job queue.
//!
//! Jobs sharing a `(chat_id, thread_id)` key run one after another on a
//! dedicated worker task; different keys run concurrently. A worker exits
//! once its queue is empty and is recreated by the next job for that key.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::core::job::{Job, JobOutcome, JobRunner};

/// Conversation key jobs are serialized on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
}

impl QueueKey {
    pub fn for_job(job: &Job) -> Self {
        Self {
            chat_id: job.info().chat.chat_id,
            thread_id: job.info().chat.thread_id,
        }
    }
}

type Workers = Arc<Mutex<HashMap<QueueKey, mpsc::UnboundedSender<Arc<Job>>>>>;

/// Called with each finished job.
pub type CompletionHook = Arc<dyn Fn(&Job, &JobOutcome) + Send + Sync>;

#[derive(Clone)]
pub struct JobQueue {
    runner: Arc<JobRunner>,
    workers: Workers,
    on_complete: Option<CompletionHook>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("active_workers", &self.active_workers())
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self {
            runner,
            workers: Arc::new(Mutex::new(HashMap::new())),
            on_complete: None,
        }
    }

    #[must_use]
    pub fn on_complete(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    /// Queues `job` behind earlier jobs of the same conversation.
    pub fn enqueue(&self, job: Arc<Job>) {
        let key = QueueKey::for_job(&job);
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let job = match workers.get(&key) {
            Some(sender) => match sender.send(job) {
                Ok(()) => {
                    tracing::debug!(chat_id = key.chat_id, "job queued behind running work");
                    return;
                }
                // Worker already gone; start a fresh one.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            return;
        }
        workers.insert(key, tx);
        tokio::spawn(self.clone().worker(key, rx));
    }

    /// Conversations with a live worker.
    pub fn active_workers(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn worker(self, key: QueueKey, mut rx: mpsc::UnboundedReceiver<Arc<Job>>) {
        tracing::debug!(chat_id = key.chat_id, thread_id = ?key.thread_id, "queue worker started");
        loop {
            let Some(job) = rx.recv().await else {
                break;
            };
            let outcome = self.run_isolated(&job).await;
            if let Some(hook) = &self.on_complete
                && catch_unwind(AssertUnwindSafe(|| hook(&job, &outcome))).is_err()
            {
                tracing::error!(job_id = %job.id(), "completion hook panicked");
            }

            // Enqueue holds the same lock, so nothing can slip in between
            // the emptiness check and the removal.
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            if rx.is_empty() {
                workers.remove(&key);
                break;
            }
        }
        tracing::debug!(chat_id = key.chat_id, "queue worker stopped");
    }

    /// Runs `job` on its own task so a panic fails only that job.
    async fn run_isolated(&self, job: &Arc<Job>) -> JobOutcome {
        let runner = Arc::clone(&self.runner);
        let running = Arc::clone(job);
        match tokio::spawn(async move { runner.run(&running).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = if e.is_panic() {
                    "job panicked".to_string()
                } else {
                    "job was cancelled".to_string()
                };
                tracing::error!(job_id = %job.id(), "{error}: {e}");
                job.complete();
                JobOutcome::Failed { error }
            }
        }
    }
}
