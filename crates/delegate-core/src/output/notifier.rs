//! Live job events for inspector subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::call_tree::{TreeChange, TreeSnapshot};
use crate::core::job::{JobInfo, JobOutcome};
use crate::output::job_store::{JobStatus, StoredBlock};
use crate::output::{MessageSink, OutputTarget};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobEvent {
    BlockUpdate { block_id: String, block: StoredBlock },
    JobComplete { status: JobStatus },
}

/// One broadcast channel per job id, created on first use and dropped
/// after the job's `job_complete` event or once its last receiver is gone.
#[derive(Debug, Default)]
pub struct JobNotifier {
    channels: Mutex<HashMap<String, broadcast::Sender<JobEvent>>>,
}

impl JobNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<JobEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<JobEvent> {
        let mut channels = self.channels();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Delivers `event` to current subscribers of `job_id`, if any.
    pub fn notify(&self, job_id: &str, event: JobEvent) {
        let mut channels = self.channels();
        let complete = matches!(event, JobEvent::JobComplete { .. });
        if let Some(sender) = channels.get(job_id) {
            // No receivers left is not an error here.
            let _ = sender.send(event);
        }
        let abandoned = channels.get(job_id).is_some_and(|sender| sender.receiver_count() == 0);
        if complete || abandoned {
            channels.remove(job_id);
        }
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.channels()
            .get(job_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of jobs with an open channel.
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }
}

/// Publishes tree changes of every job to a [`JobNotifier`].
pub struct NotifierTarget {
    hub: Arc<JobNotifier>,
}

impl NotifierTarget {
    pub fn new(hub: Arc<JobNotifier>) -> Self {
        Self { hub }
    }
}

impl OutputTarget for NotifierTarget {
    fn open(&self, job: &JobInfo, _initial: &str) -> Arc<dyn MessageSink> {
        Arc::new(NotifierSink {
            hub: Arc::clone(&self.hub),
            job_id: job.id.clone(),
        })
    }
}

struct NotifierSink {
    hub: Arc<JobNotifier>,
    job_id: String,
}

impl MessageSink for NotifierSink {
    fn blocks_changed(&self, tree: &TreeSnapshot, change: TreeChange) {
        if change.is_delta() {
            return;
        }
        let id = change.node();
        if let Some(block) = StoredBlock::from_tree(tree, id) {
            self.hub.notify(
                &self.job_id,
                JobEvent::BlockUpdate {
                    block_id: id.to_string(),
                    block,
                },
            );
        }
    }

    fn finish<'a>(&'a self, _tree: &'a TreeSnapshot, outcome: &'a JobOutcome) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.hub.notify(
                &self.job_id,
                JobEvent::JobComplete {
                    status: JobStatus::from(outcome),
                },
            );
        })
    }
}
