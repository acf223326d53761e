//! Output fan-out.
//!
//! A job's progress is written to any number of targets (a chat, the
//! console, the job store, live subscribers). `Output::send_message` opens a
//! sink on every target and returns a [`MessageHandle`] whose call tree
//! reports each change to all of them.

pub mod chat;
pub mod console;
pub mod job_store;
pub mod notifier;
pub mod render;

use std::sync::Arc;

use futures_util::future::{BoxFuture, join_all};
use serde_json::Value;

use crate::core::call_tree::{BlockHandle, CallKind, CallTree, TreeChange, TreeListener, TreeSnapshot};
use crate::core::events::FileOutput;
use crate::core::job::{FileSink, JobInfo, JobOutcome};
use crate::core::summarizer::Summarizer;

pub use chat::{ChatApi, ChatTarget};
pub use console::ConsoleTarget;
pub use job_store::{JobStore, JobStoreTarget};
pub use notifier::{JobEvent, JobNotifier, NotifierTarget};

/// A destination jobs are reported to.
pub trait OutputTarget: Send + Sync {
    /// Opens the per-job sink, showing `initial` until there is content.
    fn open(&self, job: &JobInfo, initial: &str) -> Arc<dyn MessageSink>;
}

/// Per-job view of a target. Every method defaults to doing nothing.
pub trait MessageSink: Send + Sync {
    fn append(&self, _text: &str) {}

    fn replace_with(&self, _text: &str) {}

    fn add_file(&self, _file: &FileOutput) {}

    /// Removes everything this sink has shown so far.
    fn clear(&self) {}

    /// Called under the tree lock for every tree mutation.
    fn blocks_changed(&self, _tree: &TreeSnapshot, _change: TreeChange) {}

    /// Flushes final state. Resolves once the target is up to date.
    fn finish<'a>(&'a self, _tree: &'a TreeSnapshot, _outcome: &'a JobOutcome) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

type Sinks = Arc<[Arc<dyn MessageSink>]>;

struct Fanout(Sinks);

impl TreeListener for Fanout {
    fn tree_changed(&self, tree: &TreeSnapshot, change: TreeChange) {
        for sink in self.0.iter() {
            sink.blocks_changed(tree, change);
        }
    }
}

pub struct Output {
    targets: Vec<Arc<dyn OutputTarget>>,
    summarizer: Option<Arc<Summarizer>>,
    verbose: bool,
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("targets", &self.targets.len())
            .field("summarizer", &self.summarizer.is_some())
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl Output {
    pub fn new(targets: Vec<Arc<dyn OutputTarget>>) -> Self {
        Self {
            targets,
            summarizer: None,
            verbose: false,
        }
    }

    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// In verbose mode calls are never summarized.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Opens a message on every target.
    pub fn send_message(&self, job: &JobInfo, initial: &str) -> MessageHandle {
        let sinks: Sinks = self
            .targets
            .iter()
            .map(|target| target.open(job, initial))
            .collect();
        let listener: Arc<dyn TreeListener> = Arc::new(Fanout(Arc::clone(&sinks)));
        let summarizer = self.summarizer.clone().filter(|_| !self.verbose);
        MessageHandle {
            tree: CallTree::new(Some(listener), summarizer),
            sinks,
        }
    }
}

/// One job's message across all targets.
#[derive(Clone)]
pub struct MessageHandle {
    tree: CallTree,
    sinks: Sinks,
}

impl std::fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandle")
            .field("tree", &self.tree)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl MessageHandle {
    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    pub fn append(&self, text: &str) {
        self.sinks.iter().for_each(|sink| sink.append(text));
    }

    pub fn replace_with(&self, text: &str) {
        self.sinks.iter().for_each(|sink| sink.replace_with(text));
    }

    pub fn add_file(&self, file: &FileOutput) {
        self.sinks.iter().for_each(|sink| sink.add_file(file));
    }

    pub fn clear(&self) {
        self.sinks.iter().for_each(|sink| sink.clear());
    }

    /// Adds a top-level block to the message.
    pub fn create_block(&self, kind: CallKind, name: &str, input: Option<Value>) -> BlockHandle {
        self.tree.add_root(kind, name, input)
    }

    /// File sink delivering to every target of this message.
    pub fn file_sink(&self) -> FileSink {
        let sinks = Arc::clone(&self.sinks);
        Arc::new(move |file: FileOutput| {
            for sink in sinks.iter() {
                sink.add_file(&file);
            }
        })
    }

    /// Finishes every target concurrently.
    pub async fn finish(&self, outcome: &JobOutcome) {
        let tree = self.tree.snapshot();
        join_all(self.sinks.iter().map(|sink| sink.finish(&tree, outcome))).await;
    }
}
