//! Line-oriented console target used by the `ask` command.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;

use crate::core::call_tree::{CallKind, CallNode, CallState, Step, TreeChange, TreeSnapshot};
use crate::core::events::FileOutput;
use crate::core::job::{JobInfo, JobOutcome};
use crate::output::render::{format_name, status_icon};
use crate::output::{MessageSink, OutputTarget};

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Prints one line per call start, terminal transition, summary and log
/// step, then the final answer.
pub struct ConsoleTarget {
    writer: SharedWriter,
    verbose: bool,
}

impl ConsoleTarget {
    pub fn new(writer: Box<dyn Write + Send>, verbose: bool) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            verbose,
        }
    }

    pub fn stdout(verbose: bool) -> Self {
        Self::new(Box::new(io::stdout()), verbose)
    }
}

impl OutputTarget for ConsoleTarget {
    fn open(&self, job: &JobInfo, _initial: &str) -> Arc<dyn MessageSink> {
        tracing::debug!(job_id = %job.id, "console output opened");
        Arc::new(ConsoleSink {
            writer: Arc::clone(&self.writer),
            verbose: self.verbose,
        })
    }
}

struct ConsoleSink {
    writer: SharedWriter,
    verbose: bool,
}

impl ConsoleSink {
    fn line(&self, line: &str) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            tracing::debug!("console write failed: {e}");
        }
    }
}

fn depth(tree: &TreeSnapshot, node: &CallNode) -> usize {
    let mut depth: usize = 0;
    let mut parent = node.parent;
    while let Some(id) = parent {
        depth += 1;
        parent = tree.node(id).and_then(|n| n.parent);
    }
    depth.saturating_sub(1)
}

fn call_line(node: &CallNode, depth: usize, icon: &str) -> String {
    format!("{}{icon} {}", "  ".repeat(depth), format_name(&node.name, node.kind))
}

impl MessageSink for ConsoleSink {
    fn add_file(&self, file: &FileOutput) {
        self.line(&format!("📎 {} ({} bytes)", file.filename, file.bytes.len()));
    }

    fn blocks_changed(&self, tree: &TreeSnapshot, change: TreeChange) {
        let Some(node) = tree.node(change.node()) else {
            return;
        };
        // Root logs sit level with the root's children.
        if let TreeChange::Step(_) = change {
            if let Some(Step::Log(log)) = node.steps.last() {
                let indent = if node.is_root() { 0 } else { depth(tree, node) + 1 };
                self.line(&format!("{}{log}", "  ".repeat(indent)));
            }
            return;
        }
        if node.is_root() || !matches!(node.kind, CallKind::Agent | CallKind::Tool) {
            return;
        }
        let depth = depth(tree, node);

        match change {
            TreeChange::Added(_) => {
                let mut line = call_line(node, depth, "...");
                if let Some(task) = node.task().filter(|_| node.kind == CallKind::Agent) {
                    line.push_str(&format!(": {task}"));
                }
                self.line(&line);
            }
            TreeChange::State(_) => {
                let mut line = call_line(node, depth, status_icon(node.state));
                if let Some(error) = &node.error {
                    line.push_str(&format!(": {error}"));
                }
                self.line(&line);
            }
            TreeChange::Summary(_) if !self.verbose => {
                if let Some(summary) = &node.summary {
                    let line = call_line(node, depth, status_icon(node.state));
                    self.line(&format!("{line}: {summary}"));
                }
            }
            _ => {}
        }
    }

    fn finish<'a>(&'a self, _tree: &'a TreeSnapshot, outcome: &'a JobOutcome) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match outcome {
                JobOutcome::Completed { text } => self.line(&format!("\n{text}")),
                JobOutcome::Failed { error } => {
                    self.line(&format!("\n{} {error}", status_icon(CallState::Error)));
                }
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

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[tokio::test]
    async fn prints_calls_and_answer() {
        let buffer = Buffer::default();
        let output = Output::new(vec![Arc::new(ConsoleTarget::new(Box::new(buffer.clone()), false))]);
        let message = output.send_message(&JobInfo::new(ChatBinding::default(), "hi"), "Processing...");

        let root = message.create_block(CallKind::Agent, "master_agent", Some(json!("hi")));
        let research = root.add_child(CallKind::Agent, "research_agent", Some(json!({"input": "dig"})));
        let lookup = research.add_child(CallKind::Tool, "lookup", None);
        lookup.log("page 1");
        lookup.fail("offline");
        research.complete(None);
        research.set_summary("Dug around");
        root.complete(None);
        message
            .finish(&JobOutcome::Completed {
                text: "Answer".to_string(),
            })
            .await;

        assert_eq!(
            buffer.text(),
            "... Research: dig\n  ... Lookup\n    page 1\n  ✖ Lookup: offline\n✓ Research\n✓ Research: Dug around\n\nAnswer\n"
        );
    }

    #[tokio::test]
    async fn root_logs_are_printed() {
        let buffer = Buffer::default();
        let output = Output::new(vec![Arc::new(ConsoleTarget::new(Box::new(buffer.clone()), true))]);
        let message = output.send_message(&JobInfo::new(ChatBinding::default(), "hi"), "Processing...");

        let root = message.create_block(CallKind::Agent, "master_agent", Some(json!("hi")));
        root.log("planning the search");
        let tool = root.add_child(CallKind::Tool, "lookup", None);
        tool.complete(None);
        root.complete(None);

        assert_eq!(buffer.text(), "planning the search\n... Lookup\n✓ Lookup\n");
    }
}
