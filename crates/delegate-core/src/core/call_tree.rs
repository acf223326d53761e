//! Execution call tree for a single job.
//!
//! Nodes are only ever appended. A node moves from `InProgress` to a terminal
//! state at most once; later attempts are ignored. Every mutation is reported
//! to the tree's listener while the tree lock is held, so listeners see
//! changes in order and must not call back into the tree.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::summarizer::Summarizer;

/// Identifier of a node, unique within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Agent,
    Tool,
    Text,
    File,
    Error,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Agent => "agent",
            CallKind::Tool => "tool",
            CallKind::Text => "text",
            CallKind::File => "file",
            CallKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    InProgress,
    Completed,
    Error,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallState::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::InProgress => "in_progress",
            CallState::Completed => "completed",
            CallState::Error => "error",
        }
    }
}

/// Entry in a node's progress timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Log(String),
    Call(NodeId),
}

#[derive(Debug, Clone)]
pub struct CallNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub kind: CallKind,
    pub state: CallState,
    pub name: String,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub reasoning: String,
    pub text: String,
    pub steps: Vec<Step>,
    pub summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub children: Vec<NodeId>,
}

impl CallNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Task text for agent nodes: the `input` string argument, or the raw
    /// string input for roots.
    pub fn task(&self) -> Option<&str> {
        match self.input.as_ref()? {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("input").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Milliseconds between start and completion.
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds())
    }
}

/// What changed in a tree mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeChange {
    Added(NodeId),
    State(NodeId),
    Output(NodeId),
    Summary(NodeId),
    Reasoning(NodeId),
    Text(NodeId),
    Step(NodeId),
}

impl TreeChange {
    pub fn node(self) -> NodeId {
        match self {
            TreeChange::Added(id)
            | TreeChange::State(id)
            | TreeChange::Output(id)
            | TreeChange::Summary(id)
            | TreeChange::Reasoning(id)
            | TreeChange::Text(id)
            | TreeChange::Step(id) => id,
        }
    }

    /// Streaming content updates, as opposed to structural changes.
    pub fn is_delta(self) -> bool {
        matches!(self, TreeChange::Reasoning(_) | TreeChange::Text(_))
    }
}

/// Read-only view of every node in a tree.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    nodes: Vec<CallNode>,
    roots: Vec<NodeId>,
}

impl TreeSnapshot {
    pub fn node(&self, id: NodeId) -> Option<&CallNode> {
        self.nodes.get(id.0)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn nodes(&self) -> &[CallNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &CallNode> {
        self.node(id)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|child| self.node(*child))
    }

    /// State rolled up over the subtree: any error wins, then any in-progress.
    pub fn effective_state(&self, id: NodeId) -> CallState {
        let Some(node) = self.node(id) else {
            return CallState::Completed;
        };
        if node.state == CallState::Error {
            return CallState::Error;
        }
        let mut state = node.state;
        for child in &node.children {
            match self.effective_state(*child) {
                CallState::Error => return CallState::Error,
                CallState::InProgress => state = CallState::InProgress,
                CallState::Completed => {}
            }
        }
        state
    }

    /// True while any root subtree is still running.
    pub fn is_in_progress(&self) -> bool {
        self.roots
            .iter()
            .any(|root| self.effective_state(*root) == CallState::InProgress)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut CallNode> {
        self.nodes.get_mut(id.0)
    }
}

/// Receives every tree mutation.
pub trait TreeListener: Send + Sync {
    fn tree_changed(&self, tree: &TreeSnapshot, change: TreeChange);
}

struct Shared {
    state: Mutex<TreeSnapshot>,
    listener: Option<Arc<dyn TreeListener>>,
    summarizer: Option<Arc<Summarizer>>,
}

/// Shared handle to a job's call tree.
#[derive(Clone)]
pub struct CallTree {
    shared: Arc<Shared>,
}

impl Default for CallTree {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl fmt::Debug for CallTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTree")
            .field("nodes", &self.snapshot().len())
            .finish_non_exhaustive()
    }
}

impl CallTree {
    pub fn new(
        listener: Option<Arc<dyn TreeListener>>,
        summarizer: Option<Arc<Summarizer>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TreeSnapshot::default()),
                listener,
                summarizer,
            }),
        }
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.lock().clone()
    }

    pub fn add_root(&self, kind: CallKind, name: &str, input: Option<Value>) -> BlockHandle {
        let id = self.add_node(None, kind, name, input);
        self.handle(id)
    }

    pub fn handle(&self, id: NodeId) -> BlockHandle {
        BlockHandle {
            tree: self.clone(),
            id,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TreeSnapshot> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, tree: &TreeSnapshot, change: TreeChange) {
        if let Some(listener) = &self.shared.listener {
            listener.tree_changed(tree, change);
        }
    }

    /// Runs `f` against the locked tree and reports the resulting change.
    fn update<R>(&self, f: impl FnOnce(&mut TreeSnapshot) -> Option<(R, TreeChange)>) -> Option<R> {
        let mut guard = self.lock();
        let (result, change) = f(&mut guard)?;
        self.notify(&guard, change);
        Some(result)
    }

    fn add_node(
        &self,
        parent: Option<NodeId>,
        kind: CallKind,
        name: &str,
        input: Option<Value>,
    ) -> NodeId {
        let mut guard = self.lock();
        let tree = &mut *guard;
        let id = NodeId(tree.nodes.len());
        let parent = parent.filter(|p| p.0 < tree.nodes.len());
        match parent {
            Some(p) => tree.nodes[p.0].children.push(id),
            None => tree.roots.push(id),
        }
        tree.nodes.push(CallNode {
            id,
            parent,
            kind,
            state: CallState::InProgress,
            name: name.to_string(),
            input,
            output: None,
            error: None,
            reasoning: String::new(),
            text: String::new(),
            steps: Vec::new(),
            summary: None,
            started_at: Utc::now(),
            completed_at: None,
            children: Vec::new(),
        });
        self.notify(&guard, TreeChange::Added(id));
        id
    }

    fn transition(
        &self,
        id: NodeId,
        state: CallState,
        output: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let changed = self
            .update(|tree| {
                let node = tree.node_mut(id)?;
                if node.state.is_terminal() {
                    return None;
                }
                node.state = state;
                node.completed_at = Some(Utc::now());
                if output.is_some() {
                    node.output = output;
                }
                if error.is_some() {
                    node.error = error;
                }
                Some(((), TreeChange::State(id)))
            })
            .is_some();

        if changed && let Some(summarizer) = &self.shared.summarizer {
            summarizer.spawn_for(&self.handle(id));
        }
        changed
    }
}

/// Handle to one node, used by the code doing the work it represents.
#[derive(Clone)]
pub struct BlockHandle {
    tree: CallTree,
    id: NodeId,
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle").field("id", &self.id).finish()
    }
}

impl BlockHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    /// Copy of the node's current content.
    pub fn node(&self) -> Option<CallNode> {
        self.tree.lock().node(self.id).cloned()
    }

    pub fn state(&self) -> CallState {
        self.tree
            .lock()
            .node(self.id)
            .map_or(CallState::Completed, |n| n.state)
    }

    pub fn effective_state(&self) -> CallState {
        self.tree.lock().effective_state(self.id)
    }

    pub fn has_text(&self) -> bool {
        self.tree
            .lock()
            .node(self.id)
            .is_some_and(|n| !n.text.is_empty())
    }

    pub fn add_child(&self, kind: CallKind, name: &str, input: Option<Value>) -> BlockHandle {
        let id = self.tree.add_node(Some(self.id), kind, name, input);
        self.tree.handle(id)
    }

    /// Stores the output without changing state.
    pub fn set_output(&self, output: Value) {
        let id = self.id;
        self.tree.update(|tree| {
            tree.node_mut(id)?.output = Some(output);
            Some(((), TreeChange::Output(id)))
        });
    }

    /// Marks the node completed. Returns false if it was already terminal.
    pub fn complete(&self, output: Option<Value>) -> bool {
        self.tree
            .transition(self.id, CallState::Completed, output, None)
    }

    /// Marks the node failed. Returns false if it was already terminal.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        self.tree
            .transition(self.id, CallState::Error, None, Some(error.into()))
    }

    pub fn log(&self, line: impl Into<String>) {
        let id = self.id;
        let line = line.into();
        self.tree.update(|tree| {
            tree.node_mut(id)?.steps.push(Step::Log(line));
            Some(((), TreeChange::Step(id)))
        });
    }

    /// Records that `child` was invoked from this node's timeline.
    pub fn record_call(&self, child: NodeId) {
        let id = self.id;
        self.tree.update(|tree| {
            let node = tree.node_mut(id)?;
            if node.steps.contains(&Step::Call(child)) {
                return None;
            }
            node.steps.push(Step::Call(child));
            Some(((), TreeChange::Step(id)))
        });
    }

    pub fn append_text(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let id = self.id;
        self.tree.update(|tree| {
            tree.node_mut(id)?.text.push_str(chunk);
            Some(((), TreeChange::Text(id)))
        });
    }

    pub fn append_reasoning(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let id = self.id;
        self.tree.update(|tree| {
            tree.node_mut(id)?.reasoning.push_str(chunk);
            Some(((), TreeChange::Reasoning(id)))
        });
    }

    pub fn set_summary(&self, summary: impl Into<String>) {
        let id = self.id;
        let summary = summary.into();
        self.tree.update(|tree| {
            tree.node_mut(id)?.summary = Some(summary);
            Some(((), TreeChange::Summary(id)))
        });
    }
}
