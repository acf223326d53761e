//! Typed pub/sub channels for output produced while an agent runs.
//!
//! Subscribers each get their own unbounded tokio mpsc queue, so a slow
//! listener never blocks the producer. A `Subscription` removes itself from
//! its channel when dropped; after that the receiver drains what was already
//! queued and then yields `None`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::call_tree::{BlockHandle, NodeId};

struct Subscribers<T> {
    next_id: u64,
    senders: Vec<(u64, mpsc::UnboundedSender<T>)>,
}

type SharedSubscribers<T> = Arc<Mutex<Subscribers<T>>>;

fn remove_subscriber<T>(subscribers: &Weak<Mutex<Subscribers<T>>>, id: u64) {
    if let Some(subscribers) = subscribers.upgrade() {
        let mut guard = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        guard.senders.retain(|(sub_id, _)| *sub_id != id);
    }
}

/// Multi-subscriber broadcast channel.
pub struct Channel<T> {
    subscribers: SharedSubscribers<T>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                senders: Vec::new(),
            })),
        }
    }
}

impl<T: Clone> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T: Clone> Channel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber. Values emitted before this call are not
    /// delivered.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = guard.next_id;
        guard.next_id += 1;
        guard.senders.push((id, tx));
        Subscription {
            id,
            receiver: rx,
            channel: Arc::downgrade(&self.subscribers),
        }
    }

    /// Delivers `value` to every live subscriber. Closed receivers are pruned.
    pub fn emit(&self, value: T) {
        let mut guard = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .senders
            .retain(|(_, tx)| tx.send(value.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .senders
            .len()
    }
}

/// Receiving end of a channel subscription.
pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    channel: Weak<Mutex<Subscribers<T>>>,
}

impl<T> Subscription<T> {
    /// Next value, or `None` once unsubscribed (or the channel is gone) and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Handle that can detach this subscription from another task.
    pub fn detacher(&self) -> Detacher
    where
        T: Send + 'static,
    {
        let channel = self.channel.clone();
        let id = self.id;
        Detacher(Arc::new(move || remove_subscriber(&channel, id)))
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        remove_subscriber(&self.channel, self.id);
    }
}

/// Removes a subscription from its channel without owning the receiver.
#[derive(Clone)]
pub struct Detacher(Arc<dyn Fn() + Send + Sync>);

impl Detacher {
    pub fn detach(&self) {
        (self.0)();
    }
}

/// Signals carried by a [`DeltaStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaSignal {
    Started,
    Delta(String),
    Ended,
}

/// Span-oriented stream of text chunks.
///
/// At most one span is open at a time; `delta` opens one implicitly and
/// `end` without an open span does nothing.
#[derive(Clone, Default)]
pub struct DeltaStream {
    channel: Channel<DeltaSignal>,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for DeltaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaStream")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl DeltaStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<DeltaSignal> {
        self.channel.subscribe()
    }

    pub fn start(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.channel.emit(DeltaSignal::Started);
        }
    }

    pub fn delta(&self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.start();
        self.channel.emit(DeltaSignal::Delta(chunk));
    }

    pub fn end(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.channel.emit(DeltaSignal::Ended);
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.channel.subscriber_count()
    }
}

/// Streams owned by a single agent run.
#[derive(Clone, Debug, Default)]
pub struct AgentStreams {
    pub reasoning: DeltaStream,
    pub output: DeltaStream,
    pub log: Channel<String>,
    pub call: Channel<NodeId>,
}

impl AgentStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total live subscriptions across all four streams.
    pub fn subscriber_count(&self) -> usize {
        self.reasoning.subscriber_count()
            + self.output.subscriber_count()
            + self.log.subscriber_count()
            + self.call.subscriber_count()
    }
}

/// Forwards a run's streams into a call node.
///
/// Dropping the proxy detaches it; `finish` also waits until everything
/// already emitted has been applied to the node.
pub struct StreamProxy {
    detachers: Vec<Detacher>,
    task: Option<JoinHandle<()>>,
}

impl StreamProxy {
    pub fn attach(streams: &AgentStreams, node: BlockHandle) -> Self {
        let mut reasoning = streams.reasoning.subscribe();
        let mut output = streams.output.subscribe();
        let mut log = streams.log.subscribe();
        let mut call = streams.call.subscribe();
        let detachers = vec![
            reasoning.detacher(),
            output.detacher(),
            log.detacher(),
            call.detacher(),
        ];

        let task = tokio::spawn(async move {
            let mut text_break = false;
            loop {
                tokio::select! {
                    biased;
                    Some(signal) = reasoning.recv() => {
                        if let DeltaSignal::Delta(chunk) = signal {
                            node.append_reasoning(&chunk);
                        }
                    }
                    Some(signal) = output.recv() => match signal {
                        DeltaSignal::Started => text_break = true,
                        DeltaSignal::Delta(chunk) => {
                            if std::mem::take(&mut text_break) && node.has_text() {
                                node.append_text("\n\n");
                            }
                            node.append_text(&chunk);
                        }
                        DeltaSignal::Ended => {}
                    },
                    Some(line) = log.recv() => node.log(line),
                    Some(child) = call.recv() => node.record_call(child),
                    else => break,
                }
            }
        });

        Self {
            detachers,
            task: Some(task),
        }
    }

    fn detach(&self) {
        for detacher in &self.detachers {
            detacher.detach();
        }
    }

    /// Detaches and waits for queued signals to be applied.
    pub async fn finish(mut self) {
        self.detach();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!("stream proxy task failed: {e}");
        }
    }
}

impl Drop for StreamProxy {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::call_tree::{CallKind, CallTree, Step};

    #[tokio::test]
    async fn channel_fans_out_to_every_subscriber() {
        let channel = Channel::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.emit(1);
        channel.emit(2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let channel: Channel<u8> = Channel::new();
        let sub = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 1);
        assert_eq!(format!("{channel:?}"), "Channel { subscribers: 1 }");
        drop(sub);
        assert_eq!(channel.subscriber_count(), 0);
        channel.emit(3);
    }

    #[tokio::test]
    async fn detached_subscription_drains_then_ends() {
        let channel = Channel::new();
        let mut sub = channel.subscribe();
        channel.emit("queued");
        sub.detacher().detach();
        channel.emit("dropped");

        assert_eq!(sub.recv().await, Some("queued"));
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn delta_stream_keeps_one_open_span() {
        let stream = DeltaStream::new();
        let mut sub = stream.subscribe();

        stream.end();
        stream.delta("a");
        stream.start();
        stream.delta("");
        stream.delta("b");
        stream.end();
        stream.end();

        let mut seen = Vec::new();
        while let Some(signal) = sub.try_recv() {
            seen.push(signal);
        }
        assert_eq!(
            seen,
            vec![
                DeltaSignal::Started,
                DeltaSignal::Delta("a".to_string()),
                DeltaSignal::Delta("b".to_string()),
                DeltaSignal::Ended,
            ]
        );
        assert!(!stream.is_open());
    }

    #[tokio::test]
    async fn proxy_forwards_into_node_and_detaches() {
        let tree = CallTree::default();
        let root = tree.add_root(CallKind::Agent, "master_agent", None);
        let child = root.add_child(CallKind::Tool, "lookup", None);
        let streams = AgentStreams::new();

        let proxy = StreamProxy::attach(&streams, root.clone());
        assert_eq!(streams.subscriber_count(), 4);

        streams.reasoning.delta("hmm");
        streams.output.delta("first");
        streams.output.end();
        streams.log.emit("looking".to_string());
        streams.call.emit(child.id());
        streams.output.delta("second");
        streams.output.end();
        proxy.finish().await;

        assert_eq!(streams.subscriber_count(), 0);
        let node = root.node().unwrap();
        assert_eq!(node.reasoning, "hmm");
        assert_eq!(node.text, "first\n\nsecond");
        assert_eq!(
            node.steps,
            vec![Step::Log("looking".to_string()), Step::Call(child.id())]
        );
    }

    #[tokio::test]
    async fn dropping_proxy_unsubscribes() {
        let tree = CallTree::default();
        let root = tree.add_root(CallKind::Agent, "a", None);
        let streams = AgentStreams::new();
        {
            let _proxy = StreamProxy::attach(&streams, root);
            assert_eq!(streams.subscriber_count(), 4);
        }
        assert_eq!(streams.subscriber_count(), 0);
    }
}
