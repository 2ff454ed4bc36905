//! OutputBroker: multiplexes per-task subprocess output to subscribers
//! without blocking the producer (`SPEC_FULL.md` §4.8).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

/// Ring buffer cap: a late subscriber receives up to this much recent
/// context immediately on subscribe.
const RING_BUFFER_CAP_BYTES: usize = 256 * 1024;
const CHANNEL_CAPACITY: usize = 1024;

/// One chunk of output, or an end-of-stream marker.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Chunk(Vec<u8>),
    Closed,
}

struct TaskChannel {
    sender: broadcast::Sender<OutputEvent>,
    ring: VecDeque<u8>,
}

impl TaskChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            ring: VecDeque::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.ring.extend(chunk);
        while self.ring.len() > RING_BUFFER_CAP_BYTES {
            self.ring.pop_front();
        }
    }
}

/// Per-task multi-consumer output channel with a small ring buffer.
#[derive(Clone, Default)]
pub struct OutputBroker {
    channels: Arc<Mutex<HashMap<String, TaskChannel>>>,
}

impl OutputBroker {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish a chunk of bytes for `task_id`. Creates the channel if
    /// this is the first chunk.
    pub async fn publish(&self, task_id: &str, chunk: &[u8]) {
        let mut channels = self.channels.lock().await;
        let entry = channels.entry(task_id.to_string()).or_insert_with(TaskChannel::new);
        entry.push(chunk);
        // A lagging/slow subscriber is dropped by `broadcast` itself
        // (it returns `Lagged` on its next recv); we never block here.
        let _ = entry.sender.send(OutputEvent::Chunk(chunk.to_vec()));
    }

    /// Subscribe to `task_id`'s output, receiving the buffered ring
    /// content immediately followed by live chunks.
    pub async fn subscribe(&self, task_id: &str) -> (Vec<u8>, broadcast::Receiver<OutputEvent>) {
        let mut channels = self.channels.lock().await;
        let entry = channels.entry(task_id.to_string()).or_insert_with(TaskChannel::new);
        (entry.ring.iter().copied().collect(), entry.sender.subscribe())
    }

    /// Current buffered content for `task_id`, empty if none.
    pub async fn snapshot(&self, task_id: &str) -> Vec<u8> {
        let channels = self.channels.lock().await;
        channels
            .get(task_id)
            .map(|c| c.ring.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Close the channel for `task_id`: pending subscribers receive an
    /// end marker, then the channel is removed.
    pub async fn close(&self, task_id: &str) {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.remove(task_id) {
            let _ = channel.sender.send(OutputEvent::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_receives_ring_buffer() {
        let broker = OutputBroker::new();
        broker.publish("t1", b"hello ").await;
        broker.publish("t1", b"world").await;
        let (buffered, _rx) = broker.subscribe("t1").await;
        assert_eq!(buffered, b"hello world");
    }

    #[tokio::test]
    async fn close_sends_end_marker() {
        let broker = OutputBroker::new();
        broker.publish("t1", b"hi").await;
        let (_buffered, mut rx) = broker.subscribe("t1").await;
        broker.close("t1").await;
        let event = rx.recv().await.expect("event");
        assert!(matches!(event, OutputEvent::Closed));
    }

    #[tokio::test]
    async fn snapshot_is_empty_when_absent() {
        let broker = OutputBroker::new();
        assert!(broker.snapshot("missing").await.is_empty());
    }
}
