//! Topic-based pub/sub between WebSocket connections of one server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use super::frame::Message;

/// Routes published frames to every connection subscribed to a topic.
///
/// Each server instance owns one hub; subscribers are addressed by connection
/// id and receive pre-encoded frames on their inbox channel.
#[derive(Debug, Default)]
pub struct TopicHub {
    topics: Mutex<HashMap<String, HashMap<u64, UnboundedSender<Bytes>>>>,
    next_id: AtomicU64,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Adds `id` to `topic`. Returns `(new_count, old_count)`.
    pub(crate) fn subscribe(&self, topic: &str, id: u64, inbox: UnboundedSender<Bytes>) -> (usize, usize) {
        let mut topics = self.topics.lock();
        let subscribers = topics.entry(topic.to_owned()).or_default();
        let old = subscribers.len();
        subscribers.insert(id, inbox);
        (subscribers.len(), old)
    }

    /// Removes `id` from `topic`. Returns `(new_count, old_count)`.
    pub(crate) fn unsubscribe(&self, topic: &str, id: u64) -> (usize, usize) {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return (0, 0);
        };
        let old = subscribers.len();
        subscribers.remove(&id);
        let new = subscribers.len();
        if new == 0 {
            topics.remove(topic);
        }
        (new, old)
    }

    /// Number of connections subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, HashMap::len)
    }

    /// Sends `message` to every subscriber of `topic`, optionally skipping the
    /// publishing connection. Returns how many connections it was queued for.
    pub fn publish(&self, topic: &str, message: &Message, except: Option<u64>) -> usize {
        let frame = message.to_frame().freeze();
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };
        // Connections whose inbox is gone have already shut down.
        subscribers.retain(|_, inbox| !inbox.is_closed());
        subscribers
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter(|(_, inbox)| inbox.send(frame.clone()).is_ok())
            .count()
    }
}
