//! In-process topic bus for lifecycle events.
//!
//! Delivery is synchronous, in subscription order, on the publishing task.
//! Listeners must not block for long; anything slow belongs on its own task.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::block::ParentBlock;

pub const TOPIC_STATE_BLOCK_HEIGHT: &str = "state.block.height";
pub const TOPIC_UPDATE_BLOCK_LATEST: &str = "update.block.latest";
pub const TOPIC_UPDATE_CHECKPOINT_START: &str = "update.checkpoint.start";
pub const TOPIC_STATE_CHECKPOINT_END: &str = "state.checkpoint.end";
pub const TOPIC_STATE_RESYNC_FAILED: &str = "state.resync.failed";
pub const TOPIC_BLOCK_MINED: &str = "block.mined";

/// Payload carried on every topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ParentBlock>,
    #[serde(default)]
    pub force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiverse: Option<Vec<ParentBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge: Option<u64>,
}

impl BusMessage {
    pub fn block(block: ParentBlock) -> Self {
        Self {
            data: Some(block),
            ..Default::default()
        }
    }

    pub fn forced(block: ParentBlock) -> Self {
        Self {
            data: Some(block),
            force: true,
            ..Default::default()
        }
    }
}

type Listener = Box<dyn Fn(&BusMessage) + Send>;

/// Handle returned from `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubHandle {
    topic: String,
    id: u64,
}

/// Topic-keyed subscriber registry. Topics are free-form strings.
#[derive(Default)]
pub struct PubSub {
    topics: HashMap<String, Vec<(u64, Listener)>>,
    next_id: u64,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, topic: &str, listener: F) -> SubHandle
    where
        F: Fn(&BusMessage) + Send + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, Box::new(listener)));
        SubHandle {
            topic: topic.to_string(),
            id,
        }
    }

    pub fn unsubscribe(&mut self, handle: &SubHandle) {
        if let Some(listeners) = self.topics.get_mut(&handle.topic) {
            listeners.retain(|(id, _)| *id != handle.id);
        }
    }

    /// Deliver to every listener of the topic, in subscription order.
    pub fn publish(&self, topic: &str, msg: &BusMessage) {
        if let Some(listeners) = self.topics.get(topic) {
            for (_, listener) in listeners {
                listener(msg);
            }
        }
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delivery_in_subscription_order() {
        let mut bus = PubSub::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe("t", move |_| order.lock().push(tag));
        }
        bus.publish("t", &BusMessage::default());
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut bus = PubSub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = {
            let hits = Arc::clone(&hits);
            bus.subscribe("t", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        bus.publish("t", &BusMessage::default());
        bus.unsubscribe(&h);
        bus.publish("t", &BusMessage::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_listeners_is_noop() {
        let bus = PubSub::new();
        bus.publish("nobody.home", &BusMessage::default());
        assert_eq!(bus.listener_count("nobody.home"), 0);
    }
}
