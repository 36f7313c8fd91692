//! Chain event bus.
//!
//! A thin wrapper over `tokio::sync::broadcast`. Publishing never blocks
//! and never fails: with no subscribers the event is simply dropped, and a
//! subscriber that falls behind sees `RecvError::Lagged` and skips ahead.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

pub const TOPIC_NEW_TAIL_BLOCK: &str = "chain.newTailBlock";
pub const TOPIC_LIB_BLOCK: &str = "chain.latestIrreversibleBlock";
pub const TOPIC_REVERT_BLOCK: &str = "chain.revertBlock";
pub const TOPIC_TRANSACTION_RESULT: &str = "chain.transactionResult";

const EVENT_BUS_CAPACITY: usize = 1024;

/// One event. `data` is JSON so external consumers need no Rust types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub data: String,
}

impl Event {
    pub fn new(topic: &str, data: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        trace!(topic = %event.topic, "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::new(TOPIC_LIB_BLOCK, "{\"height\":3}"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.topic, TOPIC_LIB_BLOCK);
        assert_eq!(ev.data, "{\"height\":3}");
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        EventBus::new().publish(Event::new(TOPIC_NEW_TAIL_BLOCK, "{}"));
    }
}
