use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BusError, BusMessage, EventBus};

/// In-memory bus for tests and single-process experiments. Records every
/// accepted message in order and can be scripted to fail the next N
/// publishes.
#[derive(Default)]
pub struct InMemoryBus {
    messages: Mutex<Vec<BusMessage>>,
    fail_remaining: AtomicU32,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with a connection error.
    pub fn fail_times(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<BusMessage> {
        self.messages.lock().expect("bus lock").clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<BusMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().expect("bus lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(BusError::ConnectionFailed("injected failure".into()));
        }
        self.messages.lock().expect("bus lock").push(message.clone());
        Ok(())
    }

    async fn disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, key: &str) -> BusMessage {
        BusMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: b"{}".to_vec(),
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn records_messages_in_order() {
        let bus = InMemoryBus::new();
        bus.publish(&message("payment.completed", "a")).await.unwrap();
        bus.publish(&message("payment.failed", "b")).await.unwrap();

        let keys: Vec<String> = bus.published().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(bus.published_to("payment.failed").len(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_exhaust_then_recover() {
        let bus = InMemoryBus::new();
        bus.fail_times(1);

        assert!(bus.publish(&message("payment.completed", "a")).await.is_err());
        assert!(bus.publish(&message("payment.completed", "a")).await.is_ok());
        assert_eq!(bus.len(), 1);
    }
}
