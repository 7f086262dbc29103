pub mod kafka;
pub mod memory;

use async_trait::async_trait;

pub use kafka::KafkaEventBus;
pub use memory::InMemoryBus;

/// One message bound for a bus topic. `key` is the partition key and carries
/// the per-aggregate ordering guarantee.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("publish timed out")]
    Timeout,

    #[error("broker rejected the message: {0}")]
    Rejected(String),
}

/// Abstraction over the message bus. Kafka today; tests run against the
/// in-memory implementation.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Publish one message and wait for durable acceptance by the broker.
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError>;

    /// Flush and release the underlying producer. Called once at shutdown.
    async fn disconnect(&self);
}
