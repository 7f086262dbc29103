use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, info, warn};

use super::{BusError, BusMessage, EventBus};
use crate::config::KafkaConfig;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_DEADLINE: Duration = Duration::from_secs(30);
const CONNECT_INTERVAL: Duration = Duration::from_millis(750);

/// Single idempotent producer per process, shared across publisher ticks and
/// released only at shutdown.
pub struct KafkaEventBus {
    producer: FutureProducer,
}

impl KafkaEventBus {
    /// Build the producer and probe the cluster with bounded retry so a
    /// broker boot race does not take the service down.
    pub async fn connect(config: &KafkaConfig) -> anyhow::Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.timeout.ms", "30000")
            .set("retry.backoff.ms", "1000")
            .set("retry.backoff.max.ms", "10000")
            .set("compression.type", "lz4");

        match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                let protocol = if config.ssl { "sasl_ssl" } else { "sasl_plaintext" };
                client_config
                    .set("security.protocol", protocol)
                    .set("sasl.mechanism", "PLAIN")
                    .set("sasl.username", username)
                    .set("sasl.password", password);
            }
            _ if config.ssl => {
                client_config.set("security.protocol", "ssl");
            }
            _ => {}
        }

        let producer: FutureProducer = client_config
            .create()
            .context("failed to create kafka producer")?;

        let deadline = Instant::now() + CONNECT_DEADLINE;
        loop {
            let probe = producer.clone();
            let result = tokio::task::spawn_blocking(move || {
                probe
                    .client()
                    .fetch_metadata(None, Duration::from_secs(2))
                    .map(|_| ())
            })
            .await
            .context("metadata probe task failed")?;

            match result {
                Ok(()) => break,
                Err(err) if Instant::now() < deadline => {
                    warn!(error = %err, "kafka not reachable yet, retrying");
                    tokio::time::sleep(CONNECT_INTERVAL).await;
                }
                Err(err) => {
                    anyhow::bail!("kafka unreachable past connect deadline: {err}");
                }
            }
        }

        info!(brokers = %config.brokers, "connected to kafka");
        Ok(Self { producer })
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value),
            });
        }

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        match self.producer.send(record, PUBLISH_TIMEOUT).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %message.topic,
                    key = %message.key,
                    partition,
                    offset,
                    "message acknowledged"
                );
                Ok(())
            }
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _)) => {
                Err(BusError::Timeout)
            }
            Err((err, _message)) => Err(BusError::Rejected(err.to_string())),
        }
    }

    async fn disconnect(&self) {
        let producer = self.producer.clone();
        let result = tokio::task::spawn_blocking(move || producer.flush(Duration::from_secs(10))).await;
        match result {
            Ok(Ok(())) => info!("kafka producer flushed"),
            Ok(Err(err)) => warn!(error = %err, "kafka flush failed"),
            Err(err) => warn!(error = %err, "kafka flush task failed"),
        }
    }
}
