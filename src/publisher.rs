use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusMessage, EventBus};
use crate::config::OutboxConfig;
use crate::domain::OutboxRecord;
use crate::metrics::Metrics;
use crate::store::{OutboxQueue, StoreError};

pub const EVENT_VERSION: &str = "1.0";
pub const EVENT_SOURCE: &str = "payment-service";

const EXHAUSTED_SCAN_INTERVAL: Duration = Duration::from_secs(3600);
const CLEANUP_HOUR: u32 = 2;

/// Event type → bus topic. An unroutable event type is a deployment bug, not
/// a data bug; the record burns through its retry budget and surfaces in the
/// exhausted scan.
pub fn topic_for(event_type: &str) -> Option<&'static str> {
    match event_type {
        "PaymentCompleted" => Some("payment.completed"),
        "PaymentFailed" => Some("payment.failed"),
        "PaymentCancelled" => Some("payment.cancelled"),
        _ => None,
    }
}

/// Polls the outbox and relays pending events to the bus. One logical
/// producer per process; ticks run strictly serially behind the guard.
pub struct OutboxPublisher {
    outbox: Arc<dyn OutboxQueue>,
    bus: Arc<dyn EventBus>,
    config: OutboxConfig,
    metrics: Arc<Metrics>,
    is_processing: AtomicBool,
}

impl OutboxPublisher {
    pub fn new(
        outbox: Arc<dyn OutboxQueue>,
        bus: Arc<dyn EventBus>,
        config: OutboxConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            outbox,
            bus,
            config,
            metrics,
            is_processing: AtomicBool::new(false),
        }
    }

    fn headers_for(record: &OutboxRecord) -> Vec<(String, String)> {
        vec![
            ("messageId".to_string(), Uuid::new_v4().to_string()),
            ("timestamp".to_string(), Utc::now().to_rfc3339()),
            ("source".to_string(), EVENT_SOURCE.to_string()),
            ("eventType".to_string(), record.event_type.clone()),
            ("eventVersion".to_string(), EVENT_VERSION.to_string()),
            ("correlationId".to_string(), record.aggregate_id.clone()),
        ]
    }

    /// One polling pass. Skips (does not queue) when the previous tick is
    /// still running.
    pub async fn tick(&self) {
        if self.is_processing.swap(true, Ordering::SeqCst) {
            debug!("previous tick still running, skipping");
            return;
        }
        if let Err(err) = self.process_batch().await {
            error!(error = %err, "outbox tick failed");
        }
        self.is_processing.store(false, Ordering::SeqCst);
    }

    async fn process_batch(&self) -> Result<(), StoreError> {
        let batch = self
            .outbox
            .fetch_unpublished(self.config.batch_size, self.config.max_retries)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!(count = batch.len(), "publishing outbox batch");

        for record in batch {
            let Some(topic) = topic_for(&record.event_type) else {
                warn!(
                    id = %record.id,
                    event_type = %record.event_type,
                    "unknown event type"
                );
                self.outbox
                    .increment_retry(record.id, "Unknown event type")
                    .await?;
                continue;
            };

            let payload = match serde_json::to_vec(&record.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    self.outbox
                        .increment_retry(record.id, &err.to_string())
                        .await?;
                    continue;
                }
            };

            let message = BusMessage {
                topic: topic.to_string(),
                key: record.aggregate_id.clone(),
                payload,
                headers: Self::headers_for(&record),
            };

            match self.bus.publish(&message).await {
                Ok(()) => {
                    self.outbox.mark_published(record.id).await?;
                    self.metrics.events_published.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %record.id, topic, "outbox record published");
                }
                Err(err) => {
                    self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(id = %record.id, error = %err, "publish failed, will retry");
                    self.outbox
                        .increment_retry(record.id, &err.to_string())
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Main loop. A tick in flight when shutdown arrives runs to completion
    /// before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            batch_size = self.config.batch_size,
            "outbox publisher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("outbox publisher stopping");
                    break;
                }
            }
        }
    }

    pub async fn cleanup(&self) {
        match self
            .outbox
            .delete_published_older_than(self.config.retention_days)
            .await
        {
            Ok(deleted) => {
                self.metrics.outbox_cleaned.fetch_add(deleted, Ordering::Relaxed);
                info!(deleted, retention_days = self.config.retention_days, "outbox cleanup finished");
            }
            Err(err) => error!(error = %err, "outbox cleanup failed"),
        }
    }

    /// Daily cleanup at the configured wall-clock hour.
    pub async fn run_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let wait = duration_until_local(CLEANUP_HOUR, 0);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.cleanup().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    pub async fn scan_exhausted(&self) {
        match self.outbox.fetch_exhausted(self.config.max_retries).await {
            Ok(records) => {
                self.metrics
                    .exhausted_records
                    .store(records.len() as u64, Ordering::Relaxed);
                if !records.is_empty() {
                    let ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
                    warn!(
                        count = records.len(),
                        ids = ?ids,
                        "outbox records exhausted their retry budget"
                    );
                }
            }
            Err(err) => error!(error = %err, "exhausted scan failed"),
        }
    }

    pub async fn run_exhausted_scan(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(EXHAUSTED_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan_exhausted().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

fn duration_until_local(hour: u32, minute: u32) -> Duration {
    let now = Local::now().naive_local();
    let today_target = now
        .date()
        .and_hms_opt(hour, minute, 0)
        .expect("valid wall-clock time");
    let target = if now < today_target {
        today_target
    } else {
        today_target + chrono::Duration::days(1)
    };
    (target - now).to_std().unwrap_or(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::bus::InMemoryBus;
    use crate::store::outbox::truncate_error;

    /// Outbox double with the same visible semantics as the Postgres store.
    #[derive(Default)]
    struct MemoryOutbox {
        rows: Mutex<Vec<OutboxRecord>>,
    }

    impl MemoryOutbox {
        fn push(&self, record: OutboxRecord) {
            self.rows.lock().unwrap().push(record);
        }

        fn get(&self, id: Uuid) -> OutboxRecord {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .expect("record exists")
        }

        fn len(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OutboxQueue for MemoryOutbox {
        async fn fetch_unpublished(
            &self,
            limit: i64,
            max_retries: i32,
        ) -> Result<Vec<OutboxRecord>, StoreError> {
            let mut rows: Vec<OutboxRecord> = self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| !r.published && r.retry_count < max_retries)
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            rows.truncate(limit as usize);
            Ok(rows)
        }

        async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
                row.published = true;
                row.published_at = Some(Utc::now());
            }
            Ok(())
        }

        async fn increment_retry(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
                row.retry_count += 1;
                row.last_error = Some(truncate_error(error).to_string());
            }
            Ok(())
        }

        async fn delete_published_older_than(&self, days: i64) -> Result<u64, StoreError> {
            let horizon = Utc::now() - chrono::Duration::days(days);
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| !(r.published && r.published_at.map_or(false, |at| at < horizon)));
            Ok((before - rows.len()) as u64)
        }

        async fn fetch_exhausted(&self, max_retries: i32) -> Result<Vec<OutboxRecord>, StoreError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| !r.published && r.retry_count >= max_retries)
                .cloned()
                .collect())
        }
    }

    fn record(event_type: &str, created_at: DateTime<Utc>) -> OutboxRecord {
        OutboxRecord {
            id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4().to_string(),
            aggregate_type: "Payment".to_string(),
            event_type: event_type.to_string(),
            payload: serde_json::json!({ "order_code": "o1" }),
            published: false,
            published_at: None,
            retry_count: 0,
            last_error: None,
            created_at,
        }
    }

    fn test_config() -> OutboxConfig {
        OutboxConfig {
            batch_size: 100,
            max_retries: 5,
            retention_days: 7,
            tick_interval_secs: 5,
        }
    }

    fn publisher(
        outbox: Arc<MemoryOutbox>,
        bus: Arc<InMemoryBus>,
        config: OutboxConfig,
    ) -> OutboxPublisher {
        OutboxPublisher::new(outbox, bus, config, Arc::new(Metrics::new()))
    }

    #[test]
    fn routing_table_covers_every_event_type() {
        assert_eq!(topic_for("PaymentCompleted"), Some("payment.completed"));
        assert_eq!(topic_for("PaymentFailed"), Some("payment.failed"));
        assert_eq!(topic_for("PaymentCancelled"), Some("payment.cancelled"));
        assert_eq!(topic_for("PaymentRefunded"), None);
    }

    #[tokio::test]
    async fn tick_publishes_and_marks_batch() {
        let outbox = Arc::new(MemoryOutbox::default());
        let bus = Arc::new(InMemoryBus::new());
        let completed = record("PaymentCompleted", Utc::now());
        let failed = record("PaymentFailed", Utc::now() + chrono::Duration::milliseconds(1));
        outbox.push(completed.clone());
        outbox.push(failed.clone());

        publisher(outbox.clone(), bus.clone(), test_config()).tick().await;

        let published = bus.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "payment.completed");
        assert_eq!(published[0].key, completed.aggregate_id);
        assert_eq!(published[1].topic, "payment.failed");
        assert!(outbox.get(completed.id).published);
        assert!(outbox.get(failed.id).published);
        assert!(outbox.get(completed.id).published_at.is_some());
    }

    #[tokio::test]
    async fn messages_carry_the_standard_headers() {
        let outbox = Arc::new(MemoryOutbox::default());
        let bus = Arc::new(InMemoryBus::new());
        let rec = record("PaymentCompleted", Utc::now());
        outbox.push(rec.clone());

        publisher(outbox, bus.clone(), test_config()).tick().await;

        let message = bus.published().remove(0);
        let header = |name: &str| {
            message
                .headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(header("eventType").as_deref(), Some("PaymentCompleted"));
        assert_eq!(header("eventVersion").as_deref(), Some(EVENT_VERSION));
        assert_eq!(header("source").as_deref(), Some(EVENT_SOURCE));
        assert_eq!(header("correlationId"), Some(rec.aggregate_id));
        assert!(header("messageId").is_some());
        assert!(header("timestamp").is_some());
    }

    #[tokio::test]
    async fn broker_failure_increments_retry_then_later_tick_succeeds() {
        let outbox = Arc::new(MemoryOutbox::default());
        let bus = Arc::new(InMemoryBus::new());
        let rec = record("PaymentCompleted", Utc::now());
        outbox.push(rec.clone());
        bus.fail_times(1);

        let publisher = publisher(outbox.clone(), bus.clone(), test_config());
        publisher.tick().await;

        let after_failure = outbox.get(rec.id);
        assert!(!after_failure.published);
        assert_eq!(after_failure.retry_count, 1);
        assert!(after_failure.last_error.is_some());
        assert!(bus.is_empty());

        publisher.tick().await;

        let after_recovery = outbox.get(rec.id);
        assert!(after_recovery.published);
        assert_eq!(after_recovery.retry_count, 1);
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_exhausts_and_surfaces_in_scan() {
        let outbox = Arc::new(MemoryOutbox::default());
        let bus = Arc::new(InMemoryBus::new());
        let mut config = test_config();
        config.max_retries = 3;
        let rec = record("PaymentRefunded", Utc::now());
        outbox.push(rec.clone());

        let publisher = publisher(outbox.clone(), bus.clone(), config);
        for _ in 0..4 {
            publisher.tick().await;
        }

        let stuck = outbox.get(rec.id);
        assert!(!stuck.published);
        assert_eq!(stuck.retry_count, 3);
        assert_eq!(stuck.last_error.as_deref(), Some("Unknown event type"));
        assert!(bus.is_empty());

        let exhausted = outbox.fetch_exhausted(3).await.unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].id, rec.id);

        // Cleanup only ever touches published rows.
        assert_eq!(outbox.delete_published_older_than(0).await.unwrap(), 0);
        assert_eq!(outbox.len(), 1);

        publisher.scan_exhausted().await;
    }

    #[tokio::test]
    async fn batch_preserves_creation_order() {
        let outbox = Arc::new(MemoryOutbox::default());
        let bus = Arc::new(InMemoryBus::new());
        let base = Utc::now();
        let third = record("PaymentCancelled", base + chrono::Duration::seconds(2));
        let first = record("PaymentCompleted", base);
        let second = record("PaymentFailed", base + chrono::Duration::seconds(1));
        outbox.push(third.clone());
        outbox.push(first.clone());
        outbox.push(second.clone());

        publisher(outbox, bus.clone(), test_config()).tick().await;

        let keys: Vec<String> = bus.published().into_iter().map(|m| m.key).collect();
        assert_eq!(
            keys,
            vec![first.aggregate_id, second.aggregate_id, third.aggregate_id]
        );
    }

    #[tokio::test]
    async fn cleanup_deletes_only_published_rows_past_retention() {
        let outbox = Arc::new(MemoryOutbox::default());
        let bus = Arc::new(InMemoryBus::new());

        let mut old_published = record("PaymentCompleted", Utc::now() - chrono::Duration::days(30));
        old_published.published = true;
        old_published.published_at = Some(Utc::now() - chrono::Duration::days(30));

        let mut fresh_published = record("PaymentCompleted", Utc::now());
        fresh_published.published = true;
        fresh_published.published_at = Some(Utc::now());

        let old_pending = record("PaymentFailed", Utc::now() - chrono::Duration::days(30));

        outbox.push(old_published);
        outbox.push(fresh_published);
        outbox.push(old_pending);

        publisher(outbox.clone(), bus, test_config()).cleanup().await;

        assert_eq!(outbox.len(), 2);
    }

    #[tokio::test]
    async fn batch_size_caps_a_single_tick() {
        let outbox = Arc::new(MemoryOutbox::default());
        let bus = Arc::new(InMemoryBus::new());
        let mut config = test_config();
        config.batch_size = 2;
        let base = Utc::now();
        for i in 0..3 {
            outbox.push(record(
                "PaymentCompleted",
                base + chrono::Duration::seconds(i),
            ));
        }

        let publisher = publisher(outbox, bus.clone(), config);
        publisher.tick().await;
        assert_eq!(bus.len(), 2);
        publisher.tick().await;
        assert_eq!(bus.len(), 3);
    }
}
