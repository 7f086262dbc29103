use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    pub intents_created: AtomicU64,
    pub intent_replays: AtomicU64,
    pub webhooks_received: AtomicU64,
    pub webhooks_rejected: AtomicU64,
    pub transitions_applied: AtomicU64,
    pub transition_duplicates: AtomicU64,
    pub transition_conflicts: AtomicU64,
    pub events_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub outbox_cleaned: AtomicU64,
    pub exhausted_records: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            intents_created: AtomicU64::new(0),
            intent_replays: AtomicU64::new(0),
            webhooks_received: AtomicU64::new(0),
            webhooks_rejected: AtomicU64::new(0),
            transitions_applied: AtomicU64::new(0),
            transition_duplicates: AtomicU64::new(0),
            transition_conflicts: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            outbox_cleaned: AtomicU64::new(0),
            exhausted_records: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            intents_created: self.intents_created.load(Ordering::Relaxed),
            intent_replays: self.intent_replays.load(Ordering::Relaxed),
            webhooks_received: self.webhooks_received.load(Ordering::Relaxed),
            webhooks_rejected: self.webhooks_rejected.load(Ordering::Relaxed),
            transitions_applied: self.transitions_applied.load(Ordering::Relaxed),
            transition_duplicates: self.transition_duplicates.load(Ordering::Relaxed),
            transition_conflicts: self.transition_conflicts.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            outbox_cleaned: self.outbox_cleaned.load(Ordering::Relaxed),
            exhausted_records: self.exhausted_records.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(serde::Serialize)]
pub struct MetricsSnapshot {
    pub intents_created: u64,
    pub intent_replays: u64,
    pub webhooks_received: u64,
    pub webhooks_rejected: u64,
    pub transitions_applied: u64,
    pub transition_duplicates: u64,
    pub transition_conflicts: u64,
    pub events_published: u64,
    pub publish_failures: u64,
    pub outbox_cleaned: u64,
    pub exhausted_records: u64,
}
