use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PaymentStatus::Pending),
            "COMPLETED" => Some(PaymentStatus::Completed),
            "FAILED" => Some(PaymentStatus::Failed),
            "CANCELLED" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// The status graph is a DAG: PENDING is the only state with outgoing
    /// edges, every terminal state is immutable.
    pub fn can_transition_to(&self, to: PaymentStatus) -> bool {
        matches!(self, PaymentStatus::Pending) && to.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Provider {
    Zalopay,
    Payos,
    Vnpay,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Zalopay => "ZALOPAY",
            Provider::Payos => "PAYOS",
            Provider::Vnpay => "VNPAY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ZALOPAY" => Some(Provider::Zalopay),
            "PAYOS" => Some(Provider::Payos),
            "VNPAY" => Some(Provider::Vnpay),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Vnd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Vnd => "VND",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VND" => Some(Currency::Vnd),
            _ => None,
        }
    }
}

/// One payment attempt. Created on an idempotency miss, mutated only by the
/// lifecycle engine, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_code: String,
    pub idempotency_key: String,
    pub amount_cents: i64,
    pub currency: Currency,
    pub provider: Provider,
    pub provider_transaction_id: String,
    pub redirect_url: String,
    pub payment_url: String,
    pub status: PaymentStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    PaymentCompleted,
    PaymentFailed,
    PaymentCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentCompleted => "PaymentCompleted",
            EventType::PaymentFailed => "PaymentFailed",
            EventType::PaymentCancelled => "PaymentCancelled",
        }
    }

    /// Status a transition must land on to emit this event.
    pub fn target_status(&self) -> PaymentStatus {
        match self {
            EventType::PaymentCompleted => PaymentStatus::Completed,
            EventType::PaymentFailed => PaymentStatus::Failed,
            EventType::PaymentCancelled => PaymentStatus::Cancelled,
        }
    }
}

/// Wire shape of a business event. Field names are part of the contract and
/// stay snake_case across versions; only the timestamp matching the event
/// type is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub payment_id: Uuid,
    pub order_code: String,
    pub amount_cents: i64,
    pub currency: Currency,
    pub provider: Provider,
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl PaymentEvent {
    pub fn for_transition(payment: &Payment, event_type: EventType, at: DateTime<Utc>) -> Self {
        let mut event = Self {
            payment_id: payment.id,
            order_code: payment.order_code.clone(),
            amount_cents: payment.amount_cents,
            currency: payment.currency,
            provider: payment.provider,
            transaction_id: payment.provider_transaction_id.clone(),
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        };
        match event_type {
            EventType::PaymentCompleted => event.completed_at = Some(at),
            EventType::PaymentFailed => event.failed_at = Some(at),
            EventType::PaymentCancelled => event.cancelled_at = Some(at),
        }
        event
    }
}

/// A durable, pending business event staged in the outbox table.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outbox row to be appended inside the transaction that mutates the payment.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxRecord {
    pub fn payment_event(payment: &Payment, event_type: EventType, at: DateTime<Utc>) -> Self {
        let event = PaymentEvent::for_transition(payment, event_type, at);
        Self {
            aggregate_id: payment.id.to_string(),
            aggregate_type: "Payment".to_string(),
            event_type: event_type.as_str().to_string(),
            payload: serde_json::to_value(event).expect("payment event serializes"),
        }
    }
}
