use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{EventType, NewOutboxRecord, Payment, PaymentStatus};
use crate::error::PaymentError;
use crate::metrics::Metrics;
use crate::providers::{AdapterRegistry, CreateLinkInput};
use crate::store::{OutboxStore, PaymentStore, StoreError};

pub use crate::domain::{Currency, Provider};

#[derive(Debug, Clone)]
pub struct CreateIntentInput {
    pub order_code: String,
    pub amount_cents: i64,
    pub currency: Currency,
    pub provider: Provider,
    pub idempotency_key: String,
    pub redirect_url: String,
    pub timeout_seconds: i32,
}

/// What a webhook-driven transition actually did. Duplicates and conflicts
/// are acknowledged to the provider either way; the distinction only matters
/// for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Duplicate,
    Conflict,
}

/// Single writer of payment status. Owns the transactional envelope that
/// couples a status change to the outbox append.
pub struct LifecycleEngine {
    pool: PgPool,
    payments: PaymentStore,
    outbox: OutboxStore,
    adapters: Arc<AdapterRegistry>,
    metrics: Arc<Metrics>,
}

impl LifecycleEngine {
    pub fn new(
        pool: PgPool,
        payments: PaymentStore,
        outbox: OutboxStore,
        adapters: Arc<AdapterRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            payments,
            outbox,
            adapters,
            metrics,
        }
    }

    /// Create a payment intent, or replay the stored URL when the idempotency
    /// key is already known. The up-front lookup is advisory; the unique
    /// constraint is the real guarantee and the duplicate-key race is
    /// absorbed by re-reading.
    pub async fn create_intent(&self, input: CreateIntentInput) -> Result<String, PaymentError> {
        if let Some(existing) = self
            .payments
            .find_by_idempotency_key(&input.idempotency_key)
            .await?
        {
            self.metrics.intent_replays.fetch_add(1, Ordering::Relaxed);
            info!(
                payment_id = %existing.id,
                idempotency_key = %input.idempotency_key,
                "idempotent replay, returning stored payment url"
            );
            return Ok(existing.payment_url);
        }

        // Remote call, deliberately outside any transaction. An orphaned
        // provider link expires on its own timeout if the insert below loses.
        let adapter = self.adapters.get(input.provider)?;
        let link = adapter
            .create_payment_link(&CreateLinkInput {
                amount_cents: input.amount_cents,
                order_code: input.order_code.clone(),
                currency: input.currency,
                idempotency_key: input.idempotency_key.clone(),
                redirect_url: input.redirect_url.clone(),
                timeout_seconds: input.timeout_seconds,
            })
            .await?;

        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            order_code: input.order_code.clone(),
            idempotency_key: input.idempotency_key.clone(),
            amount_cents: input.amount_cents,
            currency: input.currency,
            provider: input.provider,
            provider_transaction_id: link.provider_transaction_id,
            redirect_url: input.redirect_url,
            payment_url: link.payment_url,
            status: PaymentStatus::Pending,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        };

        match self.payments.insert_pending(&payment).await {
            Ok(()) => {
                self.metrics.intents_created.fetch_add(1, Ordering::Relaxed);
                info!(
                    payment_id = %payment.id,
                    provider = %payment.provider,
                    order_code = %payment.order_code,
                    "payment intent created"
                );
                Ok(payment.payment_url)
            }
            Err(StoreError::DuplicateIdempotencyKey) => {
                let existing = self
                    .payments
                    .find_by_idempotency_key(&input.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        PaymentError::Internal("winning idempotency row disappeared".into())
                    })?;
                self.metrics.intent_replays.fetch_add(1, Ordering::Relaxed);
                info!(
                    payment_id = %existing.id,
                    idempotency_key = %input.idempotency_key,
                    "lost create race, returning winner's payment url"
                );
                Ok(existing.payment_url)
            }
            Err(StoreError::DuplicateOrderCode) => {
                Err(PaymentError::DuplicateOrderCode(input.order_code))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Payment, PaymentError> {
        self.payments
            .find_by_idempotency_key(key)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(key.to_string()))
    }

    pub async fn complete_by_provider_tx_id(
        &self,
        pid: &str,
    ) -> Result<TransitionOutcome, PaymentError> {
        let payment = self.resolve_by_provider_tx_id(pid).await?;
        self.transition(payment.id, EventType::PaymentCompleted).await
    }

    pub async fn fail_by_provider_tx_id(
        &self,
        pid: &str,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome, PaymentError> {
        let payment = self.resolve_by_provider_tx_id(pid).await?;
        if let Some(reason) = reason {
            info!(payment_id = %payment.id, reason, "provider reported failure");
        }
        self.transition(payment.id, EventType::PaymentFailed).await
    }

    pub async fn cancel_by_order_code(
        &self,
        order_code: &str,
    ) -> Result<TransitionOutcome, PaymentError> {
        let payment = self
            .payments
            .find_by_order_code(order_code)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(order_code.to_string()))?;
        self.transition(payment.id, EventType::PaymentCancelled).await
    }

    async fn resolve_by_provider_tx_id(&self, pid: &str) -> Result<Payment, PaymentError> {
        self.payments
            .find_by_provider_transaction_id(pid)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(pid.to_string()))
    }

    /// PENDING → terminal transition. The row lock serializes concurrent
    /// webhooks for the same payment; the status change and the outbox append
    /// commit together or not at all.
    async fn transition(
        &self,
        payment_id: Uuid,
        event_type: EventType,
    ) -> Result<TransitionOutcome, PaymentError> {
        let target = event_type.target_status();
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let payment = self
            .payments
            .lock_for_update(&mut tx, payment_id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(payment_id.to_string()))?;

        if payment.status == target {
            self.metrics
                .transition_duplicates
                .fetch_add(1, Ordering::Relaxed);
            info!(
                payment_id = %payment.id,
                status = payment.status.as_str(),
                "duplicate webhook, transition already applied"
            );
            return Ok(TransitionOutcome::Duplicate);
        }

        if payment.status.is_terminal() {
            self.metrics
                .transition_conflicts
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                payment_id = %payment.id,
                current = payment.status.as_str(),
                requested = target.as_str(),
                "conflicting webhook for settled payment, not mutating"
            );
            return Ok(TransitionOutcome::Conflict);
        }

        let now = Utc::now();
        let moved = self
            .payments
            .update_status(&mut tx, payment.id, target, now)
            .await?;
        if !moved {
            self.metrics
                .transition_conflicts
                .fetch_add(1, Ordering::Relaxed);
            warn!(payment_id = %payment.id, "row moved out of PENDING underneath the lock");
            return Ok(TransitionOutcome::Conflict);
        }

        let record = NewOutboxRecord::payment_event(&payment, event_type, now);
        self.outbox.append(&mut tx, &record).await?;
        tx.commit().await.map_err(StoreError::from)?;

        self.metrics
            .transitions_applied
            .fetch_add(1, Ordering::Relaxed);
        info!(
            payment_id = %payment.id,
            event = event_type.as_str(),
            "payment transition applied"
        );
        Ok(TransitionOutcome::Applied)
    }
}
