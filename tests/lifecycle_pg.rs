//! Lifecycle engine tests against a real Postgres.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use turnstile::domain::{Currency, Provider};
use turnstile::engine::{CreateIntentInput, LifecycleEngine, TransitionOutcome};
use turnstile::error::PaymentError;
use turnstile::metrics::Metrics;
use turnstile::providers::{
    AdapterError, AdapterRegistry, CallbackOutcome, CreateLinkInput, PaymentLink, ProviderAdapter,
};
use turnstile::store::{self, OutboxQueue, OutboxStore, PaymentStore};

/// Deterministic stand-in for a provider; mints links without the network.
struct StubAdapter {
    provider: Provider,
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn create_payment_link(
        &self,
        input: &CreateLinkInput,
    ) -> Result<PaymentLink, AdapterError> {
        Ok(PaymentLink {
            payment_url: format!("https://pay.test/{}", input.idempotency_key),
            provider_transaction_id: format!("stub_{}", input.order_code),
        })
    }

    fn handle_callback(&self, _raw_body: &[u8]) -> CallbackOutcome {
        CallbackOutcome {
            success: false,
            provider_transaction_id: None,
            response: serde_json::json!({ "error": -1, "message": "stub" }),
        }
    }
}

async fn test_engine() -> (Arc<LifecycleEngine>, PgPool) {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL is required");
    let pool = store::connect(&database_url).await.expect("postgres connects");
    let adapters = Arc::new(AdapterRegistry::new(vec![Arc::new(StubAdapter {
        provider: Provider::Zalopay,
    }) as Arc<dyn ProviderAdapter>]));
    let engine = Arc::new(LifecycleEngine::new(
        pool.clone(),
        PaymentStore::new(pool.clone()),
        OutboxStore::new(pool.clone()),
        adapters,
        Arc::new(Metrics::new()),
    ));
    (engine, pool)
}

fn intent(order_code: &str, idempotency_key: &str) -> CreateIntentInput {
    CreateIntentInput {
        order_code: order_code.to_string(),
        amount_cents: 100_000,
        currency: Currency::Vnd,
        provider: Provider::Zalopay,
        idempotency_key: idempotency_key.to_string(),
        redirect_url: "https://shop.example/return".to_string(),
        timeout_seconds: 900,
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

async fn payment_rows_for_key(pool: &PgPool, key: &str) -> i64 {
    sqlx::query_scalar("SELECT count(*) FROM payments WHERE idempotency_key = $1")
        .bind(key)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn outbox_rows_for(pool: &PgPool, pid: &str) -> Vec<(String, bool)> {
    sqlx::query_as(
        "SELECT o.event_type, o.published FROM outbox o \
         JOIN payments p ON p.id::text = o.aggregate_id \
         WHERE p.provider_transaction_id = $1 ORDER BY o.created_at",
    )
    .bind(pid)
    .fetch_all(pool)
    .await
    .unwrap()
}

async fn status_of(pool: &PgPool, pid: &str) -> String {
    sqlx::query_scalar("SELECT status FROM payments WHERE provider_transaction_id = $1")
        .bind(pid)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires postgres (DATABASE_URL)"]
async fn repeated_creates_return_the_same_url_and_one_row() {
    let (engine, pool) = test_engine().await;
    let key = unique("k");
    let order = unique("o");

    let first = engine.create_intent(intent(&order, &key)).await.unwrap();
    let second = engine.create_intent(intent(&order, &key)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(payment_rows_for_key(&pool, &key).await, 1);
}

#[tokio::test]
#[ignore = "requires postgres (DATABASE_URL)"]
async fn concurrent_creates_converge_on_one_row() {
    let (engine, pool) = test_engine().await;
    let key = unique("k");
    let order = unique("o");

    let (a, b) = tokio::join!(
        engine.create_intent(intent(&order, &key)),
        engine.create_intent(intent(&order, &key)),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a, b);
    assert_eq!(payment_rows_for_key(&pool, &key).await, 1);
}

#[tokio::test]
#[ignore = "requires postgres (DATABASE_URL)"]
async fn duplicate_order_code_is_a_typed_error() {
    let (engine, _pool) = test_engine().await;
    let order = unique("o");

    engine
        .create_intent(intent(&order, &unique("k")))
        .await
        .unwrap();
    let err = engine
        .create_intent(intent(&order, &unique("k")))
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::DuplicateOrderCode(_)));
}

#[tokio::test]
#[ignore = "requires postgres (DATABASE_URL)"]
async fn completion_is_atomic_and_idempotent() {
    let (engine, pool) = test_engine().await;
    let order = unique("o");
    engine
        .create_intent(intent(&order, &unique("k")))
        .await
        .unwrap();
    let pid = format!("stub_{order}");

    let first = engine.complete_by_provider_tx_id(&pid).await.unwrap();
    let second = engine.complete_by_provider_tx_id(&pid).await.unwrap();

    assert_eq!(first, TransitionOutcome::Applied);
    assert_eq!(second, TransitionOutcome::Duplicate);
    assert_eq!(status_of(&pool, &pid).await, "COMPLETED");

    let rows = outbox_rows_for(&pool, &pid).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "PaymentCompleted");
    assert!(!rows[0].1);
}

#[tokio::test]
#[ignore = "requires postgres (DATABASE_URL)"]
async fn concurrent_webhooks_apply_exactly_one_transition() {
    let (engine, pool) = test_engine().await;
    let order = unique("o");
    engine
        .create_intent(intent(&order, &unique("k")))
        .await
        .unwrap();
    let pid = format!("stub_{order}");

    let (a, b) = tokio::join!(
        engine.complete_by_provider_tx_id(&pid),
        engine.complete_by_provider_tx_id(&pid),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == TransitionOutcome::Applied)
            .count(),
        1
    );
    assert_eq!(outbox_rows_for(&pool, &pid).await.len(), 1);
}

#[tokio::test]
#[ignore = "requires postgres (DATABASE_URL)"]
async fn conflicting_webhook_does_not_mutate_a_settled_payment() {
    let (engine, pool) = test_engine().await;
    let order = unique("o");
    engine
        .create_intent(intent(&order, &unique("k")))
        .await
        .unwrap();
    let pid = format!("stub_{order}");

    engine.complete_by_provider_tx_id(&pid).await.unwrap();
    let outcome = engine.fail_by_provider_tx_id(&pid, None).await.unwrap();

    assert_eq!(outcome, TransitionOutcome::Conflict);
    assert_eq!(status_of(&pool, &pid).await, "COMPLETED");
    assert_eq!(outbox_rows_for(&pool, &pid).await.len(), 1);
}

#[tokio::test]
#[ignore = "requires postgres (DATABASE_URL)"]
async fn cancellation_by_order_code_emits_the_cancelled_event() {
    let (engine, pool) = test_engine().await;
    let order = unique("o");
    engine
        .create_intent(intent(&order, &unique("k")))
        .await
        .unwrap();
    let pid = format!("stub_{order}");

    let outcome = engine.cancel_by_order_code(&order).await.unwrap();

    assert_eq!(outcome, TransitionOutcome::Applied);
    assert_eq!(status_of(&pool, &pid).await, "CANCELLED");
    let rows = outbox_rows_for(&pool, &pid).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "PaymentCancelled");
}

#[tokio::test]
#[ignore = "requires postgres (DATABASE_URL)"]
async fn webhook_for_unknown_transaction_is_not_found() {
    let (engine, _pool) = test_engine().await;
    let err = engine
        .complete_by_provider_tx_id(&unique("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::PaymentNotFound(_)));
}

#[tokio::test]
#[ignore = "requires postgres (DATABASE_URL)"]
async fn outbox_retry_bookkeeping_round_trips() {
    let (engine, pool) = test_engine().await;
    let order = unique("o");
    engine
        .create_intent(intent(&order, &unique("k")))
        .await
        .unwrap();
    let pid = format!("stub_{order}");
    engine.complete_by_provider_tx_id(&pid).await.unwrap();

    let outbox = OutboxStore::new(pool.clone());
    let batch = outbox.fetch_unpublished(1_000, 5).await.unwrap();
    let record = batch
        .iter()
        .find(|r| r.event_type == "PaymentCompleted" && r.payload["order_code"] == order.as_str())
        .expect("record visible to the publisher");

    outbox.increment_retry(record.id, "broker down").await.unwrap();
    outbox.mark_published(record.id).await.unwrap();

    let published: (bool, i32, Option<String>) = sqlx::query_as(
        "SELECT published, retry_count, last_error FROM outbox WHERE id = $1",
    )
    .bind(record.id)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert!(published.0);
    assert_eq!(published.1, 1);
    assert_eq!(published.2.as_deref(), Some("broker down"));
}
