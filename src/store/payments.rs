use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{StoreError, Tx};
use crate::domain::{Currency, Payment, PaymentStatus, Provider};

const PAYMENT_COLUMNS: &str = "id, order_code, idempotency_key, amount_cents, currency, provider, \
     provider_transaction_id, redirect_url, payment_url, status, metadata, \
     created_at, updated_at, completed_at, failed_at, cancelled_at";

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    order_code: String,
    idempotency_key: String,
    amount_cents: i64,
    currency: String,
    provider: String,
    provider_transaction_id: String,
    redirect_url: String,
    payment_url: String,
    status: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, StoreError> {
        let currency = Currency::parse(&row.currency)
            .ok_or_else(|| StoreError::Decode(format!("currency {}", row.currency)))?;
        let provider = Provider::parse(&row.provider)
            .ok_or_else(|| StoreError::Decode(format!("provider {}", row.provider)))?;
        let status = PaymentStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Decode(format!("status {}", row.status)))?;

        Ok(Payment {
            id: row.id,
            order_code: row.order_code,
            idempotency_key: row.idempotency_key,
            amount_cents: row.amount_cents,
            currency,
            provider,
            provider_transaction_id: row.provider_transaction_id,
            redirect_url: row.redirect_url,
            payment_url: row.payment_url,
            status,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

fn map_unique_violation(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.constraint() {
            Some("payments_idempotency_key_key") => return StoreError::DuplicateIdempotencyKey,
            Some("payments_order_code_key") => return StoreError::DuplicateOrderCode,
            _ => {}
        }
    }
    StoreError::Database(err)
}

#[derive(Clone)]
pub struct PaymentStore {
    pool: PgPool,
}

impl PaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a fresh PENDING record. Uniqueness violations come back as the
    /// typed duplicate variants so callers can absorb create races.
    pub async fn insert_pending(&self, payment: &Payment) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO payments (id, order_code, idempotency_key, amount_cents, currency, \
             provider, provider_transaction_id, redirect_url, payment_url, status, metadata, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(payment.id)
        .bind(&payment.order_code)
        .bind(&payment.idempotency_key)
        .bind(payment.amount_cents)
        .bind(payment.currency.as_str())
        .bind(payment.provider.as_str())
        .bind(&payment.provider_transaction_id)
        .bind(&payment.redirect_url)
        .bind(&payment.payment_url)
        .bind(payment.status.as_str())
        .bind(&payment.metadata)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique_violation)?;
        Ok(())
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, StoreError> {
        self.find_by_column("idempotency_key", key).await
    }

    pub async fn find_by_order_code(&self, code: &str) -> Result<Option<Payment>, StoreError> {
        self.find_by_column("order_code", code).await
    }

    pub async fn find_by_provider_transaction_id(
        &self,
        pid: &str,
    ) -> Result<Option<Payment>, StoreError> {
        self.find_by_column("provider_transaction_id", pid).await
    }

    async fn find_by_column(&self, column: &str, value: &str) -> Result<Option<Payment>, StoreError> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE {column} = $1");
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Payment::try_from).transpose()
    }

    /// Row-level lock inside the caller's transaction; serializes concurrent
    /// webhooks for the same payment.
    pub async fn lock_for_update(
        &self,
        tx: &mut Tx<'_>,
        id: Uuid,
    ) -> Result<Option<Payment>, StoreError> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Payment::try_from).transpose()
    }

    /// Apply a PENDING → terminal transition inside the caller's transaction.
    /// The `status = 'PENDING'` guard protects against lost updates even if a
    /// caller skipped the row lock. Returns whether a row actually moved.
    pub async fn update_status(
        &self,
        tx: &mut Tx<'_>,
        id: Uuid,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let timestamp_column = match to {
            PaymentStatus::Completed => "completed_at",
            PaymentStatus::Failed => "failed_at",
            PaymentStatus::Cancelled => "cancelled_at",
            PaymentStatus::Pending => {
                return Err(StoreError::Decode("transition target must be terminal".into()))
            }
        };
        let query = format!(
            "UPDATE payments SET status = $1, {timestamp_column} = $2, updated_at = $2 \
             WHERE id = $3 AND status = 'PENDING'"
        );
        let result = sqlx::query(&query)
            .bind(to.as_str())
            .bind(at)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
