use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{StoreError, Tx};
use crate::domain::{NewOutboxRecord, OutboxRecord};

/// `last_error` is capped so a chatty broker error cannot bloat the table.
const MAX_ERROR_BYTES: usize = 500;

/// Publisher-facing slice of the outbox. The Postgres store implements it;
/// tests substitute an in-memory double.
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    async fn fetch_unpublished(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError>;

    async fn increment_retry(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn delete_published_older_than(&self, days: i64) -> Result<u64, StoreError>;

    async fn fetch_exhausted(&self, max_retries: i32) -> Result<Vec<OutboxRecord>, StoreError>;
}

#[derive(FromRow)]
struct OutboxRow {
    id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    payload: serde_json::Value,
    published: bool,
    published_at: Option<DateTime<Utc>>,
    retry_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        OutboxRecord {
            id: row.id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            payload: row.payload,
            published: row.published,
            published_at: row.published_at,
            retry_count: row.retry_count,
            last_error: row.last_error,
            created_at: row.created_at,
        }
    }
}

const OUTBOX_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, payload, published, \
     published_at, retry_count, last_error, created_at";

pub fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_BYTES {
        return error;
    }
    let mut end = MAX_ERROR_BYTES;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
}

impl OutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event row inside the caller's transaction; this is the only
    /// write path, so an outbox row exists iff its payment mutation committed.
    pub async fn append(
        &self,
        tx: &mut Tx<'_>,
        record: &NewOutboxRecord,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO outbox (id, aggregate_id, aggregate_type, event_type, payload, \
             published, retry_count, created_at) \
             VALUES ($1, $2, $3, $4, $5, FALSE, 0, $6)",
        )
        .bind(id)
        .bind(&record.aggregate_id)
        .bind(&record.aggregate_type)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl OutboxQueue for OutboxStore {
    async fn fetch_unpublished(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let query = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox \
             WHERE published = FALSE AND retry_count < $1 \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&query)
            .bind(max_retries)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(OutboxRecord::from).collect())
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox SET published = TRUE, published_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox SET retry_count = retry_count + 1, last_error = $1 WHERE id = $2")
            .bind(truncate_error(error))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_published_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM outbox \
             WHERE published = TRUE AND published_at < now() - make_interval(days => $1::int)",
        )
        .bind(days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_exhausted(&self, max_retries: i32) -> Result<Vec<OutboxRecord>, StoreError> {
        let query = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox \
             WHERE published = FALSE AND retry_count >= $1 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&query)
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(OutboxRecord::from).collect())
    }
}
