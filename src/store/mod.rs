pub mod outbox;
pub mod payments;

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use outbox::{OutboxQueue, OutboxStore};
pub use payments::PaymentStore;

/// Transaction handle threaded through the stores so a payment mutation and
/// its outbox append commit or abort together.
pub type Tx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("idempotency key already exists")]
    DuplicateIdempotencyKey,

    #[error("order code already exists")]
    DuplicateOrderCode,

    #[error("invalid column value: {0}")]
    Decode(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Connect at boot and run embedded migrations. Boot fails loudly when the
/// database is unreachable.
pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Bounds every lifecycle transaction; a stuck statement aborts
                // with no partial effects.
                sqlx::query("SET statement_timeout = '10s'")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    Ok(pool)
}
