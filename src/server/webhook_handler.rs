use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::domain::Provider;
use crate::engine::LifecycleEngine;
use crate::error::PaymentError;
use crate::metrics::Metrics;
use crate::providers::AdapterRegistry;

#[derive(Clone)]
pub struct WebhookState {
    pub engine: Arc<LifecycleEngine>,
    pub adapters: Arc<AdapterRegistry>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook/:provider", post(provider_webhook))
        .route("/webhook", post(inferred_webhook))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<WebhookState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Providers interpret anything other than their own envelope at HTTP 200 as
/// a delivery failure and retransmit, so every branch below answers 200 with
/// a provider-shaped body.
async fn provider_webhook(
    State(state): State<WebhookState>,
    Path(provider): Path<String>,
    body: Bytes,
) -> Response {
    let Some(provider) = Provider::parse(&provider.to_uppercase()) else {
        warn!(provider = %provider, "webhook for unknown provider tag");
        return ack(json!({ "error": -1, "message": "unknown provider" }));
    };
    handle(state, provider, &body).await
}

async fn inferred_webhook(State(state): State<WebhookState>, body: Bytes) -> Response {
    match infer_provider(&body) {
        Some(provider) => handle(state, provider, &body).await,
        None => {
            warn!("webhook body matches no known provider shape");
            ack(json!({ "error": -1, "message": "unrecognized callback shape" }))
        }
    }
}

/// Body-shape inference: ZaloPay posts `{data, mac, type}`, PayOS posts
/// `{code, desc, data, signature}`.
pub fn infer_provider(body: &[u8]) -> Option<Provider> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object()?;
    if object.contains_key("data") && object.contains_key("mac") && object.contains_key("type") {
        return Some(Provider::Zalopay);
    }
    if object.contains_key("code")
        && object.contains_key("desc")
        && object.contains_key("data")
        && object.contains_key("signature")
    {
        return Some(Provider::Payos);
    }
    None
}

fn ack(body: serde_json::Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

async fn handle(state: WebhookState, provider: Provider, body: &[u8]) -> Response {
    state.metrics.webhooks_received.fetch_add(1, Ordering::Relaxed);

    let adapter = match state.adapters.get(provider) {
        Ok(adapter) => adapter,
        Err(_) => {
            warn!(%provider, "webhook for provider without an adapter");
            return ack(json!({
                "error": -1,
                "message": format!("{provider} is not supported"),
            }));
        }
    };

    let outcome = adapter.handle_callback(body);

    if outcome.success {
        if let Some(pid) = &outcome.provider_transaction_id {
            match state.engine.complete_by_provider_tx_id(pid).await {
                Ok(result) => debug!(%provider, pid = %pid, ?result, "webhook completion handled"),
                Err(PaymentError::PaymentNotFound(_)) => {
                    warn!(%provider, pid = %pid, "webhook for unknown payment, acknowledging anyway");
                }
                Err(err) => {
                    error!(%provider, pid = %pid, error = %err, "failed to complete payment from webhook");
                }
            }
        }
    } else {
        state.metrics.webhooks_rejected.fetch_add(1, Ordering::Relaxed);
        if let Some(pid) = &outcome.provider_transaction_id {
            match state.engine.fail_by_provider_tx_id(pid, None).await {
                Ok(result) => debug!(%provider, pid = %pid, ?result, "webhook failure handled"),
                Err(PaymentError::PaymentNotFound(_)) => {
                    warn!(%provider, pid = %pid, "failure webhook for unknown payment");
                }
                Err(err) => {
                    error!(%provider, pid = %pid, error = %err, "failed to mark payment failed from webhook");
                }
            }
        } else {
            // Couldn't even validate the callback; nothing to mutate.
            debug!(%provider, "callback rejected before a transaction id was recovered");
        }
    }

    ack(outcome.response)
}
