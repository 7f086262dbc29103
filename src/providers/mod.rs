pub mod payos;
pub mod vnpay;
pub mod zalopay;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::domain::{Currency, Provider};

pub use payos::PayOsAdapter;
pub use vnpay::VnPayAdapter;
pub use zalopay::ZaloPayAdapter;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct CreateLinkInput {
    pub amount_cents: i64,
    pub order_code: String,
    pub currency: Currency,
    pub idempotency_key: String,
    pub redirect_url: String,
    pub timeout_seconds: i32,
}

#[derive(Debug, Clone)]
pub struct PaymentLink {
    pub payment_url: String,
    pub provider_transaction_id: String,
}

/// Normalized callback verdict. `response` is the provider-shaped body the
/// ingress must return verbatim; anything else makes the provider retransmit.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub success: bool,
    pub provider_transaction_id: Option<String>,
    pub response: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider rejected: {0}")]
    ProviderRejected(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("provider {0} is not supported")]
    Unsupported(Provider),
}

/// Uniform capability set every provider integration exposes. Adapters are
/// deterministic functions of their inputs and configured keys; they never
/// touch the store and never construct business events.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn create_payment_link(&self, input: &CreateLinkInput)
        -> Result<PaymentLink, AdapterError>;

    /// Decode and verify a raw callback body. CPU-only.
    fn handle_callback(&self, raw_body: &[u8]) -> CallbackOutcome;
}

pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        Self {
            adapters: adapters
                .into_iter()
                .map(|adapter| (adapter.provider(), adapter))
                .collect(),
        }
    }

    pub fn get(&self, provider: Provider) -> Result<&Arc<dyn ProviderAdapter>, AdapterError> {
        self.adapters
            .get(&provider)
            .ok_or(AdapterError::Unsupported(provider))
    }
}

pub(crate) fn hmac_sha256_hex(key: &str, data: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of a computed hex MAC against the provider's.
pub(crate) fn mac_matches(expected_hex: &str, provided: &str) -> bool {
    let provided = provided.to_ascii_lowercase();
    expected_hex.as_bytes().ct_eq(provided.as_bytes()).into()
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(25))
        .build()
        .expect("http client builds")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_comparison_ignores_hex_case() {
        let mac = hmac_sha256_hex("key", "payload");
        assert!(mac_matches(&mac, &mac.to_ascii_uppercase()));
    }

    #[test]
    fn mac_comparison_rejects_other_keys() {
        let mac = hmac_sha256_hex("key", "payload");
        let other = hmac_sha256_hex("other", "payload");
        assert!(!mac_matches(&mac, &other));
    }
}
