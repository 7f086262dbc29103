use async_trait::async_trait;
use serde_json::json;

use super::{AdapterError, CallbackOutcome, CreateLinkInput, PaymentLink, ProviderAdapter};
use crate::domain::Provider;

/// Reserved slot for the VNPay integration. Every call fails with a typed
/// unsupported-provider error until the integration lands.
pub struct VnPayAdapter;

impl VnPayAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VnPayAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for VnPayAdapter {
    fn provider(&self) -> Provider {
        Provider::Vnpay
    }

    async fn create_payment_link(
        &self,
        _input: &CreateLinkInput,
    ) -> Result<PaymentLink, AdapterError> {
        Err(AdapterError::Unsupported(Provider::Vnpay))
    }

    fn handle_callback(&self, _raw_body: &[u8]) -> CallbackOutcome {
        CallbackOutcome {
            success: false,
            provider_transaction_id: None,
            response: json!({ "error": -1, "message": "VNPAY is not supported" }),
        }
    }
}
