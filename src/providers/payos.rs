use async_trait::async_trait;
use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{
    hmac_sha256_hex, http_client, mac_matches, AdapterError, CallbackOutcome, CreateLinkInput,
    PaymentLink, ProviderAdapter,
};
use crate::config::PayOsConfig;
use crate::domain::Provider;

/// PayOS integration. The numeric order code sent to the provider is a lossy
/// encoding of the caller order code, so the provider-assigned
/// `paymentLinkId` is kept as the provider transaction id and webhooks are
/// joined to payments through it.
pub struct PayOsAdapter {
    config: PayOsConfig,
    http: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLinkRequest {
    order_code: i64,
    amount: i64,
    description: String,
    cancel_url: String,
    return_url: String,
    expired_at: i64,
    signature: String,
}

#[derive(Deserialize)]
struct CreateLinkResponse {
    code: String,
    desc: String,
    #[serde(default)]
    data: Option<LinkData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkData {
    checkout_url: String,
    payment_link_id: String,
}

/// Webhook envelope. Success is judged by the `code` inside `data`, the part
/// the signature covers.
#[derive(Deserialize)]
struct CallbackBody {
    #[serde(default)]
    desc: String,
    data: serde_json::Value,
    signature: String,
}

fn success_response() -> serde_json::Value {
    json!({ "error": 0, "message": "Success", "data": null })
}

fn failure_response(message: &str) -> serde_json::Value {
    json!({ "error": -1, "message": message, "data": null })
}

fn failure(message: &str) -> CallbackOutcome {
    CallbackOutcome {
        success: false,
        provider_transaction_id: None,
        response: failure_response(message),
    }
}

fn alphanumeric_tail(order_code: &str) -> &str {
    let start = order_code
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_alphanumeric())
        .last()
        .map(|(i, _)| i)
        .unwrap_or(order_code.len());
    &order_code[start..]
}

fn date_component(order_code: &str, today: NaiveDate) -> i64 {
    order_code
        .split('-')
        .find(|seg| seg.len() == 8 && seg.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|seg| seg.parse().ok())
        .unwrap_or_else(|| {
            today
                .format("%y%m%d")
                .to_string()
                .parse()
                .unwrap_or_default()
        })
}

/// Deterministic numeric order code: date component shifted eight digits,
/// plus base-36 of the last five characters of the alphanumeric tail. Not
/// reversible.
pub(crate) fn build_order_code(order_code: &str, today: NaiveDate) -> i64 {
    let tail = alphanumeric_tail(order_code);
    let suffix_chars = if tail.len() > 5 {
        &tail[tail.len() - 5..]
    } else {
        tail
    };
    let suffix = i64::from_str_radix(suffix_chars, 36).unwrap_or_default();
    date_component(order_code, today) * 100_000_000 + suffix
}

fn value_to_signature_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `&`-joined `key=value` pairs in ascending key order, the form the provider
/// SDK signs.
pub(crate) fn signature_payload(data: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut keys: Vec<&String> = data.keys().collect();
    keys.sort();
    keys.iter()
        .map(|key| format!("{}={}", key, value_to_signature_string(&data[key.as_str()])))
        .collect::<Vec<_>>()
        .join("&")
}

impl PayOsAdapter {
    pub fn new(config: PayOsConfig) -> Self {
        Self {
            config,
            http: http_client(),
        }
    }

    fn request_signature(
        &self,
        amount: i64,
        cancel_url: &str,
        description: &str,
        order_code: i64,
        return_url: &str,
    ) -> String {
        let data = format!(
            "amount={amount}&cancelUrl={cancel_url}&description={description}&orderCode={order_code}&returnUrl={return_url}"
        );
        hmac_sha256_hex(&self.config.checksum_key, &data)
    }

    fn verify_callback_signature(
        &self,
        data: &serde_json::Map<String, serde_json::Value>,
        signature: &str,
    ) -> bool {
        let expected = hmac_sha256_hex(&self.config.checksum_key, &signature_payload(data));
        mac_matches(&expected, signature)
    }
}

#[async_trait]
impl ProviderAdapter for PayOsAdapter {
    fn provider(&self) -> Provider {
        Provider::Payos
    }

    async fn create_payment_link(
        &self,
        input: &CreateLinkInput,
    ) -> Result<PaymentLink, AdapterError> {
        let order_code = build_order_code(&input.order_code, Local::now().date_naive());
        let description = format!("Order {}", input.order_code);
        let expired_at = Utc::now().timestamp() + i64::from(input.timeout_seconds);
        let signature = self.request_signature(
            input.amount_cents,
            &input.redirect_url,
            &description,
            order_code,
            &input.redirect_url,
        );

        let request = CreateLinkRequest {
            order_code,
            amount: input.amount_cents,
            description,
            cancel_url: input.redirect_url.clone(),
            return_url: input.redirect_url.clone(),
            expired_at,
            signature,
        };

        let response = self
            .http
            .post(format!("{}/v2/payment-requests", self.config.endpoint))
            .header("x-client-id", &self.config.client_id)
            .header("x-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AdapterError::ProviderUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AdapterError::ProviderUnavailable(format!(
                "payos returned http {}",
                response.status()
            )));
        }

        let body: CreateLinkResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::MalformedPayload(e.to_string()))?;

        if body.code != "00" {
            return Err(AdapterError::ProviderRejected(body.desc));
        }

        let data = body
            .data
            .ok_or_else(|| AdapterError::MalformedPayload("payment link data missing".into()))?;

        debug!(payment_link_id = %data.payment_link_id, "payos payment link created");
        Ok(PaymentLink {
            payment_url: data.checkout_url,
            provider_transaction_id: data.payment_link_id,
        })
    }

    fn handle_callback(&self, raw_body: &[u8]) -> CallbackOutcome {
        let body: CallbackBody = match serde_json::from_slice(raw_body) {
            Ok(body) => body,
            Err(_) => return failure("Malformed payload"),
        };

        let Some(data) = body.data.as_object() else {
            return failure("Malformed payload");
        };

        if !self.verify_callback_signature(data, &body.signature) {
            return failure("Invalid signature");
        }

        let provider_transaction_id = data
            .get("paymentLinkId")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let success = data.get("code").and_then(|v| v.as_str()) == Some("00");
        if success {
            CallbackOutcome {
                success: true,
                provider_transaction_id,
                response: success_response(),
            }
        } else {
            let message = if body.desc.is_empty() {
                "Payment failed".to_string()
            } else {
                body.desc
            };
            CallbackOutcome {
                success: false,
                provider_transaction_id,
                response: failure_response(&message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PayOsConfig;

    fn test_adapter() -> PayOsAdapter {
        PayOsAdapter::new(PayOsConfig {
            client_id: "client".to_string(),
            api_key: "api-key".to_string(),
            checksum_key: "checksum-key".to_string(),
            endpoint: "https://api-merchant.payos.vn".to_string(),
        })
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 8).unwrap()
    }

    fn signed_callback(data: serde_json::Value, key: &str) -> Vec<u8> {
        let payload = signature_payload(data.as_object().unwrap());
        let signature = hmac_sha256_hex(key, &payload);
        serde_json::to_vec(&json!({
            "code": "00",
            "desc": "success",
            "data": data,
            "signature": signature,
        }))
        .unwrap()
    }

    #[test]
    fn order_code_matches_reference_vector() {
        let code = build_order_code("TB-TSE24-20251008-A3B7K9M2", today());
        let expected = 20_251_008 * 100_000_000 + i64::from_str_radix("7K9M2", 36).unwrap();
        assert_eq!(code, expected);
        assert_eq!(code, 2_025_100_812_702_890);
    }

    #[test]
    fn order_code_is_deterministic() {
        let a = build_order_code("TB-TSE24-20251008-A3B7K9M2", today());
        let b = build_order_code("TB-TSE24-20251008-A3B7K9M2", today());
        assert_eq!(a, b);
    }

    #[test]
    fn order_code_without_date_segment_uses_call_date() {
        let code = build_order_code("ORDER-XYZ99", today());
        let expected = 251_008 * 100_000_000 + i64::from_str_radix("XYZ99", 36).unwrap();
        assert_eq!(code, expected);
    }

    #[test]
    fn short_tails_are_encoded_whole() {
        let code = build_order_code("TB-20251008-A7", today());
        let expected = 20_251_008 * 100_000_000 + i64::from_str_radix("A7", 36).unwrap();
        assert_eq!(code, expected);
    }

    #[test]
    fn signature_payload_sorts_keys() {
        let data = json!({ "orderCode": 1, "amount": 2, "code": "00" });
        assert_eq!(
            signature_payload(data.as_object().unwrap()),
            "amount=2&code=00&orderCode=1"
        );
    }

    #[test]
    fn null_values_sign_as_empty_strings() {
        let data = json!({ "desc": null, "amount": 5 });
        assert_eq!(signature_payload(data.as_object().unwrap()), "amount=5&desc=");
    }

    #[test]
    fn valid_callback_recovers_payment_link_id() {
        let adapter = test_adapter();
        let data = json!({
            "orderCode": 2025100812702890i64,
            "amount": 100000,
            "code": "00",
            "paymentLinkId": "6bc2b8e4f0af4d"
        });
        let outcome = adapter.handle_callback(&signed_callback(data, "checksum-key"));

        assert!(outcome.success);
        assert_eq!(
            outcome.provider_transaction_id.as_deref(),
            Some("6bc2b8e4f0af4d")
        );
        assert_eq!(outcome.response["error"], 0);
        assert_eq!(outcome.response["message"], "Success");
    }

    #[test]
    fn wrong_checksum_key_is_rejected() {
        let adapter = test_adapter();
        let data = json!({ "code": "00", "paymentLinkId": "abc" });
        let outcome = adapter.handle_callback(&signed_callback(data, "wrong-key"));

        assert!(!outcome.success);
        assert!(outcome.provider_transaction_id.is_none());
        assert_eq!(outcome.response["error"], -1);
        assert_eq!(outcome.response["message"], "Invalid signature");
    }

    #[test]
    fn gateway_reported_failure_keeps_transaction_id() {
        let adapter = test_adapter();
        let data = json!({ "code": "01", "paymentLinkId": "abc" });
        let outcome = adapter.handle_callback(&signed_callback(data, "checksum-key"));

        assert!(!outcome.success);
        assert_eq!(outcome.provider_transaction_id.as_deref(), Some("abc"));
        assert_eq!(outcome.response["error"], -1);
    }

    #[test]
    fn garbage_body_is_rejected() {
        let adapter = test_adapter();
        let outcome = adapter.handle_callback(b"not json");
        assert!(!outcome.success);
        assert_eq!(outcome.response["error"], -1);
    }
}
