use async_trait::async_trait;
use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{
    hmac_sha256_hex, http_client, mac_matches, AdapterError, CallbackOutcome, CreateLinkInput,
    PaymentLink, ProviderAdapter,
};
use crate::config::ZaloPayConfig;
use crate::domain::Provider;

/// ZaloPay v2 integration. The provider transaction id is the `app_trans_id`
/// we mint at link creation; its date prefix uses the local day at call time,
/// so a webhook near midnight may carry yesterday's prefix. The suffix (the
/// caller order code) is what identifies the payment; the prefix is never
/// validated.
pub struct ZaloPayAdapter {
    config: ZaloPayConfig,
    callback_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct CreateOrderRequest {
    app_id: u32,
    app_user: String,
    app_trans_id: String,
    app_time: i64,
    amount: i64,
    item: String,
    embed_data: String,
    description: String,
    bank_code: String,
    callback_url: String,
    mac: String,
}

#[derive(Deserialize)]
struct CreateOrderResponse {
    return_code: i32,
    return_message: String,
    #[serde(default)]
    order_url: Option<String>,
}

/// Callback envelope: `data` is a JSON-encoded string inside the JSON body,
/// signed as-is with key2.
#[derive(Deserialize)]
struct CallbackBody {
    data: String,
    mac: String,
    #[serde(rename = "type")]
    callback_type: i32,
}

#[derive(Deserialize)]
struct CallbackData {
    app_trans_id: String,
}

fn success_response() -> serde_json::Value {
    json!({ "return_code": 1, "return_message": "Success" })
}

fn failure_response(message: &str) -> serde_json::Value {
    json!({ "return_code": -1, "return_message": message })
}

fn failure(message: &str) -> CallbackOutcome {
    CallbackOutcome {
        success: false,
        provider_transaction_id: None,
        response: failure_response(message),
    }
}

pub(crate) fn build_app_trans_id(order_code: &str, date: NaiveDate) -> String {
    format!("{}_{}", date.format("%y%m%d"), order_code)
}

impl ZaloPayAdapter {
    pub fn new(config: ZaloPayConfig, callback_url: String) -> Self {
        Self {
            config,
            callback_url,
            http: http_client(),
        }
    }

    fn create_mac(&self, app_trans_id: &str, amount: i64, app_time: i64, embed_data: &str, item: &str) -> String {
        let data = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.config.app_id, app_trans_id, self.config.app_user, amount, app_time, embed_data, item
        );
        hmac_sha256_hex(&self.config.key1, &data)
    }

    fn verify_callback_mac(&self, data: &str, mac: &str) -> bool {
        mac_matches(&hmac_sha256_hex(&self.config.key2, data), mac)
    }
}

#[async_trait]
impl ProviderAdapter for ZaloPayAdapter {
    fn provider(&self) -> Provider {
        Provider::Zalopay
    }

    async fn create_payment_link(
        &self,
        input: &CreateLinkInput,
    ) -> Result<PaymentLink, AdapterError> {
        let app_id: u32 = self
            .config
            .app_id
            .parse()
            .map_err(|_| AdapterError::ProviderRejected("app id is not numeric".into()))?;
        let app_trans_id = build_app_trans_id(&input.order_code, Local::now().date_naive());
        let app_time = Utc::now().timestamp_millis();
        let embed_data = json!({ "redirecturl": input.redirect_url }).to_string();
        let item = "[]".to_string();
        let mac = self.create_mac(&app_trans_id, input.amount_cents, app_time, &embed_data, &item);

        let request = CreateOrderRequest {
            app_id,
            app_user: self.config.app_user.clone(),
            app_trans_id: app_trans_id.clone(),
            app_time,
            amount: input.amount_cents,
            item,
            embed_data,
            description: format!("Payment for order {}", input.order_code),
            bank_code: String::new(),
            callback_url: self.callback_url.clone(),
            mac,
        };

        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AdapterError::ProviderUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AdapterError::ProviderUnavailable(format!(
                "zalopay returned http {}",
                response.status()
            )));
        }

        let body: CreateOrderResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::MalformedPayload(e.to_string()))?;

        if body.return_code != 1 {
            return Err(AdapterError::ProviderRejected(body.return_message));
        }

        let order_url = body
            .order_url
            .ok_or_else(|| AdapterError::MalformedPayload("order_url missing".into()))?;

        debug!(app_trans_id = %app_trans_id, "zalopay payment link created");
        Ok(PaymentLink {
            payment_url: order_url,
            provider_transaction_id: app_trans_id,
        })
    }

    fn handle_callback(&self, raw_body: &[u8]) -> CallbackOutcome {
        let body: CallbackBody = match serde_json::from_slice(raw_body) {
            Ok(body) => body,
            Err(_) => return failure("Malformed payload"),
        };

        if !self.verify_callback_mac(&body.data, &body.mac) {
            return failure("Invalid mac");
        }

        if body.callback_type != 1 {
            return failure("Unsupported callback type");
        }

        let data: CallbackData = match serde_json::from_str(&body.data) {
            Ok(data) => data,
            Err(_) => return failure("Malformed data"),
        };

        CallbackOutcome {
            success: true,
            provider_transaction_id: Some(data.app_trans_id),
            response: success_response(),
        }
    }
}
