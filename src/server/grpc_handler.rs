use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::domain::{Currency, PaymentStatus, Provider};
use crate::engine::{CreateIntentInput, LifecycleEngine};
use crate::error::PaymentError;

pub mod proto {
    tonic::include_proto!("payment.v1");
}

use proto::payment_service_server::PaymentService as PaymentServiceTrait;
pub use proto::payment_service_server::PaymentServiceServer;
use proto::{
    CreatePaymentIntentRequest, CreatePaymentIntentResponse, GetPaymentUrlByIdempotencyKeyRequest,
    GetPaymentUrlByIdempotencyKeyResponse,
};

pub struct PaymentGrpcHandler {
    engine: Arc<LifecycleEngine>,
}

impl PaymentGrpcHandler {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine }
    }
}

fn domain_provider(value: i32) -> Result<Provider, PaymentError> {
    match proto::Provider::try_from(value) {
        Ok(proto::Provider::Zalopay) => Ok(Provider::Zalopay),
        Ok(proto::Provider::Payos) => Ok(Provider::Payos),
        Ok(proto::Provider::Vnpay) => Ok(Provider::Vnpay),
        Err(_) => Err(PaymentError::InvalidArgument(format!(
            "unknown provider value {value}"
        ))),
    }
}

fn proto_status(status: PaymentStatus) -> proto::PaymentStatus {
    match status {
        PaymentStatus::Pending => proto::PaymentStatus::Pending,
        PaymentStatus::Completed => proto::PaymentStatus::Completed,
        // The read surface only distinguishes settled-success from
        // settled-failure; a cancelled payment reports as failed.
        PaymentStatus::Failed | PaymentStatus::Cancelled => proto::PaymentStatus::Failed,
    }
}

pub(crate) fn validate_create_request(
    req: &CreatePaymentIntentRequest,
) -> Result<CreateIntentInput, PaymentError> {
    if req.order_code.trim().is_empty() {
        return Err(PaymentError::InvalidArgument("order code is required".into()));
    }
    if req.idempotency_key.trim().is_empty() {
        return Err(PaymentError::InvalidArgument(
            "idempotency key is required".into(),
        ));
    }
    if req.amount_cents <= 0 {
        return Err(PaymentError::InvalidArgument(
            "amount must be positive".into(),
        ));
    }
    let currency = Currency::parse(&req.currency).ok_or_else(|| {
        PaymentError::InvalidArgument(format!("unsupported currency {}", req.currency))
    })?;
    let provider = domain_provider(req.provider)?;
    if url::Url::parse(&req.redirect_url).is_err() {
        return Err(PaymentError::InvalidArgument(
            "redirect url must be an absolute url".into(),
        ));
    }
    if req.timeout_seconds <= 0 {
        return Err(PaymentError::InvalidArgument(
            "timeout must be positive".into(),
        ));
    }

    Ok(CreateIntentInput {
        order_code: req.order_code.clone(),
        amount_cents: req.amount_cents,
        currency,
        provider,
        idempotency_key: req.idempotency_key.clone(),
        redirect_url: req.redirect_url.clone(),
        timeout_seconds: req.timeout_seconds,
    })
}

#[tonic::async_trait]
impl PaymentServiceTrait for PaymentGrpcHandler {
    async fn create_payment_intent(
        &self,
        request: Request<CreatePaymentIntentRequest>,
    ) -> Result<Response<CreatePaymentIntentResponse>, Status> {
        let req = request.into_inner();
        debug!(order_code = %req.order_code, "create payment intent requested");
        let input = validate_create_request(&req).map_err(Status::from)?;
        let payment_url = self.engine.create_intent(input).await.map_err(Status::from)?;
        Ok(Response::new(CreatePaymentIntentResponse { payment_url }))
    }

    async fn get_payment_url_by_idempotency_key(
        &self,
        request: Request<GetPaymentUrlByIdempotencyKeyRequest>,
    ) -> Result<Response<GetPaymentUrlByIdempotencyKeyResponse>, Status> {
        let req = request.into_inner();
        if req.idempotency_key.trim().is_empty() {
            return Err(PaymentError::InvalidArgument("idempotency key is required".into()).into());
        }

        let payment = self
            .engine
            .find_by_idempotency_key(&req.idempotency_key)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(GetPaymentUrlByIdempotencyKeyResponse {
            payment_url: payment.payment_url,
            status: proto_status(payment.status) as i32,
        }))
    }
}
