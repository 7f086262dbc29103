use tonic::metadata::MetadataValue;
use tonic::Status;

use crate::domain::Provider;
use crate::providers::AdapterError;
use crate::store::StoreError;

/// Metadata key carrying the back-office business code alongside the gRPC code.
pub const ERROR_CODE_KEY: &str = "x-error-code";

pub const CODE_PAYMENT_NOT_FOUND: u32 = 20000;
pub const CODE_PERMISSION_DENIED: u32 = 20403;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("payment not found: {0}")]
    PaymentNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("provider {0} is not supported")]
    UnsupportedProvider(Provider),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("callback verification failed: {0}")]
    VerificationFailed(String),

    #[error("malformed provider payload: {0}")]
    MalformedPayload(String),

    #[error("order code already in use: {0}")]
    DuplicateOrderCode(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Back-office business code, where one is defined for the kind.
    pub fn business_code(&self) -> Option<u32> {
        match self {
            PaymentError::PaymentNotFound(_) => Some(CODE_PAYMENT_NOT_FOUND),
            PaymentError::PermissionDenied(_) => Some(CODE_PERMISSION_DENIED),
            _ => None,
        }
    }
}

impl From<AdapterError> for PaymentError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::VerificationFailed(msg) => PaymentError::VerificationFailed(msg),
            AdapterError::ProviderUnavailable(msg) => PaymentError::ProviderUnavailable(msg),
            AdapterError::ProviderRejected(msg) => PaymentError::ProviderRejected(msg),
            AdapterError::MalformedPayload(msg) => PaymentError::MalformedPayload(msg),
            AdapterError::Unsupported(provider) => PaymentError::UnsupportedProvider(provider),
        }
    }
}

impl From<PaymentError> for Status {
    fn from(err: PaymentError) -> Self {
        let business_code = err.business_code();
        let mut status = match err {
            PaymentError::InvalidArgument(msg) => Status::invalid_argument(msg),
            PaymentError::PaymentNotFound(msg) => Status::not_found(msg),
            PaymentError::PermissionDenied(msg) => Status::permission_denied(msg),
            PaymentError::UnsupportedProvider(provider) => {
                Status::invalid_argument(format!("provider {provider} is not supported"))
            }
            PaymentError::DuplicateOrderCode(code) => {
                Status::already_exists(format!("order code already in use: {code}"))
            }
            other => Status::internal(other.to_string()),
        };
        if let Some(code) = business_code {
            if let Ok(value) = MetadataValue::try_from(code.to_string()) {
                status.metadata_mut().insert(ERROR_CODE_KEY, value);
            }
        }
        status
    }
}
