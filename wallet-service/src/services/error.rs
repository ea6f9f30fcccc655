//! Billing error taxonomy.

use crate::models::ConsumptionStatus;
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::retry::Retryable;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Payment verification failed: {0}")]
    Verification(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Ledger contention: {0}")]
    Contention(String),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Wallet not found for account {0}")]
    WalletNotFound(Uuid),

    #[error("Consumption request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: String,
        to: ConsumptionStatus,
    },

    #[error("Payment reference {0} is already recorded against another account")]
    DuplicatePaymentReference(String),

    #[error("Work queue is full")]
    QueueFull,

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl Retryable for BillingError {
    fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Contention(_))
    }
}

impl BillingError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::Verification(_) => "verification",
            Self::Gateway(_) => "gateway",
            Self::Contention(_) => "contention",
            Self::ConsistencyViolation(_) => "consistency_violation",
            Self::WalletNotFound(_) => "wallet_not_found",
            Self::RequestNotFound(_) => "request_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::DuplicatePaymentReference(_) => "duplicate_payment_reference",
            Self::QueueFull => "queue_full",
            Self::Store(_) => "store",
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientFunds { .. } => AppError::PaymentRequired(
                "Insufficient balance. Please recharge your wallet.".to_string(),
            ),
            BillingError::Verification(reason) => {
                tracing::debug!(reason = %reason, "Rejecting payment confirmation");
                AppError::BadRequest(anyhow::anyhow!("Payment verification failed"))
            }
            BillingError::Gateway(detail) => {
                tracing::error!(detail = %detail, "Payment gateway failure");
                AppError::BadGateway("Payment gateway unavailable".to_string())
            }
            BillingError::Contention(detail) => {
                tracing::warn!(detail = %detail, "Ledger busy after retries");
                AppError::TooManyRequests(
                    "Wallet is busy. Please try again.".to_string(),
                    Some(1),
                )
            }
            BillingError::ConsistencyViolation(detail) => {
                AppError::InternalError(anyhow::anyhow!("Consistency violation: {}", detail))
            }
            BillingError::WalletNotFound(_) => {
                AppError::NotFound(anyhow::anyhow!("Wallet not found"))
            }
            BillingError::RequestNotFound(_) => {
                AppError::NotFound(anyhow::anyhow!("Transcription not found"))
            }
            BillingError::InvalidRequest(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            BillingError::InvalidTransition { .. } => AppError::Conflict(anyhow::anyhow!(
                "Transcription is already being processed or has finished"
            )),
            BillingError::DuplicatePaymentReference(_) => {
                AppError::Conflict(anyhow::anyhow!("Payment has already been applied"))
            }
            BillingError::QueueFull => AppError::ServiceUnavailable,
            BillingError::Store(err) => AppError::DatabaseError(err),
        }
    }
}
