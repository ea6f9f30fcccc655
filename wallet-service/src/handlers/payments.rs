//! Recharge handlers: order creation, checkout verification and webhooks.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use validator::Validate;

use crate::{
    middleware::AccountContext,
    models::RechargeIntent,
    services::{PaymentConfirmation, WebhookOutcome},
    startup::AppState,
};

const SIGNATURE_HEADER: &str = "X-Razorpay-Signature";

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    /// Major currency units (rupees for INR).
    pub amount: Decimal,
}

/// Create a gateway order to recharge the caller's wallet.
pub async fn create_order(
    State(state): State<AppState>,
    account: AccountContext,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<RechargeIntent>), AppError> {
    let intent = state
        .recharge
        .create_recharge_intent(account.account_id, payload.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(intent)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyPaymentRequest {
    #[validate(length(min = 1, message = "order_id is required"))]
    pub order_id: String,
    #[validate(length(min = 1, message = "payment_id is required"))]
    pub payment_id: String,
    #[validate(length(min = 1, max = 256, message = "signature is required"))]
    pub signature: String,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub transaction_id: uuid::Uuid,
    pub amount: Decimal,
    pub balance: Decimal,
    pub message: String,
}

/// Verify a checkout confirmation and credit the wallet.
pub async fn verify_payment(
    State(state): State<AppState>,
    account: AccountContext,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<Json<VerifyPaymentResponse>, AppError> {
    payload.validate()?;

    let confirmation = PaymentConfirmation {
        order_id: payload.order_id,
        payment_id: payload.payment_id,
        signature: payload.signature,
    };

    let transaction = state
        .recharge
        .apply_recharge(account.account_id, &confirmation, payload.amount)
        .await?;

    Ok(Json(VerifyPaymentResponse {
        transaction_id: transaction.transaction_id,
        amount: transaction.amount,
        balance: transaction.balance_after,
        message: "Wallet recharged".to_string(),
    }))
}

/// Razorpay webhook. The signature covers the raw body, so it is read as bytes.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let outcome = state.recharge.apply_webhook(&body, signature).await?;
    let body = match outcome {
        WebhookOutcome::Applied(transaction_id) => {
            json!({ "status": "applied", "transaction_id": transaction_id })
        }
        WebhookOutcome::Ignored => json!({ "status": "ignored" }),
    };
    Ok(Json(body))
}
