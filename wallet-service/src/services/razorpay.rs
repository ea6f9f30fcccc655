//! Razorpay gateway client and payment verifier.
//!
//! Order creation goes through the Orders API. Checkout confirmations and
//! webhooks are authenticated with HMAC-SHA256 before any credit is applied.

use crate::config::RazorpayConfig;
use crate::services::error::BillingError;
use crate::services::metrics::SIGNATURE_FAILURES_TOTAL;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::utils::signature::verify_hex_signature;
use std::time::Duration;

/// Order as created by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    /// Amount in smallest currency unit.
    pub amount: u64,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: String,
}

/// Payment gateway boundary. No ledger effect.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
        notes: serde_json::Value,
    ) -> Result<GatewayOrder, BillingError>;

    /// Public key id handed to the checkout widget.
    fn key_id(&self) -> &str;
}

/// Request to create a Razorpay order.
#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    /// Amount in smallest currency unit (paise for INR).
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
    notes: serde_json::Value,
}

/// Razorpay API error response.
#[derive(Debug, Deserialize)]
struct RazorpayError {
    error: RazorpayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorDetail {
    code: String,
    description: String,
}

/// Razorpay client for interacting with the Razorpay API.
#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    key_id: String,
    key_secret: Secret<String>,
    api_base_url: String,
}

impl RazorpayClient {
    pub fn new(config: &RazorpayConfig) -> Result<Self, BillingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BillingError::Gateway(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Check if Razorpay is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.key_id.is_empty() && !self.key_secret.expose_secret().is_empty()
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
        notes: serde_json::Value,
    ) -> Result<GatewayOrder, BillingError> {
        if !self.is_configured() {
            return Err(BillingError::Gateway(
                "Razorpay credentials not configured".to_string(),
            ));
        }

        let request = CreateOrderRequest {
            amount: amount_minor,
            currency,
            receipt,
            notes,
        };

        let url = format!("{}/orders", self.api_base_url);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.key_id, Some(self.key_secret.expose_secret()))
            .json(&request)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("Order request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BillingError::Gateway(format!("Failed to read order response: {}", e)))?;

        tracing::debug!(status = %status, "Razorpay create_order response");

        if status.is_success() {
            let order: GatewayOrder = serde_json::from_str(&body)
                .map_err(|e| BillingError::Gateway(format!("Malformed order response: {}", e)))?;
            tracing::info!(
                order_id = %order.id,
                amount = order.amount,
                currency = %order.currency,
                "Razorpay order created"
            );
            Ok(order)
        } else {
            let (code, description) = match serde_json::from_str::<RazorpayError>(&body) {
                Ok(err) => (err.error.code, err.error.description),
                Err(_) => ("UNKNOWN".to_string(), body),
            };
            tracing::error!(
                status = %status,
                code = %code,
                description = %description,
                "Razorpay order creation failed"
            );
            Err(BillingError::Gateway(format!(
                "Razorpay error: {} - {}",
                code, description
            )))
        }
    }

    fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Checkout confirmation posted back by the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfirmation {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

/// Authenticates gateway callbacks. Returns booleans only; malformed input is
/// simply unverified.
#[derive(Clone)]
pub struct PaymentVerifier {
    key_secret: Secret<String>,
    webhook_secret: Secret<String>,
}

impl PaymentVerifier {
    pub fn new(key_secret: Secret<String>, webhook_secret: Secret<String>) -> Self {
        Self {
            key_secret,
            webhook_secret,
        }
    }

    pub fn from_config(config: &RazorpayConfig) -> Self {
        Self::new(config.key_secret.clone(), config.webhook_secret.clone())
    }

    /// `HMAC-SHA256(key_secret, order_id + "|" + payment_id)`, hex encoded.
    pub fn verify_payment(&self, confirmation: &PaymentConfirmation) -> bool {
        let secret = self.key_secret.expose_secret();
        if secret.is_empty()
            || confirmation.order_id.is_empty()
            || confirmation.payment_id.is_empty()
        {
            return self.reject("checkout", confirmation);
        }

        let payload = format!("{}|{}", confirmation.order_id, confirmation.payment_id);
        if verify_hex_signature(secret.as_bytes(), payload.as_bytes(), &confirmation.signature) {
            tracing::info!(
                order_id = %confirmation.order_id,
                payment_id = %confirmation.payment_id,
                "Payment signature verified"
            );
            true
        } else {
            self.reject("checkout", confirmation)
        }
    }

    /// `HMAC-SHA256(webhook_secret, raw_body)`, hex encoded.
    pub fn verify_webhook(&self, body: &[u8], signature: &str) -> bool {
        let secret = self.webhook_secret.expose_secret();
        let valid = !secret.is_empty()
            && !signature.is_empty()
            && verify_hex_signature(secret.as_bytes(), body, signature);

        if !valid {
            SIGNATURE_FAILURES_TOTAL.with_label_values(&["webhook"]).inc();
            tracing::warn!(
                target: "wallet::security",
                body_len = body.len(),
                "Webhook signature verification failed"
            );
        }
        valid
    }

    fn reject(&self, source: &str, confirmation: &PaymentConfirmation) -> bool {
        SIGNATURE_FAILURES_TOTAL.with_label_values(&[source]).inc();
        tracing::warn!(
            target: "wallet::security",
            order_id = %confirmation.order_id,
            payment_id = %confirmation.payment_id,
            "Payment signature verification failed"
        );
        false
    }
}

/// Razorpay webhook event.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub payload: WebhookPayload,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<WebhookPaymentEntity>,
    pub order: Option<WebhookOrderEntity>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPaymentEntity {
    pub entity: PaymentEntity,
}

#[derive(Debug, Deserialize)]
pub struct WebhookOrderEntity {
    pub entity: OrderEntity,
}

/// Razorpay payment entity.
#[derive(Debug, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    pub amount: u64,
    pub currency: String,
    pub status: String,
    pub order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderEntity {
    pub id: String,
    pub amount: u64,
    pub status: String,
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> Result<Self, BillingError> {
        serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidRequest(format!("Malformed webhook payload: {}", e)))
    }

    /// `(order_id, payment_id)` for events that settle a payment.
    pub fn captured_payment(&self) -> Option<(String, String)> {
        match self.event.as_str() {
            "payment.captured" | "order.paid" => {
                let payment = self.payload.payment.as_ref()?;
                let order_id = payment
                    .entity
                    .order_id
                    .clone()
                    .or_else(|| self.payload.order.as_ref().map(|o| o.entity.id.clone()))?;
                Some((order_id, payment.entity.id.clone()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::utils::signature::hmac_sha256_hex;

    fn verifier() -> PaymentVerifier {
        PaymentVerifier::new(
            Secret::new("my_secret_key".to_string()),
            Secret::new("webhook_secret".to_string()),
        )
    }

    fn confirmation(signature: String) -> PaymentConfirmation {
        PaymentConfirmation {
            order_id: "order_123".to_string(),
            payment_id: "pay_456".to_string(),
            signature,
        }
    }

    #[test]
    fn test_is_configured() {
        let config = RazorpayConfig {
            key_id: "rzp_test_123".to_string(),
            key_secret: Secret::new("test_secret".to_string()),
            webhook_secret: Secret::new("webhook_secret".to_string()),
            api_base_url: "https://api.razorpay.com/v1/".to_string(),
            timeout_secs: 5,
        };
        let client = RazorpayClient::new(&config).unwrap();
        assert!(client.is_configured());
        assert_eq!(client.key_id(), "rzp_test_123");

        let empty = RazorpayConfig {
            key_id: String::new(),
            key_secret: Secret::new(String::new()),
            ..config
        };
        assert!(!RazorpayClient::new(&empty).unwrap().is_configured());
    }

    #[test]
    fn test_payment_signature_verification() {
        let expected = hmac_sha256_hex(b"my_secret_key", b"order_123|pay_456").unwrap();
        assert!(verifier().verify_payment(&confirmation(expected)));
    }

    #[test]
    fn test_invalid_signature() {
        assert!(!verifier().verify_payment(&confirmation("invalid_signature".to_string())));
        assert!(!verifier().verify_payment(&confirmation(String::new())));
    }

    #[test]
    fn test_signature_bound_to_payment_id() {
        let other = hmac_sha256_hex(b"my_secret_key", b"order_123|pay_999").unwrap();
        assert!(!verifier().verify_payment(&confirmation(other)));
    }

    #[test]
    fn test_empty_secret_never_verifies() {
        let verifier = PaymentVerifier::new(Secret::new(String::new()), Secret::new(String::new()));
        let signature = hmac_sha256_hex(b"", b"order_123|pay_456").unwrap();
        assert!(!verifier.verify_payment(&confirmation(signature.clone())));
        assert!(!verifier.verify_webhook(b"{}", &signature));
    }

    #[test]
    fn test_webhook_signature_over_raw_body() {
        let body = br#"{"event":"payment.captured"}"#;
        let signature = hmac_sha256_hex(b"webhook_secret", body).unwrap();
        assert!(verifier().verify_webhook(body, &signature));
        assert!(!verifier().verify_webhook(br#"{"event":"payment.failed"}"#, &signature));
    }

    #[test]
    fn test_captured_payment_extraction() {
        let body = br#"{
            "entity": "event",
            "event": "payment.captured",
            "payload": {
                "payment": {"entity": {"id": "pay_1", "amount": 5000, "currency": "INR",
                                       "status": "captured", "order_id": "order_1"}}
            }
        }"#;
        let event = WebhookEvent::parse(body).unwrap();
        assert_eq!(
            event.captured_payment(),
            Some(("order_1".to_string(), "pay_1".to_string()))
        );

        let ignored = br#"{"event": "payment.failed", "payload": {}}"#;
        assert_eq!(WebhookEvent::parse(ignored).unwrap().captured_payment(), None);

        assert!(WebhookEvent::parse(b"not json").is_err());
    }
}
